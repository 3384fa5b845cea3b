//! Benchmarks for the bytecode VM.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use qi_lang::Vm;

const FIB: &str = "
功能 斐(n) {
    如果 (n 小 2) 返回 n;
    返回 斐(n - 1) + 斐(n - 2);
}
斐(15);
";

const LOOP_SUM: &str = "
变量 总 = 0;
对于 (变量 i = 0; i 小 10000; i++) {
    总 += i;
}
";

const STRING_CONCAT: &str = "
变量 文 = \"\";
对于 (变量 i = 0; i 小 100; i++) {
    文 = 文 + \"甲\";
}
";

fn run(source: &str) {
    let mut vm = Vm::new();
    vm.interpret(source).expect("benchmark program failed");
}

fn bench_vm(c: &mut Criterion) {
    c.bench_function("fib_15", |b| b.iter(|| run(black_box(FIB))));
    c.bench_function("loop_sum_10000", |b| b.iter(|| run(black_box(LOOP_SUM))));
    c.bench_function("string_concat_100", |b| {
        b.iter(|| run(black_box(STRING_CONCAT)))
    });
}

criterion_group!(benches, bench_vm);
criterion_main!(benches);
