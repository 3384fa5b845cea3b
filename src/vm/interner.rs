//! The string intern pool.
//!
//! Every distinct string content is represented by exactly one `Rc<str>`,
//! so runtime string equality reduces to pointer equality. The pool holds
//! weak handles only; a string whose last strong reference drops becomes
//! dead in the pool and is purged once the pool grows past a threshold that
//! doubles after each purge.

use std::collections::HashMap;
use std::rc::{Rc, Weak};

const INITIAL_PURGE_THRESHOLD: usize = 64;

pub struct Interner {
    pool: HashMap<String, Weak<str>>,
    purge_at: usize,
}

impl Interner {
    pub fn new() -> Self {
        Self {
            pool: HashMap::new(),
            purge_at: INITIAL_PURGE_THRESHOLD,
        }
    }

    /// Return the canonical `Rc<str>` for `text`, allocating one if no live
    /// entry exists.
    pub fn intern(&mut self, text: &str) -> Rc<str> {
        if let Some(weak) = self.pool.get(text) {
            if let Some(interned) = weak.upgrade() {
                return interned;
            }
        }
        let interned: Rc<str> = Rc::from(text);
        self.pool.insert(text.to_string(), Rc::downgrade(&interned));
        if self.pool.len() >= self.purge_at {
            self.purge();
        }
        interned
    }

    /// Drop dead entries and reset the purge threshold to twice the live
    /// count.
    fn purge(&mut self) {
        self.pool.retain(|_, weak| weak.strong_count() > 0);
        self.purge_at = (self.pool.len() * 2).max(INITIAL_PURGE_THRESHOLD);
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.pool
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_content_is_one_object() {
        let mut interner = Interner::new();
        let a = interner.intern("你好");
        let b = interner.intern("你好");
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_distinct_content_distinct_objects() {
        let mut interner = Interner::new();
        let a = interner.intern("甲");
        let b = interner.intern("乙");
        assert!(!Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_dead_entries_are_purged() {
        let mut interner = Interner::new();
        for i in 0..INITIAL_PURGE_THRESHOLD {
            let transient = interner.intern(&format!("字符串{}", i));
            drop(transient);
        }
        let kept = interner.intern("保留");
        // Crossing the threshold purged the dead handles.
        assert_eq!(interner.live_count(), 1);
        drop(kept);
    }

    #[test]
    fn test_reintern_after_drop_allocates_fresh() {
        let mut interner = Interner::new();
        let first = interner.intern("短命");
        let first_ptr = Rc::as_ptr(&first);
        drop(first);
        let second = interner.intern("短命");
        // The old allocation died, so a new one is made; contents match.
        assert_eq!(&*second, "短命");
        let _ = first_ptr;
    }
}
