use crate::Key;
use std::hash::{Hash, Hasher};

#[cfg(feature = "std-hash")]
pub mod default {
    pub use std::collections::hash_map::DefaultHasher;

    #[inline]
    pub fn new() -> DefaultHasher {
        DefaultHasher::new()
    }
}

#[cfg(not(feature = "std-hash"))]
pub mod default {
    // fixed keys: identical inputs must hash identically across passes
    pub use ahash::AHasher as DefaultHasher;

    #[inline]
    pub fn new() -> DefaultHasher {
        DefaultHasher::default()
    }
}

/// Hashes an arbitrary value into a group [`Key`].
pub fn hash_key<T: Hash + ?Sized>(value: &T) -> Key {
    let mut hasher = default::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Folds a group key into the compound key of its parent.
///
/// The rotation keeps `enter(enter(h, a), b)` distinct from
/// `enter(enter(h, b), a)`, which plain xor would not.
#[inline]
pub fn enter_compound_key(current: Key, key: Key) -> Key {
    current.rotate_left(3) ^ key
}

/// Reverses [`enter_compound_key`] when the group closes.
#[inline]
pub fn exit_compound_key(current: Key, key: Key) -> Key {
    (current ^ key).rotate_right(3)
}
