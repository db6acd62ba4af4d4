//! Hash collections used across the runtime.
//!
//! Scope read sets and invalidation queues are keyed by small integer ids, so
//! the Fx family is the default. `std-hash` switches to the std maps for
//! targets where deterministic iteration order matters less than DoS safety.

#[cfg(feature = "std-hash")]
pub mod map {
    pub use std::collections::hash_map::Entry;
    pub use std::collections::{HashMap, HashSet};
}

#[cfg(not(feature = "std-hash"))]
pub mod map {
    pub use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
    pub use std::collections::hash_map::Entry;
}
