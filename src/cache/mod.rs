mod disk;
mod index;
mod key;
mod store;

pub use disk::*;
pub use index::*;
pub use key::*;
pub use store::*;

/// Download priority for [`CacheStore::put`].
///
/// `High` starts immediately; `Normal` and `Low` wait for a slot in the
/// bounded download pool. Eviction ignores priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}
