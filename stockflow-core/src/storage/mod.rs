//! Object storage: key scheme, backends, and the raw payload store.

pub mod keys;
pub mod local;
pub mod memory;
pub mod object_store;
pub mod raw;

pub use keys::{KeyLayout, ObjectKey, Stage, DEFAULT_BUCKET};
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
pub use object_store::{ObjectMeta, ObjectStore};
pub use raw::RawStore;
