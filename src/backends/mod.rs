//! Reference storage backends.

pub mod local;
pub mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
