pub mod storage;
pub mod thread_store;

pub use storage::{Database, RequestRecord};
pub use thread_store::{MemoryThreadStore, ThreadStore};
