// kernel/src/memory/mod.rs

pub mod address_space;
pub mod frame_allocator;
pub mod page_table;

pub use address_space::{AddressSpace, MapError};
pub use frame_allocator::FramePool;
pub use page_table::PageDirectory;
