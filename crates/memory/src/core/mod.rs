//! Core configuration and traits shared by every allocator

pub mod config;
pub mod traits;

pub use config::{AllocatorConfig, MisusePolicy};
pub use traits::{BasicMemoryUsage, MemoryUsage, Resettable};
