//! Block devices for file system development: a storage trait plus a
//! file-backed emulator and an in-memory device.
mod blockio;
mod emulator;
mod memory;

pub use blockio::{BlockNumber, BlockStorage, DEFAULT_BLOCK_SIZE};
pub use emulator::{FileBlockEmulator, FileBlockEmulatorBuilder};
pub use memory::MemoryDevice;
