//! Allocation bitmaps and raw inode file handles for ext2-style filesystems.
//!
//! A [`Filesystem`] wraps a block device together with its [`Geometry`].
//! Block, inode and generic [`Bitmap`]s are built from it and track which
//! indices are in use, on a storage backend chosen per bitmap. A
//! [`FileHandle`] reads and writes the data blocks of one inode, asking a
//! [`BlockMapper`] to translate logical blocks to device blocks.
//!
//! ```no_run
//! use extalloc::{DirectMapper, FileFlags, FileHandle, Filesystem, FsFlags, Geometry};
//! use extalloc::MemoryDevice;
//!
//! # fn main() -> extalloc::Result<()> {
//! let geometry = Geometry::default();
//! let dev = MemoryDevice::new(geometry.blocks_count, geometry.block_size);
//! let fs = Filesystem::new(dev, geometry, FsFlags::RW)?;
//!
//! let mut blocks = fs.allocate_block_bitmap("block bitmap")?;
//! fs.mark_metadata_blocks(&mut blocks)?;
//!
//! let mapper = DirectMapper::new(&mut blocks);
//! let mut file = FileHandle::open(&fs, 12, FileFlags::WRITE | FileFlags::CREATE, mapper)?;
//! file.write(b"hello")?;
//! file.close()?;
//! # Ok(())
//! # }
//! ```
pub mod alloc;
pub mod error;
mod file;
mod fs;
mod mapper;
mod node;

pub use crate::alloc::{BackendKind, Bitmap, BitmapBackend, BitmapStats, Bounds};
pub use crate::error::{BitmapOp, ErrorFamily, FsError, IndexWidth, Result, Structure};
pub use crate::file::{FileFlags, FileHandle};
pub use crate::fs::{Filesystem, FsFlags, Geometry};
pub use crate::mapper::{BlockMapper, DirectMapper};
pub use crate::node::{Inode, DIRECT_BLOCKS, IND_BLOCK, NODE_SIZE};

pub use blockdev::{
    BlockNumber, BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder, MemoryDevice,
};
