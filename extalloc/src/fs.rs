use std::cell::{Cell, RefCell};
use std::fmt;

use bitflags::bitflags;
use blockdev::{BlockNumber, BlockStorage};
use log::{debug, trace};
use zerocopy::{AsBytes, FromBytes};

use crate::alloc::{BackendKind, Bitmap, Bounds};
use crate::error::{ErrorFamily, FsError, IndexWidth, Result};
use crate::node::{Inode, NODE_SIZE};

bitflags! {
    /// Filesystem-wide open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FsFlags: u32 {
        /// Writes to the device are allowed.
        const RW = 0x01;
        /// Bitmaps are built with 64-bit indices.
        const BITMAPS_64 = 0x20000;
    }
}

/// Layout of the filesystem on its device.
///
/// # Layout
/// =============================================================================
/// | boot | superblock | ... | bitmaps | inode table | data blocks ...         |
/// =============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: usize,
    pub blocks_count: u64,
    /// First block tracked by the block bitmap.
    pub first_data_block: u64,
    pub blocks_per_group: u64,
    pub inodes_per_group: u32,
    /// Block holding the on-disk block bitmap.
    pub block_bitmap: u64,
    /// Block holding the on-disk inode bitmap.
    pub inode_bitmap: u64,
    /// First block of the inode table.
    pub inode_table: u64,
}

impl Default for Geometry {
    /// A small two-group filesystem of 1k blocks.
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_count: 512,
            first_data_block: 1,
            blocks_per_group: 256,
            inodes_per_group: 32,
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: 8,
        }
    }
}

impl Geometry {
    pub fn group_count(&self) -> u64 {
        let blocks = self.blocks_count - self.first_data_block;
        blocks / self.blocks_per_group + u64::from(blocks % self.blocks_per_group != 0)
    }

    pub fn inodes_count(&self) -> u32 {
        self.inodes_per_group * self.group_count() as u32
    }

    /// Blocks taken by the inode table.
    pub fn inode_table_blocks(&self) -> u64 {
        let bytes = u64::from(self.inodes_count()) * NODE_SIZE as u64;
        let block_size = self.block_size as u64;
        bytes / block_size + u64::from(bytes % block_size != 0)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |what: &str| Err(FsError::InvalidArgument(format!("geometry: {}", what)));
        if self.block_size < NODE_SIZE || self.block_size % NODE_SIZE != 0 {
            return invalid("block size must be a multiple of the inode size");
        }
        if self.blocks_per_group == 0 || self.inodes_per_group == 0 {
            return invalid("groups must hold blocks and inodes");
        }
        // A group's bitmaps each fit in one block.
        let bits_per_block = (self.block_size as u64).saturating_mul(8);
        if self.blocks_per_group > bits_per_block
            || u64::from(self.inodes_per_group) > bits_per_block
        {
            return invalid("group larger than a bitmap block can describe");
        }
        if self.first_data_block >= self.blocks_count {
            return invalid("no data blocks");
        }
        if self.group_count() > u64::from(u32::MAX / self.inodes_per_group) {
            return invalid("too many inodes");
        }
        if self.block_bitmap_real_end().is_none() {
            return invalid("block bitmap capacity overflows");
        }
        match self.inode_table.checked_add(self.inode_table_blocks()) {
            Some(table_end)
                if table_end <= self.blocks_count
                    && self.block_bitmap < self.blocks_count
                    && self.inode_bitmap < self.blocks_count => {}
            _ => return invalid("metadata lies past the last block"),
        }
        Ok(())
    }

    /// Last index the block bitmap reserves room for, rounded up to whole
    /// groups.
    fn block_bitmap_real_end(&self) -> Option<u64> {
        self.blocks_per_group
            .checked_mul(self.group_count())?
            .checked_add(self.first_data_block)?
            .checked_sub(1)
    }
}

/// An open filesystem: its geometry and the device it lives on.
///
/// Bitmaps and file handles borrow the filesystem, so they can never outlive
/// it. The device sits behind a `RefCell`; a filesystem is meant to be used
/// from one thread.
pub struct Filesystem {
    dev: RefCell<Box<dyn BlockStorage>>,
    geometry: Geometry,
    flags: FsFlags,
    default_backend: Cell<BackendKind>,
}

impl Filesystem {
    /// Opens a filesystem with `geometry` on `dev`.
    pub fn new<D: BlockStorage + 'static>(
        dev: D,
        geometry: Geometry,
        flags: FsFlags,
    ) -> Result<Self> {
        geometry.validate()?;
        if dev.block_size() != geometry.block_size {
            return Err(FsError::Device(format!(
                "device blocks are {} bytes, filesystem blocks are {}",
                dev.block_size(),
                geometry.block_size
            )));
        }
        if dev.block_count() < geometry.blocks_count {
            return Err(FsError::Device(format!(
                "device holds {} blocks, filesystem needs {}",
                dev.block_count(),
                geometry.blocks_count
            )));
        }
        debug!(
            "opened filesystem: {} blocks of {} bytes, {} inodes, flags {:?}",
            geometry.blocks_count,
            geometry.block_size,
            geometry.inodes_count(),
            flags
        );

        Ok(Self {
            dev: RefCell::new(Box::new(dev)),
            geometry,
            flags,
            default_backend: Cell::new(BackendKind::BitArray),
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn flags(&self) -> FsFlags {
        self.flags
    }

    pub fn block_size(&self) -> usize {
        self.geometry.block_size
    }

    fn check_writable(&self) -> Result<()> {
        if !self.flags.contains(FsFlags::RW) {
            return Err(FsError::ReadOnlyFilesystem);
        }
        Ok(())
    }

    pub fn read_block(&self, blocknr: BlockNumber, buf: &mut [u8]) -> Result<()> {
        trace!("read block {}", blocknr);
        self.dev
            .borrow_mut()
            .read_block(blocknr, buf)
            .map_err(|e| FsError::io(blocknr, e))
    }

    pub fn write_block(&self, blocknr: BlockNumber, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        trace!("write block {}", blocknr);
        self.dev
            .borrow_mut()
            .write_block(blocknr, buf)
            .map_err(|e| FsError::io(blocknr, e))
    }

    /// Flushes the device. Failures are reported against block 0.
    pub fn sync(&self) -> Result<()> {
        self.dev.borrow_mut().sync_disk().map_err(|e| FsError::io(0, e))
    }

    /// Block and byte offset of inode `ino` in the inode table.
    fn inode_location(&self, ino: u32) -> Result<(BlockNumber, usize)> {
        if ino == 0 || ino > self.geometry.inodes_count() {
            return Err(FsError::BadInodeNumber(ino));
        }
        let offset = u64::from(ino - 1) * NODE_SIZE as u64;
        let block_size = self.geometry.block_size as u64;
        Ok((
            self.geometry.inode_table + offset / block_size,
            (offset % block_size) as usize,
        ))
    }

    pub fn read_inode(&self, ino: u32) -> Result<Inode> {
        let (blocknr, at) = self.inode_location(ino)?;
        let mut buf = vec![0; self.block_size()];
        self.read_block(blocknr, &mut buf)?;
        Inode::read_from(&buf[at..at + NODE_SIZE])
            .ok_or_else(|| FsError::InvalidArgument(format!("inode {} is truncated", ino)))
    }

    pub fn write_inode(&self, ino: u32, inode: &Inode) -> Result<()> {
        self.check_writable()?;
        let (blocknr, at) = self.inode_location(ino)?;
        let mut buf = vec![0; self.block_size()];
        self.read_block(blocknr, &mut buf)?;
        buf[at..at + NODE_SIZE].copy_from_slice(inode.as_bytes());
        self.write_block(blocknr, &buf)
    }

    /// Backend used by newly built 64-bit bitmaps.
    pub fn default_backend(&self) -> BackendKind {
        self.default_backend.get()
    }

    pub fn set_default_backend(&self, kind: BackendKind) {
        self.default_backend.set(kind);
    }

    fn bitmap_width(&self) -> IndexWidth {
        if self.flags.contains(FsFlags::BITMAPS_64) {
            IndexWidth::Extended64
        } else {
            IndexWidth::Legacy32
        }
    }

    fn allocate_bitmap(
        &self,
        family: ErrorFamily,
        bounds: Bounds,
        description: &str,
    ) -> Result<Bitmap<'_>> {
        Bitmap::with_backend(
            self,
            family,
            self.bitmap_width(),
            self.default_backend(),
            bounds,
            description,
        )
    }

    /// A bitmap over arbitrary bounds, reporting generic bit errors.
    pub fn allocate_generic_bitmap(
        &self,
        start: u64,
        end: u64,
        real_end: u64,
        description: &str,
    ) -> Result<Bitmap<'_>> {
        self.allocate_bitmap(
            ErrorFamily::Generic,
            Bounds::new(start, end, real_end),
            description,
        )
    }

    /// A bitmap over every data block. Capacity is rounded up to whole
    /// groups.
    pub fn allocate_block_bitmap(&self, description: &str) -> Result<Bitmap<'_>> {
        let g = &self.geometry;
        let real_end = g.block_bitmap_real_end().ok_or_else(|| {
            FsError::InvalidArgument("geometry: block bitmap capacity overflows".to_string())
        })?;
        self.allocate_bitmap(
            ErrorFamily::Block,
            Bounds::new(g.first_data_block, g.blocks_count - 1, real_end),
            description,
        )
    }

    /// A bitmap over inodes `1..=inodes_count`.
    pub fn allocate_inode_bitmap(&self, description: &str) -> Result<Bitmap<'_>> {
        let inodes = u64::from(self.geometry.inodes_count());
        self.allocate_bitmap(
            ErrorFamily::Inode,
            Bounds::new(1, inodes, inodes),
            description,
        )
    }

    /// Marks the blocks from the first data block through the end of the
    /// inode table as in use.
    pub fn mark_metadata_blocks(&self, bitmap: &mut Bitmap<'_>) -> Result<()> {
        let g = &self.geometry;
        let table_end = g.inode_table + g.inode_table_blocks();
        bitmap.mark_extent(g.first_data_block, table_end - g.first_data_block)
    }

    /// Loads `bitmap` from consecutive device blocks starting at
    /// `first_block`.
    pub fn read_bitmap(&self, bitmap: &mut Bitmap<'_>, first_block: BlockNumber) -> Result<()> {
        let bits_per_block = self.block_size() as u64 * 8;
        let nbits = bitmap.end() - bitmap.start() + 1;
        let mut buf = vec![0; self.block_size()];
        let mut done = 0;
        let mut blocknr = first_block;
        while done < nbits {
            let count = (nbits - done).min(bits_per_block);
            self.read_block(blocknr, &mut buf)?;
            bitmap.set_range(bitmap.start() + done, count, &buf)?;
            done += count;
            blocknr += 1;
        }
        debug!(
            "read bitmap {:?} from {} block(s) at {}",
            bitmap.description(),
            blocknr - first_block,
            first_block
        );
        Ok(())
    }

    /// Stores `bitmap` to consecutive device blocks starting at
    /// `first_block`. Bits past the end of the bitmap are written as zero.
    pub fn write_bitmap(&self, bitmap: &Bitmap<'_>, first_block: BlockNumber) -> Result<()> {
        self.check_writable()?;
        let bits_per_block = self.block_size() as u64 * 8;
        let nbits = bitmap.end() - bitmap.start() + 1;
        let mut buf = vec![0; self.block_size()];
        let mut done = 0;
        let mut blocknr = first_block;
        while done < nbits {
            let count = (nbits - done).min(bits_per_block);
            for byte in buf.iter_mut() {
                *byte = 0;
            }
            bitmap.get_range_into(bitmap.start() + done, count, &mut buf)?;
            self.write_block(blocknr, &buf)?;
            done += count;
            blocknr += 1;
        }
        debug!(
            "wrote bitmap {:?} to {} block(s) at {}",
            bitmap.description(),
            blocknr - first_block,
            first_block
        );
        Ok(())
    }
}

impl fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filesystem")
            .field("geometry", &self.geometry)
            .field("flags", &self.flags)
            .field("default_backend", &self.default_backend.get())
            .finish()
    }
}

/// A filesystem with the default geometry on a zeroed in-memory device.
#[cfg(test)]
pub(crate) fn scratch_fs(flags: FsFlags) -> Filesystem {
    let geometry = Geometry::default();
    let dev = blockdev::MemoryDevice::new(geometry.blocks_count, geometry.block_size);
    Filesystem::new(dev, geometry, flags).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockdev::MemoryDevice;

    #[test]
    fn default_geometry_is_consistent() {
        let g = Geometry::default();
        assert_eq!(g.group_count(), 2);
        assert_eq!(g.inodes_count(), 64);
        assert_eq!(g.inode_table_blocks(), 8);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn rejects_mismatched_devices() {
        let g = Geometry::default();
        let small = MemoryDevice::new(100, g.block_size);
        assert!(matches!(
            Filesystem::new(small, g, FsFlags::RW),
            Err(FsError::Device(_))
        ));

        let wrong_size = MemoryDevice::new(g.blocks_count, 4096);
        assert!(matches!(
            Filesystem::new(wrong_size, g, FsFlags::RW),
            Err(FsError::Device(_))
        ));
    }

    #[test]
    fn rejects_geometry_that_overflows() {
        let dev = || MemoryDevice::new(512, 1024);
        let bad = [
            Geometry {
                blocks_per_group: u64::MAX,
                ..Geometry::default()
            },
            Geometry {
                blocks_per_group: 8193,
                ..Geometry::default()
            },
            Geometry {
                inodes_per_group: u32::MAX,
                ..Geometry::default()
            },
            Geometry {
                inode_table: u64::MAX - 2,
                ..Geometry::default()
            },
            Geometry {
                blocks_count: u64::MAX,
                blocks_per_group: 8192,
                inodes_per_group: 1,
                ..Geometry::default()
            },
        ];
        for g in bad.iter() {
            assert!(
                matches!(
                    Filesystem::new(dev(), *g, FsFlags::RW),
                    Err(FsError::InvalidArgument(_))
                ),
                "{:?}",
                g
            );
        }
    }

    #[test]
    fn inodes_round_trip_through_the_table() {
        let fs = scratch_fs(FsFlags::RW);
        let mut node = Inode::regular_file();
        node.set_size(4242);
        node.block[3] = 77;

        fs.write_inode(9, &node).unwrap();
        fs.write_inode(10, &Inode::regular_file()).unwrap();
        assert_eq!(fs.read_inode(9).unwrap(), node);
        assert_eq!(fs.read_inode(11).unwrap(), Inode::default());
    }

    #[test]
    fn inode_numbers_are_checked() {
        let fs = scratch_fs(FsFlags::RW);
        assert!(matches!(fs.read_inode(0), Err(FsError::BadInodeNumber(0))));
        assert!(matches!(fs.read_inode(65), Err(FsError::BadInodeNumber(65))));
        assert!(fs.read_inode(64).is_ok());
    }

    #[test]
    fn read_only_filesystems_refuse_writes() {
        let fs = scratch_fs(FsFlags::empty());
        assert!(matches!(
            fs.write_block(20, &[0; 1024]),
            Err(FsError::ReadOnlyFilesystem)
        ));
        assert!(matches!(
            fs.write_inode(1, &Inode::default()),
            Err(FsError::ReadOnlyFilesystem)
        ));
        let mut buf = vec![0; 1024];
        assert!(fs.read_block(20, &mut buf).is_ok());
    }

    #[test]
    fn device_errors_carry_the_block_number() {
        let fs = scratch_fs(FsFlags::RW);
        let mut buf = vec![0; 1024];
        match fs.read_block(9999, &mut buf) {
            Err(FsError::IoFailure { block, .. }) => assert_eq!(block, 9999),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bitmaps_follow_the_geometry() {
        let fs = scratch_fs(FsFlags::RW);
        let blocks = fs.allocate_block_bitmap("blocks").unwrap();
        assert_eq!(blocks.bounds(), Bounds::new(1, 511, 512));
        assert_eq!(blocks.width(), IndexWidth::Legacy32);
        assert_eq!(blocks.family(), ErrorFamily::Block);

        let inodes = fs.allocate_inode_bitmap("inodes").unwrap();
        assert_eq!(inodes.bounds(), Bounds::new(1, 64, 64));

        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        fs.set_default_backend(BackendKind::RunTree);
        let generic = fs.allocate_generic_bitmap(0, 9, 15, "scratch").unwrap();
        assert_eq!(generic.width(), IndexWidth::Extended64);
        assert_eq!(generic.backend_kind(), BackendKind::RunTree);
    }

    #[test]
    fn bitmaps_persist_across_blocks() {
        let g = Geometry {
            block_size: 128,
            blocks_count: 4096,
            blocks_per_group: 1024,
            inodes_per_group: 8,
            inode_table: 8,
            ..Geometry::default()
        };
        let dev = MemoryDevice::new(g.blocks_count, g.block_size);
        let fs = Filesystem::new(dev, g, FsFlags::RW | FsFlags::BITMAPS_64).unwrap();

        let mut blocks = fs.allocate_block_bitmap("blocks").unwrap();
        fs.mark_metadata_blocks(&mut blocks).unwrap();
        blocks.mark_extent(1000, 1500).unwrap();
        blocks.mark(4095).unwrap();
        // 4095 bits at 1024 bits per block.
        fs.write_bitmap(&blocks, 100).unwrap();

        let mut loaded = fs.allocate_block_bitmap("loaded").unwrap();
        fs.read_bitmap(&mut loaded, 100).unwrap();
        assert!(blocks.compare(&loaded).unwrap());
        assert_eq!(loaded.find_first_zero(1, 4095).unwrap(), Some(40));

        // The padding of the last block stays clear on disk.
        let mut last = vec![0; 128];
        fs.read_block(103, &mut last).unwrap();
        assert_eq!(last[127], 0b0100_0000);
    }
}
