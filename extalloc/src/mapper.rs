//! Translation of a file's logical blocks to device blocks.

use std::convert::TryFrom;

use log::{debug, trace};

use crate::alloc::Bitmap;
use crate::error::{FsError, Result};
use crate::fs::Filesystem;
use crate::node::{Inode, DIRECT_BLOCKS, IND_BLOCK, SECTOR_SIZE};

/// Resolves logical blocks of an inode to physical blocks.
pub trait BlockMapper {
    /// The physical block backing `lblk`, or `None` for a hole. With `create`
    /// set a hole is filled with a newly allocated block and the inode is
    /// persisted.
    fn resolve(
        &mut self,
        fs: &Filesystem,
        ino: u32,
        inode: &mut Inode,
        lblk: u64,
        create: bool,
    ) -> Result<Option<u64>>;

    /// Sets the logical size of the inode, releasing blocks past the new end,
    /// and persists it.
    fn set_size(&mut self, fs: &Filesystem, ino: u32, inode: &mut Inode, size: u64)
        -> Result<()>;
}

impl<M: BlockMapper + ?Sized> BlockMapper for &mut M {
    fn resolve(
        &mut self,
        fs: &Filesystem,
        ino: u32,
        inode: &mut Inode,
        lblk: u64,
        create: bool,
    ) -> Result<Option<u64>> {
        (**self).resolve(fs, ino, inode, lblk, create)
    }

    fn set_size(
        &mut self,
        fs: &Filesystem,
        ino: u32,
        inode: &mut Inode,
        size: u64,
    ) -> Result<()> {
        (**self).set_size(fs, ino, inode, size)
    }
}

/// Maps through the twelve direct pointers and the single indirect block,
/// allocating from a block bitmap.
///
/// New blocks are taken from the first free block at or after the goal,
/// wrapping around to the start of the bitmap. The goal follows the last
/// allocation so a file written front to back ends up mostly contiguous.
pub struct DirectMapper<'a, 'fs> {
    block_map: &'a mut Bitmap<'fs>,
    goal: u64,
}

impl<'a, 'fs> DirectMapper<'a, 'fs> {
    pub fn new(block_map: &'a mut Bitmap<'fs>) -> Self {
        let goal = block_map.start();
        Self { block_map, goal }
    }

    /// Starts the next allocation search at `goal`.
    pub fn with_goal(mut self, goal: u64) -> Self {
        self.goal = goal.max(self.block_map.start()).min(self.block_map.end());
        self
    }

    pub fn block_map(&self) -> &Bitmap<'fs> {
        self.block_map
    }

    /// Highest logical block this mapper can address, plus one.
    pub fn reach(fs: &Filesystem) -> u64 {
        (DIRECT_BLOCKS + fs.block_size() / 4) as u64
    }

    fn sectors_per_block(fs: &Filesystem) -> u32 {
        (fs.block_size() as u64 / SECTOR_SIZE) as u32
    }

    fn allocate(&mut self, fs: &Filesystem) -> Result<u32> {
        let (start, end) = (self.block_map.start(), self.block_map.end());
        let found = match self.block_map.find_first_zero(self.goal, end)? {
            Some(blk) => Some(blk),
            None if self.goal > start => self.block_map.find_first_zero(start, self.goal - 1)?,
            None => None,
        };
        let blk = found.ok_or(FsError::NoSpace)?;
        let ptr = u32::try_from(blk).map_err(|_| FsError::NoSpace)?;
        self.block_map.mark(blk)?;
        self.goal = if blk < end { blk + 1 } else { start };
        trace!("allocated block {} (block size {})", blk, fs.block_size());
        Ok(ptr)
    }

    fn release(&mut self, fs: &Filesystem, inode: &mut Inode, ptr: u32) -> Result<()> {
        self.block_map.unmark(u64::from(ptr))?;
        inode.blocks = inode.blocks.saturating_sub(Self::sectors_per_block(fs));
        Ok(())
    }

    /// Undoes an allocation whose bookkeeping could not be persisted, so a
    /// retry starts over.
    fn abandon(
        &mut self,
        fs: &Filesystem,
        inode: &mut Inode,
        ptr: u32,
        cause: FsError,
    ) -> FsError {
        match self.release(fs, inode, ptr) {
            Ok(()) => cause,
            Err(e) => e,
        }
    }

    fn read_indirect(fs: &Filesystem, blk: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0; fs.block_size()];
        fs.read_block(u64::from(blk), &mut buf)?;
        Ok(buf)
    }
}

/// Blocks needed to hold `size` bytes.
pub(crate) fn blocks_spanned(size: u64, block_size: u64) -> u64 {
    size / block_size + u64::from(size % block_size != 0)
}

fn entry(buf: &[u8], idx: usize) -> u32 {
    let mut le = [0u8; 4];
    le.copy_from_slice(&buf[idx * 4..idx * 4 + 4]);
    u32::from_le_bytes(le)
}

fn set_entry(buf: &mut [u8], idx: usize, ptr: u32) {
    buf[idx * 4..idx * 4 + 4].copy_from_slice(&ptr.to_le_bytes());
}

impl BlockMapper for DirectMapper<'_, '_> {
    fn resolve(
        &mut self,
        fs: &Filesystem,
        ino: u32,
        inode: &mut Inode,
        lblk: u64,
        create: bool,
    ) -> Result<Option<u64>> {
        if lblk >= Self::reach(fs) {
            return Err(FsError::FileTooBig(lblk));
        }
        let lblk = lblk as usize;

        if lblk < DIRECT_BLOCKS {
            if inode.block[lblk] == 0 {
                if !create {
                    return Ok(None);
                }
                let ptr = self.allocate(fs)?;
                inode.block[lblk] = ptr;
                inode.blocks += Self::sectors_per_block(fs);
                if let Err(e) = fs.write_inode(ino, inode) {
                    inode.block[lblk] = 0;
                    return Err(self.abandon(fs, inode, ptr, e));
                }
            }
            return Ok(Some(u64::from(inode.block[lblk])));
        }

        let idx = lblk - DIRECT_BLOCKS;
        let mut ind = if inode.block[IND_BLOCK] == 0 {
            if !create {
                return Ok(None);
            }
            let blk = self.allocate(fs)?;
            let zeroed = vec![0; fs.block_size()];
            inode.block[IND_BLOCK] = blk;
            inode.blocks += Self::sectors_per_block(fs);
            let attached = fs
                .write_block(u64::from(blk), &zeroed)
                .and_then(|()| fs.write_inode(ino, inode));
            if let Err(e) = attached {
                inode.block[IND_BLOCK] = 0;
                return Err(self.abandon(fs, inode, blk, e));
            }
            debug!("inode {}: indirect block at {}", ino, blk);
            zeroed
        } else {
            Self::read_indirect(fs, inode.block[IND_BLOCK])?
        };

        let mut ptr = entry(&ind, idx);
        if ptr == 0 {
            if !create {
                return Ok(None);
            }
            ptr = self.allocate(fs)?;
            set_entry(&mut ind, idx, ptr);
            inode.blocks += Self::sectors_per_block(fs);
            let ind_blk = u64::from(inode.block[IND_BLOCK]);
            let attached = fs
                .write_inode(ino, inode)
                .and_then(|()| fs.write_block(ind_blk, &ind));
            if let Err(e) = attached {
                return Err(self.abandon(fs, inode, ptr, e));
            }
        }
        Ok(Some(u64::from(ptr)))
    }

    fn set_size(
        &mut self,
        fs: &Filesystem,
        ino: u32,
        inode: &mut Inode,
        size: u64,
    ) -> Result<()> {
        let block_size = fs.block_size() as u64;
        let keep = blocks_spanned(size, block_size);
        if keep > Self::reach(fs) {
            return Err(FsError::FileTooBig(keep - 1));
        }
        let old_blocks = blocks_spanned(inode.size(), block_size);
        inode.set_size(size);

        if keep < old_blocks {
            for lblk in (keep as usize)..DIRECT_BLOCKS {
                let ptr = std::mem::replace(&mut inode.block[lblk], 0);
                if ptr != 0 {
                    self.release(fs, inode, ptr)?;
                }
            }
            let ind_ptr = inode.block[IND_BLOCK];
            if ind_ptr != 0 {
                let first = (keep as usize).saturating_sub(DIRECT_BLOCKS);
                let mut ind = Self::read_indirect(fs, ind_ptr)?;
                for idx in first..fs.block_size() / 4 {
                    let ptr = entry(&ind, idx);
                    if ptr != 0 {
                        set_entry(&mut ind, idx, 0);
                        self.release(fs, inode, ptr)?;
                    }
                }
                if first == 0 {
                    inode.block[IND_BLOCK] = 0;
                    self.release(fs, inode, ind_ptr)?;
                } else {
                    fs.write_block(u64::from(ind_ptr), &ind)?;
                }
            }
            debug!(
                "inode {}: truncated from {} to {} block(s)",
                ino, old_blocks, keep
            );
        }
        fs.write_inode(ino, inode)
    }
}
