//! Raw access to the data blocks of an inode.
//!
//! A [`FileHandle`] streams bytes in and out of one inode through a single
//! block-sized buffer. Writes are staged in the buffer and only reach the
//! device when another block is staged, on [`FileHandle::flush`], on a seek
//! to another block, or when the handle is closed.

use std::io::SeekFrom;

use bitflags::bitflags;
use log::{debug, error, trace};

use crate::error::{FsError, Result, Structure, MAGIC_EXT2_FILE};
use crate::fs::{Filesystem, FsFlags};
use crate::mapper::{blocks_spanned, BlockMapper};
use crate::node::Inode;

bitflags! {
    /// Open mode and buffer state of a file handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileFlags: u32 {
        const WRITE = 0x0001;
        /// Start from an empty regular file instead of the stored inode.
        const CREATE = 0x0002;
        /// The buffer holds the contents of `blockno`.
        const BUF_VALID = 0x2000;
        /// The buffer holds writes not yet on the device.
        const BUF_DIRTY = 0x4000;
    }
}

/// An open inode with a cursor and a one-block buffer.
pub struct FileHandle<'fs, M: BlockMapper> {
    magic: i64,
    fs: &'fs Filesystem,
    ino: u32,
    /// Copy of the inode taken at open; kept current by this handle only.
    inode: Inode,
    flags: FileFlags,
    pos: u64,
    /// Logical block the buffer belongs to.
    blockno: u64,
    /// Device block backing `blockno`, once resolved.
    physblock: Option<u64>,
    buf: Vec<u8>,
    mapper: M,
}

impl<'fs, M: BlockMapper> FileHandle<'fs, M> {
    /// Opens inode `ino`, resolving its blocks through `mapper`.
    pub fn open(fs: &'fs Filesystem, ino: u32, flags: FileFlags, mapper: M) -> Result<Self> {
        let flags = flags & (FileFlags::WRITE | FileFlags::CREATE);
        if !flags.is_empty() && !fs.flags().contains(FsFlags::RW) {
            return Err(FsError::ReadOnlyFilesystem);
        }
        let inode = if flags.contains(FileFlags::CREATE) {
            let inode = Inode::regular_file();
            fs.write_inode(ino, &inode)?;
            inode
        } else {
            fs.read_inode(ino)?
        };
        debug!(
            "opened inode {} ({} bytes) with {:?}",
            ino,
            inode.size(),
            flags
        );

        Ok(Self {
            magic: MAGIC_EXT2_FILE,
            fs,
            ino,
            inode,
            flags,
            pos: 0,
            blockno: 0,
            physblock: None,
            buf: vec![0; fs.block_size()],
            mapper,
        })
    }

    fn check_magic(&self) -> Result<()> {
        if self.magic != MAGIC_EXT2_FILE {
            return Err(FsError::CorruptStructure {
                structure: Structure::File,
                found: self.magic,
            });
        }
        Ok(())
    }

    fn block_size(&self) -> u64 {
        self.buf.len() as u64
    }

    /// The position `len` bytes past the cursor, if it is addressable.
    fn advanced(&self, len: usize) -> Result<u64> {
        self.pos.checked_add(len as u64).ok_or_else(|| {
            FsError::InvalidArgument(format!("position {} cannot advance by {}", self.pos, len))
        })
    }

    /// Drops the staged block without writing it.
    fn invalidate(&mut self) {
        self.flags -= FileFlags::BUF_VALID | FileFlags::BUF_DIRTY;
        self.physblock = None;
    }

    /// Points the buffer at the block holding `pos`, flushing the block staged
    /// before if it is a different one.
    fn sync_buffer_position(&mut self) -> Result<()> {
        let b = self.pos / self.block_size();
        if b != self.blockno {
            self.flush()?;
            self.invalidate();
            self.blockno = b;
        }
        Ok(())
    }

    /// Stages `blockno` in the buffer. With `dontfill` the caller is about to
    /// overwrite the whole block, so the device is not read.
    fn load_buffer(&mut self, dontfill: bool) -> Result<()> {
        if self.flags.contains(FileFlags::BUF_VALID) {
            return Ok(());
        }
        if self.physblock.is_none() {
            self.physblock =
                self.mapper.resolve(self.fs, self.ino, &mut self.inode, self.blockno, false)?;
        }
        if !dontfill {
            match self.physblock {
                Some(blk) => {
                    trace!("inode {}: load block {} from {}", self.ino, self.blockno, blk);
                    self.fs.read_block(blk, &mut self.buf)?;
                }
                None => {
                    for byte in self.buf.iter_mut() {
                        *byte = 0;
                    }
                }
            }
        }
        self.flags |= FileFlags::BUF_VALID;
        Ok(())
    }

    /// Reads `len` bytes from the current position.
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0; len];
        self.read_into(&mut out)?;
        Ok(out)
    }

    /// Fills `out` from the current position. Holes and bytes past the end of
    /// the file read as zeros.
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<usize> {
        self.check_magic()?;
        let bs = self.block_size();
        let mut done = 0;
        while done < out.len() {
            self.sync_buffer_position()?;
            let start = (self.pos % bs) as usize;
            let c = (bs as usize - start).min(out.len() - done);
            let next = self.advanced(c)?;
            let chunk = &mut out[done..done + c];
            let size = self.inode.size();

            if self.pos >= size {
                for byte in chunk.iter_mut() {
                    *byte = 0;
                }
            } else {
                self.load_buffer(false)?;
                chunk.copy_from_slice(&self.buf[start..start + c]);
                let valid = (size - self.pos).min(c as u64) as usize;
                for byte in chunk[valid..].iter_mut() {
                    *byte = 0;
                }
            }
            self.pos = next;
            done += c;
        }
        Ok(done)
    }

    /// Writes `data` at the current position, growing the file if needed.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check_magic()?;
        if !self.flags.contains(FileFlags::WRITE) {
            return Err(FsError::FileReadOnly);
        }
        let mut done = 0;
        let staged = self.write_blocks(data, &mut done);
        if self.pos > self.inode.size() {
            let size = self.pos;
            self.mapper.set_size(self.fs, self.ino, &mut self.inode, size)?;
        }
        staged.map(|()| done)
    }

    fn write_blocks(&mut self, data: &[u8], done: &mut usize) -> Result<()> {
        let bs = self.block_size();
        while *done < data.len() {
            self.sync_buffer_position()?;
            let start = (self.pos % bs) as usize;
            let c = (bs as usize - start).min(data.len() - *done);
            let next = self.advanced(c)?;

            // Only read the block when part of it survives the write.
            self.load_buffer(c == bs as usize)?;
            self.buf[start..start + c].copy_from_slice(&data[*done..*done + c]);
            self.flags |= FileFlags::BUF_DIRTY;

            self.pos = next;
            *done += c;
        }
        Ok(())
    }

    /// Moves the cursor. Staged data is written out first when the target
    /// lies in another block.
    pub fn seek(&mut self, to: SeekFrom) -> Result<u64> {
        self.check_magic()?;
        let target = match to {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(d) => i128::from(self.pos) + i128::from(d),
            SeekFrom::End(d) => i128::from(self.inode.size()) + i128::from(d),
        };
        if target < 0 || target > i128::from(u64::MAX) {
            return Err(FsError::InvalidArgument(format!(
                "seek to {} from {}",
                target, self.pos
            )));
        }
        let target = target as u64;
        let b = target / self.block_size();
        if b != self.blockno {
            self.flush()?;
            self.invalidate();
            self.blockno = b;
        }
        self.pos = target;
        Ok(target)
    }

    /// Writes the staged block to the device if it is dirty, allocating a
    /// block for it when it is a hole. On failure the block stays staged and
    /// dirty.
    pub fn flush(&mut self) -> Result<()> {
        self.check_magic()?;
        if !self
            .flags
            .contains(FileFlags::BUF_VALID | FileFlags::BUF_DIRTY)
        {
            return Ok(());
        }
        let blk = match self.physblock {
            Some(blk) => blk,
            None => {
                let blk = self
                    .mapper
                    .resolve(self.fs, self.ino, &mut self.inode, self.blockno, true)?
                    .ok_or(FsError::NoSpace)?;
                self.physblock = Some(blk);
                blk
            }
        };
        self.fs.write_block(blk, &self.buf)?;
        self.flags -= FileFlags::BUF_DIRTY;
        debug!("inode {}: flushed block {} to {}", self.ino, self.blockno, blk);
        Ok(())
    }

    /// Flushes and releases the handle. A failed flush is reported as
    /// [`FsError::InconsistentFlush`]; the handle is gone either way.
    pub fn close(mut self) -> Result<()> {
        let flushed = self.flush();
        self.magic = 0;
        debug!("closed inode {}", self.ino);
        flushed.map_err(|e| FsError::InconsistentFlush {
            ino: self.ino,
            source: Box::new(e),
        })
    }

    /// Truncates or extends the file. Bytes past a shrunk end are zeroed so a
    /// later extension reads them back as zeros.
    pub fn set_size(&mut self, size: u64) -> Result<()> {
        self.check_magic()?;
        if !self.flags.contains(FileFlags::WRITE) {
            return Err(FsError::FileReadOnly);
        }
        let bs = self.block_size();
        let old_size = self.inode.size();
        let kept_blocks = blocks_spanned(size, bs);

        if self.flags.contains(FileFlags::BUF_VALID) && self.blockno >= kept_blocks {
            self.invalidate();
        }
        let tail = (size % bs) as usize;
        if size < old_size && tail != 0 {
            let lblk = size / bs;
            if self.flags.contains(FileFlags::BUF_VALID) && self.blockno == lblk {
                for byte in self.buf[tail..].iter_mut() {
                    *byte = 0;
                }
                self.flags |= FileFlags::BUF_DIRTY;
            } else {
                let found = self
                    .mapper
                    .resolve(self.fs, self.ino, &mut self.inode, lblk, false)?;
                if let Some(blk) = found {
                    let mut block = vec![0; bs as usize];
                    self.fs.read_block(blk, &mut block)?;
                    for byte in block[tail..].iter_mut() {
                        *byte = 0;
                    }
                    self.fs.write_block(blk, &block)?;
                }
            }
        }
        self.mapper.set_size(self.fs, self.ino, &mut self.inode, size)
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn size(&self) -> u64 {
        self.inode.size()
    }

    pub fn flags(&self) -> FileFlags {
        self.flags
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }
}

impl<M: BlockMapper> Drop for FileHandle<'_, M> {
    fn drop(&mut self) {
        if self.magic != MAGIC_EXT2_FILE {
            return;
        }
        if self
            .flags
            .contains(FileFlags::BUF_VALID | FileFlags::BUF_DIRTY)
        {
            match self.flush() {
                Ok(()) => debug!("inode {}: flushed on drop", self.ino),
                Err(e) => error!(
                    "inode {}: dirty block {} lost on drop: {}",
                    self.ino, self.blockno, e
                ),
            }
        }
        self.magic = 0;
    }
}
