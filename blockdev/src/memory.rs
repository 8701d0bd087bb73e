use crate::blockio::{check_block, BlockNumber, BlockStorage};
use std::io::ErrorKind;
use std::path::Path;

/// Block storage held entirely in memory. Contents are lost when the device is
/// dropped.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    blocks: Vec<u8>,
    block_size: usize,
    block_count: u64,
}

impl MemoryDevice {
    /// Creates a zeroed device of `block_count` blocks.
    pub fn new(block_count: u64, block_size: usize) -> Self {
        Self {
            blocks: vec![0; block_count as usize * block_size],
            block_size,
            block_count,
        }
    }

    fn offset(&self, blocknr: BlockNumber) -> usize {
        blocknr as usize * self.block_size
    }
}

impl BlockStorage for MemoryDevice {
    /// Loads the whole file into memory; later writes are not persisted back.
    fn open_disk<P: AsRef<Path>>(path: P, nblocks: u64, block_size: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        let mut dev = MemoryDevice::new(nblocks, block_size);
        let contents = std::fs::read(path)?;
        let len = contents.len().min(dev.blocks.len());
        dev.blocks[..len].copy_from_slice(&contents[..len]);
        Ok(dev)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        check_block(blocknr, self.block_count)?;
        if buf.len() < self.block_size {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        let start = self.offset(blocknr);
        buf[..self.block_size].copy_from_slice(&self.blocks[start..start + self.block_size]);
        Ok(())
    }

    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        check_block(blocknr, self.block_count)?;
        let start = self.offset(blocknr);
        let max = buf.len().min(self.block_size);
        self.blocks[start..start + max].copy_from_slice(&buf[..max]);
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_device_reads_zeroes() {
        let mut dev = MemoryDevice::new(2, 512);
        let mut buf = vec![0xff; 512];
        dev.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0; 512]);
    }

    #[test]
    fn writes_land_in_the_addressed_block_only() {
        let mut dev = MemoryDevice::new(3, 512);
        dev.write_block(1, &[0xab; 512]).unwrap();

        let mut buf = vec![0; 512];
        dev.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, vec![0; 512]);
        dev.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0xab; 512]);
        dev.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, vec![0; 512]);
    }

    #[test]
    fn out_of_range_blocks_are_rejected() {
        let mut dev = MemoryDevice::new(1, 512);
        let mut buf = vec![0; 512];
        assert!(dev.read_block(1, &mut buf).is_err());
        assert!(dev.write_block(1, &buf).is_err());
    }

    #[test]
    fn open_disk_loads_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &[0x5a; 1024]).unwrap();

        let mut dev = MemoryDevice::open_disk(file.path(), 4, 512).unwrap();
        let mut buf = vec![0; 512];
        dev.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0x5a; 512]);
        dev.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, vec![0; 512]);
    }
}
