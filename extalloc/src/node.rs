use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Size of an on-disk inode record.
pub const NODE_SIZE: usize = 128;
/// Number of block pointers held directly in the inode.
pub const DIRECT_BLOCKS: usize = 12;
/// Slot of the single indirect block pointer.
pub const IND_BLOCK: usize = 12;
/// Sector size the `blocks` field is counted in.
pub const SECTOR_SIZE: u64 = 512;

const S_IFMT: u16 = 0o170_000;
const S_IFREG: u16 = 0o100_000;
const S_IFDIR: u16 = 0o040_000;
const S_IFLNK: u16 = 0o120_000;
const DEFAULT_FILE_MODE: u16 = S_IFREG | 0o644;

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug, Default, PartialEq, Eq)]
/// An ext2 inode as laid out in the inode table. This structure __must be
/// exactly 128 bytes.__
pub struct Inode {
  /// The file mode (type and permission bits).
  pub mode: u16,
  /// The id of the owning user.
  pub uid: u16,
  /// Low 32 bits of the file size in bytes.
  pub size_lo: u32,
  pub atime: u32,
  pub ctime: u32,
  pub mtime: u32,
  /// Deletion time, zero while the inode is live.
  pub dtime: u32,
  /// The id of the owning group.
  pub gid: u16,
  /// The number of links to this file.
  pub links_count: u16,
  /// Allocated space in 512-byte sectors, indirect blocks included.
  pub blocks: u32,
  pub flags: u32,
  pub osd1: u32,
  /// Pointers for the data blocks that belong to the file: twelve direct
  /// pointers, then single, double and triple indirect.
  pub block: [u32; 15],
  pub generation: u32,
  pub file_acl: u32,
  /// High 32 bits of the file size.
  pub size_high: u32,
  pub faddr: u32,
  pub osd2: [u8; 12],
}

impl Inode {
  /// A fresh, empty regular file with a single link.
  pub fn regular_file() -> Self {
    Self {
      mode: DEFAULT_FILE_MODE,
      links_count: 1,
      ..Self::default()
    }
  }

  pub fn size(&self) -> u64 {
    u64::from(self.size_lo) | u64::from(self.size_high) << 32
  }

  pub fn set_size(&mut self, size: u64) {
    self.size_lo = size as u32;
    self.size_high = (size >> 32) as u32;
  }

  pub fn is_file(&self) -> bool {
    self.mode & S_IFMT == S_IFREG
  }

  pub fn is_dir(&self) -> bool {
    self.mode & S_IFMT == S_IFDIR
  }

  pub fn is_symlink(&self) -> bool {
    self.mode & S_IFMT == S_IFLNK
  }
}
