use std::fmt;

use thiserror::Error;

/// First code of the ext2 error table. Every numeric code reported by
/// [`FsError::code`] is an offset from this base, so callers that speak
/// `errcode_t` can match on them directly.
pub const EXT2_ET_BASE: i64 = 2_133_571_328;

pub(crate) const MAGIC_BLOCK_BITMAP: i64 = EXT2_ET_BASE + 8;
pub(crate) const MAGIC_INODE_BITMAP: i64 = EXT2_ET_BASE + 9;
pub(crate) const MAGIC_GENERIC_BITMAP: i64 = EXT2_ET_BASE + 10;
pub(crate) const MAGIC_EXT2_FILE: i64 = EXT2_ET_BASE + 15;
pub(crate) const MAGIC_GENERIC_BITMAP64: i64 = EXT2_ET_BASE + 109;
pub(crate) const MAGIC_BLOCK_BITMAP64: i64 = EXT2_ET_BASE + 110;
pub(crate) const MAGIC_INODE_BITMAP64: i64 = EXT2_ET_BASE + 111;

const RO_FILSYS: i64 = EXT2_ET_BASE + 21;
const BAD_INODE_NUM: i64 = EXT2_ET_BASE + 41;
const BAD_BLOCK_MARK: i64 = EXT2_ET_BASE + 45;
const BAD_INODE_MARK: i64 = EXT2_ET_BASE + 48;
const FUDGE_BLOCK_BITMAP_END: i64 = EXT2_ET_BASE + 51;
const FUDGE_INODE_BITMAP_END: i64 = EXT2_ET_BASE + 52;
const BAD_GENERIC_MARK: i64 = EXT2_ET_BASE + 61;
const NO_MEMORY: i64 = EXT2_ET_BASE + 70;
const INVALID_ARGUMENT: i64 = EXT2_ET_BASE + 71;
const BLOCK_ALLOC_FAIL: i64 = EXT2_ET_BASE + 72;
const FILE_RO: i64 = EXT2_ET_BASE + 77;
const FILE_TOO_BIG: i64 = EXT2_ET_BASE + 82;
const CANT_USE_LEGACY_BITMAPS: i64 = EXT2_ET_BASE + 137;

const EIO: i64 = 5;

pub type Result<T> = std::result::Result<T, FsError>;

/// The error-code family a bitmap reports under. Lets callers tell a block
/// bitmap failure from an inode bitmap failure without parsing descriptions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorFamily {
    Block,
    Inode,
    Generic,
}

impl ErrorFamily {
    /// The code reported for an out of range mark; unmark and test follow it.
    pub fn base_code(self) -> i64 {
        match self {
            ErrorFamily::Block => BAD_BLOCK_MARK,
            ErrorFamily::Inode => BAD_INODE_MARK,
            ErrorFamily::Generic => BAD_GENERIC_MARK,
        }
    }

    pub(crate) fn magic(self, width: IndexWidth) -> i64 {
        match (width, self) {
            (IndexWidth::Legacy32, ErrorFamily::Block) => MAGIC_BLOCK_BITMAP,
            (IndexWidth::Legacy32, ErrorFamily::Inode) => MAGIC_INODE_BITMAP,
            (IndexWidth::Legacy32, ErrorFamily::Generic) => MAGIC_GENERIC_BITMAP,
            (IndexWidth::Extended64, ErrorFamily::Block) => MAGIC_BLOCK_BITMAP64,
            (IndexWidth::Extended64, ErrorFamily::Inode) => MAGIC_INODE_BITMAP64,
            (IndexWidth::Extended64, ErrorFamily::Generic) => MAGIC_GENERIC_BITMAP64,
        }
    }
}

impl fmt::Display for ErrorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorFamily::Block => write!(f, "block"),
            ErrorFamily::Inode => write!(f, "inode"),
            ErrorFamily::Generic => write!(f, "generic bit"),
        }
    }
}

/// Index width of a bitmap. Legacy bitmaps are the fixed 32-bit format; all
/// indices are carried as `u64` either way.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexWidth {
    Legacy32,
    Extended64,
}

/// The bitmap operation an [`FsError::OutOfRange`] was raised by.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BitmapOp {
    Mark,
    Unmark,
    Test,
    MarkExtent,
    UnmarkExtent,
    TestClearExtent,
    SetRange,
    GetRange,
    FindFirstZero,
    FindFirstSet,
    Count,
}

impl BitmapOp {
    fn offset(self) -> i64 {
        match self {
            BitmapOp::Mark | BitmapOp::MarkExtent | BitmapOp::SetRange => 0,
            BitmapOp::Unmark | BitmapOp::UnmarkExtent | BitmapOp::TestClearExtent => 1,
            BitmapOp::Test
            | BitmapOp::GetRange
            | BitmapOp::FindFirstZero
            | BitmapOp::FindFirstSet
            | BitmapOp::Count => 2,
        }
    }
}

impl fmt::Display for BitmapOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BitmapOp::Mark => "mark",
            BitmapOp::Unmark => "unmark",
            BitmapOp::Test => "test",
            BitmapOp::MarkExtent => "mark_extent",
            BitmapOp::UnmarkExtent => "unmark_extent",
            BitmapOp::TestClearExtent => "test_clear_extent",
            BitmapOp::SetRange => "set_range",
            BitmapOp::GetRange => "get_range",
            BitmapOp::FindFirstZero => "find_first_zero",
            BitmapOp::FindFirstSet => "find_first_set",
            BitmapOp::Count => "count_set",
        };
        f.write_str(name)
    }
}

/// Structures guarded by a magic number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Structure {
    Bitmap(ErrorFamily, IndexWidth),
    File,
}

impl Structure {
    pub(crate) fn magic(self) -> i64 {
        match self {
            Structure::Bitmap(family, width) => family.magic(width),
            Structure::File => MAGIC_EXT2_FILE,
        }
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Structure::Bitmap(family, IndexWidth::Legacy32) => write!(f, "{} bitmap", family),
            Structure::Bitmap(family, IndexWidth::Extended64) => {
                write!(f, "64-bit {} bitmap", family)
            }
            Structure::File => write!(f, "ext2 file"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("wrong magic number for {structure} structure (found {found:#x})")]
    CorruptStructure { structure: Structure, found: i64 },
    #[error("illegal {family} number {index} passed to {op} (valid range {start}..={end})")]
    OutOfRange {
        family: ErrorFamily,
        op: BitmapOp,
        index: u64,
        start: u64,
        end: u64,
    },
    #[error("could not allocate {bytes} bytes of bitmap storage")]
    AllocationFailure { bytes: u64 },
    #[error("cannot resize bitmap {description:?}: {reason}")]
    ResizeFailure { description: String, reason: String },
    #[error("i/o error on block {block}")]
    IoFailure {
        block: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("inode {ino}: dirty block lost on close")]
    InconsistentFlush {
        ino: u32,
        #[source]
        source: Box<FsError>,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("attempt to write to a file opened read-only")]
    FileReadOnly,
    #[error("attempt to write to a filesystem opened read-only")]
    ReadOnlyFilesystem,
    #[error("illegal inode number {0}")]
    BadInodeNumber(u32),
    #[error("bitmap end {real_end} does not fit the legacy 32-bit bitmap format")]
    LegacyBitmapTooLarge { real_end: u64 },
    #[error("attempt to move end of {family} bitmap to {end} past the real end {real_end}")]
    EndBeyondCapacity {
        family: ErrorFamily,
        end: u64,
        real_end: u64,
    },
    #[error("could not allocate block")]
    NoSpace,
    #[error("logical block {0} is beyond the reach of the block map")]
    FileTooBig(u64),
    #[error("device does not match filesystem geometry: {0}")]
    Device(String),
}

impl FsError {
    /// The `errcode_t`-compatible code for this error.
    pub fn code(&self) -> i64 {
        match self {
            FsError::CorruptStructure { structure, .. } => structure.magic(),
            FsError::OutOfRange { family, op, .. } => family.base_code() + op.offset(),
            FsError::AllocationFailure { .. } => NO_MEMORY,
            FsError::ResizeFailure { .. } => NO_MEMORY,
            FsError::IoFailure { source, .. } => {
                source.raw_os_error().map(i64::from).unwrap_or(EIO)
            }
            FsError::InconsistentFlush { source, .. } => source.code(),
            FsError::InvalidArgument(_) => INVALID_ARGUMENT,
            FsError::FileReadOnly => FILE_RO,
            FsError::ReadOnlyFilesystem => RO_FILSYS,
            FsError::BadInodeNumber(_) => BAD_INODE_NUM,
            FsError::LegacyBitmapTooLarge { .. } => CANT_USE_LEGACY_BITMAPS,
            FsError::EndBeyondCapacity { family, .. } => match family {
                ErrorFamily::Inode => FUDGE_INODE_BITMAP_END,
                _ => FUDGE_BLOCK_BITMAP_END,
            },
            FsError::NoSpace => BLOCK_ALLOC_FAIL,
            FsError::FileTooBig(_) => FILE_TOO_BIG,
            FsError::Device(_) => INVALID_ARGUMENT,
        }
    }

    pub(crate) fn io(block: u64, source: std::io::Error) -> Self {
        FsError::IoFailure { block, source }
    }
}
