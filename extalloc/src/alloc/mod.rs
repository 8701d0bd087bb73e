//! Allocation bitmaps.
//!
//! A [`Bitmap`] tracks which blocks or inodes are in use. The generic logic
//! here validates every request against the bitmap's bounds and hands the
//! work to a storage backend picked when the bitmap is built.

mod backend;
mod bitarray;
mod runtree;
pub mod search;

use std::cell::Cell;
use std::fmt;

use log::{debug, info, warn};

pub use backend::{BackendKind, BitmapBackend};
pub use bitarray::BitArray;
pub use runtree::RunTree;

use crate::error::{BitmapOp, ErrorFamily, FsError, IndexWidth, Result, Structure};
use crate::fs::Filesystem;
use backend::packed_len;

/// Bits moved per step when copying or comparing whole payloads.
const TRANSFER_BITS: u64 = 8 * 4096;

/// Inclusive bounds of a bitmap: `start..=end` is addressable and storage is
/// reserved up to `real_end`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Bounds {
    pub start: u64,
    pub end: u64,
    pub real_end: u64,
}

impl Bounds {
    pub fn new(start: u64, end: u64, real_end: u64) -> Self {
        Self {
            start,
            end,
            real_end,
        }
    }
}

/// Per-bitmap operation counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BitmapStats {
    pub marks: u64,
    pub unmarks: u64,
    pub tests: u64,
    pub extent_ops: u64,
    pub range_ops: u64,
    pub searches: u64,
    pub resizes: u64,
    pub clears: u64,
}

/// A bitmap over `start..=end`, bound to the filesystem it was built for.
pub struct Bitmap<'fs> {
    magic: i64,
    fs: &'fs Filesystem,
    family: ErrorFamily,
    width: IndexWidth,
    start: u64,
    end: u64,
    real_end: u64,
    description: String,
    backend: Box<dyn BitmapBackend>,
    stats: Cell<BitmapStats>,
}

impl<'fs> Bitmap<'fs> {
    /// Builds an all-zero bitmap on an explicit backend.
    ///
    /// Legacy bitmaps are always packed bit arrays and must be able to
    /// address `real_end` in 32 bits.
    pub fn with_backend(
        fs: &'fs Filesystem,
        family: ErrorFamily,
        width: IndexWidth,
        kind: BackendKind,
        bounds: Bounds,
        description: impl Into<String>,
    ) -> Result<Self> {
        let Bounds {
            start,
            end,
            real_end,
        } = bounds;
        if start > end || end > real_end {
            return Err(FsError::InvalidArgument(format!(
                "bitmap bounds {}..={} with real end {}",
                start, end, real_end
            )));
        }
        let kind = match width {
            IndexWidth::Legacy32 if real_end > u64::from(u32::MAX) => {
                return Err(FsError::LegacyBitmapTooLarge { real_end });
            }
            IndexWidth::Legacy32 => BackendKind::BitArray,
            IndexWidth::Extended64 => kind,
        };
        let nbits = (real_end - start)
            .checked_add(1)
            .ok_or(FsError::AllocationFailure { bytes: u64::MAX })?;
        let backend = kind.allocate(nbits)?;
        let description = description.into();
        debug!(
            "allocated {} bitmap {:?} over {}..={} (real end {}) on {}",
            family, description, start, end, real_end, kind
        );

        Ok(Self {
            magic: family.magic(width),
            fs,
            family,
            width,
            start,
            end,
            real_end,
            description,
            backend,
            stats: Cell::new(BitmapStats::default()),
        })
    }

    fn structure(&self) -> Structure {
        Structure::Bitmap(self.family, self.width)
    }

    fn check_magic(&self) -> Result<()> {
        if self.magic != self.structure().magic() {
            return Err(FsError::CorruptStructure {
                structure: self.structure(),
                found: self.magic,
            });
        }
        Ok(())
    }

    fn range_error(&self, op: BitmapOp, index: u64) -> FsError {
        warn!(
            "#{} for {} {:?}: illegal {} number",
            index, op, self.description, self.family
        );
        FsError::OutOfRange {
            family: self.family,
            op,
            index,
            start: self.start,
            end: self.end,
        }
    }

    /// Validates `index` and returns it relative to `start`.
    fn check_index(&self, op: BitmapOp, index: u64) -> Result<u64> {
        self.check_magic()?;
        if index < self.start || index > self.end {
            return Err(self.range_error(op, index));
        }
        Ok(index - self.start)
    }

    /// Validates the extent `[index, index + count)`. An empty extent only
    /// needs its first index in range.
    fn check_extent(&self, op: BitmapOp, index: u64, count: u64) -> Result<u64> {
        let bit = self.check_index(op, index)?;
        if count > 0 {
            match index.checked_add(count - 1) {
                Some(last) if last <= self.end => (),
                _ => return Err(self.range_error(op, index.saturating_add(count - 1))),
            }
        }
        Ok(bit)
    }

    /// Validates an inclusive search window.
    fn check_window(&self, op: BitmapOp, lo: u64, hi: u64) -> Result<(u64, u64)> {
        self.check_magic()?;
        if lo > hi {
            return Err(FsError::InvalidArgument(format!(
                "{} window {}..={} is reversed",
                op, lo, hi
            )));
        }
        Ok((self.check_index(op, lo)?, self.check_index(op, hi)?))
    }

    fn resize_failure(&self, reason: String) -> FsError {
        FsError::ResizeFailure {
            description: self.description.clone(),
            reason,
        }
    }

    fn bump(&self, f: impl FnOnce(&mut BitmapStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Sets `index`, returning whether it was already set.
    pub fn mark(&mut self, index: u64) -> Result<bool> {
        let bit = self.check_index(BitmapOp::Mark, index)?;
        self.bump(|s| s.marks += 1);
        Ok(self.backend.mark(bit))
    }

    /// Clears `index`, returning whether it was set.
    pub fn unmark(&mut self, index: u64) -> Result<bool> {
        let bit = self.check_index(BitmapOp::Unmark, index)?;
        self.bump(|s| s.unmarks += 1);
        Ok(self.backend.unmark(bit))
    }

    pub fn test(&self, index: u64) -> Result<bool> {
        let bit = self.check_index(BitmapOp::Test, index)?;
        self.bump(|s| s.tests += 1);
        Ok(self.backend.test(bit))
    }

    pub fn mark_extent(&mut self, start: u64, count: u64) -> Result<()> {
        let bit = self.check_extent(BitmapOp::MarkExtent, start, count)?;
        self.bump(|s| s.extent_ops += 1);
        self.backend.mark_extent(bit, count);
        Ok(())
    }

    pub fn unmark_extent(&mut self, start: u64, count: u64) -> Result<()> {
        let bit = self.check_extent(BitmapOp::UnmarkExtent, start, count)?;
        self.bump(|s| s.extent_ops += 1);
        self.backend.unmark_extent(bit, count);
        Ok(())
    }

    /// Returns true if every bit of the extent was set. The extent is clear
    /// afterwards in both cases.
    pub fn test_clear_extent(&mut self, start: u64, count: u64) -> Result<bool> {
        let bit = self.check_extent(BitmapOp::TestClearExtent, start, count)?;
        self.bump(|s| s.extent_ops += 1);
        Ok(self.backend.test_clear_extent(bit, count))
    }

    /// Loads `count` bits starting at `start` from a packed LSB-first buffer.
    pub fn set_range(&mut self, start: u64, count: u64, data: &[u8]) -> Result<()> {
        let bit = self.check_extent(BitmapOp::SetRange, start, count)?;
        if data.len() < packed_len(count) {
            return Err(FsError::InvalidArgument(format!(
                "{} bytes cannot carry {} bits",
                data.len(),
                count
            )));
        }
        self.bump(|s| s.range_ops += 1);
        self.backend.set_range(bit, count, data);
        Ok(())
    }

    /// Packs `count` bits starting at `start` into a new buffer.
    pub fn get_range(&self, start: u64, count: u64) -> Result<Vec<u8>> {
        let mut out = vec![0; packed_len(count)];
        self.get_range_into(start, count, &mut out)?;
        Ok(out)
    }

    pub fn get_range_into(&self, start: u64, count: u64, out: &mut [u8]) -> Result<()> {
        let bit = self.check_extent(BitmapOp::GetRange, start, count)?;
        if out.len() < packed_len(count) {
            return Err(FsError::InvalidArgument(format!(
                "{} bytes cannot hold {} bits",
                out.len(),
                count
            )));
        }
        self.bump(|s| s.range_ops += 1);
        if count > 0 {
            self.backend.get_range(bit, count, out);
        }
        Ok(())
    }

    /// Clears every bit, including the padding past the end.
    pub fn clear(&mut self) -> Result<()> {
        self.check_magic()?;
        self.bump(|s| s.clears += 1);
        self.backend.clear();
        Ok(())
    }

    /// First clear index in `lo..=hi`.
    pub fn find_first_zero(&self, lo: u64, hi: u64) -> Result<Option<u64>> {
        let (lo, hi) = self.check_window(BitmapOp::FindFirstZero, lo, hi)?;
        self.bump(|s| s.searches += 1);
        Ok(self.backend.find_first_zero(lo, hi).map(|bit| bit + self.start))
    }

    /// First set index in `lo..=hi`.
    pub fn find_first_set(&self, lo: u64, hi: u64) -> Result<Option<u64>> {
        let (lo, hi) = self.check_window(BitmapOp::FindFirstSet, lo, hi)?;
        self.bump(|s| s.searches += 1);
        Ok(self.backend.find_first_set(lo, hi).map(|bit| bit + self.start))
    }

    /// Number of set indices in `lo..=hi`.
    pub fn count_set(&self, lo: u64, hi: u64) -> Result<u64> {
        let (lo, hi) = self.check_window(BitmapOp::Count, lo, hi)?;
        Ok(self.backend.count_set(lo, hi - lo + 1))
    }

    /// Moves the end to `new_end` and the capacity to `new_real_end`.
    ///
    /// Indices between the old and the new end read as zero afterwards. On
    /// failure the bitmap is left exactly as it was.
    pub fn resize(&mut self, new_end: u64, new_real_end: u64) -> Result<()> {
        self.check_magic()?;
        if new_end < self.start || new_end > new_real_end {
            return Err(self.resize_failure(format!(
                "end {} must lie in {}..={}",
                new_end, self.start, new_real_end
            )));
        }
        if self.width == IndexWidth::Legacy32 && new_real_end > u64::from(u32::MAX) {
            return Err(self.resize_failure(format!(
                "real end {} does not fit a legacy bitmap",
                new_real_end
            )));
        }
        if new_real_end - self.start == u64::MAX {
            return Err(self.resize_failure(format!(
                "real end {} is not addressable",
                new_real_end
            )));
        }
        self.backend
            .resize(
                self.end - self.start,
                new_end - self.start,
                new_real_end - self.start,
            )
            .map_err(|e| self.resize_failure(e.to_string()))?;

        debug!(
            "resized bitmap {:?}: end {} -> {}, real end {} -> {}",
            self.description, self.end, new_end, self.real_end, new_real_end
        );
        self.end = new_end;
        self.real_end = new_real_end;
        self.bump(|s| s.resizes += 1);
        Ok(())
    }

    /// Deep copy under the same filesystem, labelled `copy of <description>`.
    pub fn copy(&self) -> Result<Bitmap<'fs>> {
        self.check_magic()?;
        let backend = self.backend.duplicate()?;
        let description = format!("copy of {}", self.description);
        debug!("copied bitmap {:?}", self.description);
        Ok(Bitmap {
            magic: self.magic,
            fs: self.fs,
            family: self.family,
            width: self.width,
            start: self.start,
            end: self.end,
            real_end: self.real_end,
            description,
            backend,
            stats: Cell::new(BitmapStats::default()),
        })
    }

    /// Invalidates and releases the bitmap.
    pub fn free(mut self) {
        debug!("freeing bitmap {:?}", self.description);
        self.magic = 0;
    }

    /// Moves the end within the current capacity without touching storage,
    /// returning the previous end.
    pub fn fudge_end(&mut self, new_end: u64) -> Result<u64> {
        self.check_magic()?;
        if new_end > self.real_end {
            return Err(FsError::EndBeyondCapacity {
                family: self.family,
                end: new_end,
                real_end: self.real_end,
            });
        }
        if new_end < self.start {
            return Err(FsError::InvalidArgument(format!(
                "end {} is below start {}",
                new_end, self.start
            )));
        }
        Ok(std::mem::replace(&mut self.end, new_end))
    }

    /// Marks every index past the end up to the real end.
    pub fn set_padding(&mut self) -> Result<()> {
        self.check_magic()?;
        let from = self.end - self.start + 1;
        let to = self.real_end - self.start;
        if from <= to {
            self.backend.mark_extent(from, to - from + 1);
        }
        Ok(())
    }

    /// True if both bitmaps cover the same indices with the same content.
    pub fn compare(&self, other: &Bitmap<'_>) -> Result<bool> {
        self.check_magic()?;
        other.check_magic()?;
        if self.start != other.start || self.end != other.end {
            return Ok(false);
        }
        let nbits = self.end - self.start + 1;
        let mut ours = vec![0; packed_len(TRANSFER_BITS)];
        let mut theirs = vec![0; packed_len(TRANSFER_BITS)];
        let mut bit = 0;
        while bit < nbits {
            let count = (nbits - bit).min(TRANSFER_BITS);
            let len = packed_len(count);
            self.backend.get_range(bit, count, &mut ours);
            other.backend.get_range(bit, count, &mut theirs);
            if ours[..len] != theirs[..len] {
                return Ok(false);
            }
            bit += count;
        }
        Ok(true)
    }

    /// Rebuilds the payload on another backend, keeping its content.
    pub fn convert(&mut self, kind: BackendKind) -> Result<()> {
        self.check_magic()?;
        if kind == self.backend.kind() {
            return Ok(());
        }
        if self.width == IndexWidth::Legacy32 {
            return Err(FsError::InvalidArgument(format!(
                "legacy bitmap {:?} cannot use the {} backend",
                self.description, kind
            )));
        }
        let nbits = self.real_end - self.start + 1;
        let mut target = kind.allocate(nbits)?;
        let mut chunk = vec![0; packed_len(TRANSFER_BITS)];
        let mut bit = 0;
        while bit < nbits {
            let count = (nbits - bit).min(TRANSFER_BITS);
            self.backend.get_range(bit, count, &mut chunk);
            target.set_range(bit, count, &chunk);
            bit += count;
        }
        debug!(
            "converted bitmap {:?} from {} to {}",
            self.description,
            self.backend.kind(),
            kind
        );
        self.backend = target;
        Ok(())
    }

    /// Logs the operation counters and backend statistics.
    pub fn print_stats(&self) {
        let stats = self.stats.get();
        info!(
            "bitmap {:?} ({}, {}): {} marks, {} unmarks, {} tests, {} extent ops, \
             {} range ops, {} searches, {} resizes, {} clears",
            self.description,
            self.family,
            self.backend.kind(),
            stats.marks,
            stats.unmarks,
            stats.tests,
            stats.extent_ops,
            stats.range_ops,
            stats.searches,
            stats.resizes,
            stats.clears
        );
        self.backend.print_stats(&self.description);
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn real_end(&self) -> u64 {
        self.real_end
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.start, self.end, self.real_end)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn family(&self) -> ErrorFamily {
        self.family
    }

    pub fn width(&self) -> IndexWidth {
        self.width
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn stats(&self) -> BitmapStats {
        self.stats.get()
    }

    pub fn fs(&self) -> &'fs Filesystem {
        self.fs
    }
}

impl fmt::Debug for Bitmap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("description", &self.description)
            .field("family", &self.family)
            .field("width", &self.width)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("real_end", &self.real_end)
            .field("backend", &self.backend.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{scratch_fs, FsFlags};

    fn bitmap<'fs>(fs: &'fs Filesystem, kind: BackendKind, bounds: Bounds) -> Bitmap<'fs> {
        Bitmap::with_backend(
            fs,
            ErrorFamily::Generic,
            IndexWidth::Extended64,
            kind,
            bounds,
            "test",
        )
        .unwrap()
    }

    const KINDS: [BackendKind; 2] = [BackendKind::BitArray, BackendKind::RunTree];

    #[test]
    fn find_first_over_a_marked_extent() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        for &kind in &KINDS {
            let mut bmp = bitmap(&fs, kind, Bounds::new(0, 99, 99));
            bmp.mark_extent(10, 10).unwrap();

            assert_eq!(bmp.find_first_set(0, 99).unwrap(), Some(10));
            assert_eq!(bmp.find_first_zero(10, 19).unwrap(), None);
            assert_eq!(bmp.find_first_zero(0, 99).unwrap(), Some(0));
            assert_eq!(bmp.find_first_zero(10, 99).unwrap(), Some(20));
        }
    }

    #[test]
    fn indices_are_absolute() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        for &kind in &KINDS {
            let mut bmp = bitmap(&fs, kind, Bounds::new(1000, 1999, 2047));
            assert!(!bmp.mark(1000).unwrap());
            assert!(bmp.mark(1000).unwrap());
            bmp.mark(1999).unwrap();
            assert_eq!(bmp.find_first_zero(1000, 1999).unwrap(), Some(1001));
            assert_eq!(bmp.find_first_set(1001, 1999).unwrap(), Some(1999));
            assert_eq!(bmp.count_set(1000, 1999).unwrap(), 2);
        }
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        let mut bmp = Bitmap::with_backend(
            &fs,
            ErrorFamily::Block,
            IndexWidth::Extended64,
            BackendKind::BitArray,
            Bounds::new(1, 100, 127),
            "blocks",
        )
        .unwrap();

        let err = bmp.mark(0).unwrap_err();
        assert_eq!(err.code(), ErrorFamily::Block.base_code());
        let err = bmp.unmark(101).unwrap_err();
        assert_eq!(err.code(), ErrorFamily::Block.base_code() + 1);
        let err = bmp.test(120).unwrap_err();
        assert_eq!(err.code(), ErrorFamily::Block.base_code() + 2);

        // Extents may not run past the end or wrap around.
        assert!(bmp.mark_extent(95, 10).is_err());
        assert!(bmp.mark_extent(95, u64::MAX).is_err());
        assert!(bmp.test(96).map(|set| !set).unwrap());
    }

    #[test]
    fn empty_extents_are_no_ops() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        let mut bmp = bitmap(&fs, BackendKind::BitArray, Bounds::new(0, 9, 9));
        bmp.mark_extent(9, 0).unwrap();
        assert!(bmp.test_clear_extent(3, 0).unwrap());
        assert!(bmp.get_range(5, 0).unwrap().is_empty());
        assert!(bmp.mark_extent(10, 0).is_err());
        assert_eq!(bmp.count_set(0, 9).unwrap(), 0);
    }

    #[test]
    fn reversed_windows_are_invalid() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        let bmp = bitmap(&fs, BackendKind::RunTree, Bounds::new(0, 99, 99));
        match bmp.find_first_zero(50, 10) {
            Err(FsError::InvalidArgument(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_clear_extent_reports_and_clears() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        for &kind in &KINDS {
            let mut bmp = bitmap(&fs, kind, Bounds::new(0, 199, 255));
            bmp.mark_extent(20, 30).unwrap();
            assert!(bmp.test_clear_extent(25, 10).unwrap());
            assert!(!bmp.test_clear_extent(15, 30).unwrap());
            assert_eq!(bmp.count_set(0, 199).unwrap(), 5);
            assert_eq!(bmp.find_first_set(0, 199).unwrap(), Some(45));
        }
    }

    #[test]
    fn set_range_requires_enough_data() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        let mut bmp = bitmap(&fs, BackendKind::BitArray, Bounds::new(0, 99, 99));
        match bmp.set_range(0, 17, &[0xff, 0xff]) {
            Err(FsError::InvalidArgument(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
        bmp.set_range(4, 17, &[0xff, 0x0f, 0x01]).unwrap();
        assert_eq!(bmp.get_range(4, 17).unwrap(), vec![0xff, 0x0f, 0x01]);
        assert_eq!(bmp.count_set(0, 99).unwrap(), 13);
    }

    #[test]
    fn resize_grows_and_shrinks_with_zero_fill() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        for &kind in &KINDS {
            let mut bmp = bitmap(&fs, kind, Bounds::new(0, 99, 127));
            bmp.mark_extent(0, 100).unwrap();
            bmp.set_padding().unwrap();

            bmp.resize(499, 511).unwrap();
            assert_eq!(bmp.count_set(0, 499).unwrap(), 100);
            assert_eq!(bmp.find_first_zero(0, 499).unwrap(), Some(100));

            bmp.resize(49, 63).unwrap();
            bmp.resize(99, 127).unwrap();
            assert_eq!(bmp.count_set(0, 99).unwrap(), 50);
            assert_eq!(bmp.stats().resizes, 3);
        }
    }

    #[test]
    fn failed_resize_leaves_bitmap_untouched() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        let mut bmp = bitmap(&fs, BackendKind::BitArray, Bounds::new(10, 99, 99));
        bmp.mark(50).unwrap();

        assert!(matches!(bmp.resize(5, 99), Err(FsError::ResizeFailure { .. })));
        assert!(matches!(bmp.resize(120, 110), Err(FsError::ResizeFailure { .. })));
        assert!(matches!(
            bmp.resize(100, u64::MAX - 64),
            Err(FsError::ResizeFailure { .. })
        ));
        assert_eq!(bmp.bounds(), Bounds::new(10, 99, 99));
        assert!(bmp.test(50).unwrap());
    }

    #[test]
    fn legacy_bitmaps_stay_small_and_packed() {
        let fs = scratch_fs(FsFlags::RW);
        let too_big = Bitmap::with_backend(
            &fs,
            ErrorFamily::Inode,
            IndexWidth::Legacy32,
            BackendKind::BitArray,
            Bounds::new(1, 10, 1 << 33),
            "inodes",
        );
        assert!(matches!(too_big, Err(FsError::LegacyBitmapTooLarge { .. })));

        let mut bmp = Bitmap::with_backend(
            &fs,
            ErrorFamily::Inode,
            IndexWidth::Legacy32,
            BackendKind::RunTree,
            Bounds::new(1, 64, 64),
            "inodes",
        )
        .unwrap();
        assert_eq!(bmp.backend_kind(), BackendKind::BitArray);
        assert!(bmp.convert(BackendKind::RunTree).is_err());
    }

    #[test]
    fn copies_are_independent_and_compare_equal() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        let mut bmp = bitmap(&fs, BackendKind::RunTree, Bounds::new(0, 9999, 9999));
        bmp.mark_extent(100, 5000).unwrap();

        let mut copy = bmp.copy().unwrap();
        assert_eq!(copy.description(), "copy of test");
        assert!(bmp.compare(&copy).unwrap());

        copy.unmark(9000).unwrap();
        assert!(bmp.compare(&copy).unwrap());
        copy.unmark(4000).unwrap();
        assert!(!bmp.compare(&copy).unwrap());
        assert!(bmp.test(4000).unwrap());
    }

    #[test]
    fn convert_keeps_content() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        let mut bmp = bitmap(&fs, BackendKind::BitArray, Bounds::new(0, 40_000, 40_959));
        bmp.mark_extent(3, 7).unwrap();
        bmp.mark_extent(33_000, 2_000).unwrap();
        let before = bmp.copy().unwrap();

        bmp.convert(BackendKind::RunTree).unwrap();
        assert_eq!(bmp.backend_kind(), BackendKind::RunTree);
        assert!(bmp.compare(&before).unwrap());
    }

    #[test]
    fn fudge_end_stays_within_capacity() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        let mut bmp = bitmap(&fs, BackendKind::BitArray, Bounds::new(0, 99, 127));
        assert_eq!(bmp.fudge_end(127).unwrap(), 99);
        bmp.mark(120).unwrap();
        assert!(matches!(
            bmp.fudge_end(128),
            Err(FsError::EndBeyondCapacity { .. })
        ));
    }

    #[test]
    fn corrupted_magic_is_reported_first() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        let mut bmp = Bitmap::with_backend(
            &fs,
            ErrorFamily::Block,
            IndexWidth::Extended64,
            BackendKind::BitArray,
            Bounds::new(0, 9, 9),
            "blocks",
        )
        .unwrap();
        bmp.magic = 0;

        let err = bmp.mark(500).unwrap_err();
        assert!(matches!(err, FsError::CorruptStructure { found: 0, .. }));
        assert_eq!(
            err.code(),
            Structure::Bitmap(ErrorFamily::Block, IndexWidth::Extended64).magic()
        );
        assert!(bmp.find_first_zero(0, 9).is_err());
    }

    #[test]
    fn clear_wipes_everything() {
        let fs = scratch_fs(FsFlags::RW | FsFlags::BITMAPS_64);
        for &kind in &KINDS {
            let mut bmp = bitmap(&fs, kind, Bounds::new(0, 99, 127));
            bmp.mark_extent(0, 100).unwrap();
            bmp.set_padding().unwrap();
            bmp.clear().unwrap();
            assert_eq!(bmp.find_first_set(0, 99).unwrap(), None);
            assert_eq!(bmp.stats().clears, 1);

            // The padding goes too.
            bmp.fudge_end(127).unwrap();
            assert_eq!(bmp.find_first_set(0, 127).unwrap(), None);
            bmp.free();
        }
    }
}
