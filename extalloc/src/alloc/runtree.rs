use std::collections::BTreeMap;

use log::debug;

use crate::alloc::backend::{packed_bit, set_packed_bits, BackendKind, BitmapBackend};
use crate::error::Result;

/// Run-length storage: set bits are kept as an ordered map from the first bit
/// of a run to its length. Runs never overlap or touch; inserting merges with
/// neighbours and removing splits.
///
/// Cheap for the long free/used stretches typical of block bitmaps. Searches
/// go through the generic word scan.
#[derive(Debug, Clone, Default)]
pub struct RunTree {
    runs: BTreeMap<u64, u64>,
    /// Capacity in bits.
    nbits: u64,
}

impl RunTree {
    pub fn new(nbits: u64) -> Self {
        Self {
            runs: BTreeMap::new(),
            nbits,
        }
    }

    /// The run holding `bit`, as `(start, len)`.
    fn run_containing(&self, bit: u64) -> Option<(u64, u64)> {
        let (&start, &len) = self.runs.range(..=bit).next_back()?;
        if bit < start + len {
            Some((start, len))
        } else {
            None
        }
    }

    fn insert(&mut self, bit: u64, count: u64) {
        if count == 0 {
            return;
        }
        let mut lo = bit;
        let mut hi = bit + count;
        if let Some((&start, &len)) = self.runs.range(..=bit).next_back() {
            if start + len >= bit {
                lo = start;
                hi = hi.max(start + len);
            }
        }
        let absorbed: Vec<u64> = self.runs.range(lo..=hi).map(|(&start, _)| start).collect();
        for start in absorbed {
            if let Some(len) = self.runs.remove(&start) {
                hi = hi.max(start + len);
            }
        }
        self.runs.insert(lo, hi - lo);
    }

    fn remove(&mut self, bit: u64, count: u64) {
        if count == 0 {
            return;
        }
        let end = bit.saturating_add(count);
        if let Some((&start, &len)) = self.runs.range(..bit).next_back() {
            if start + len > bit {
                self.runs.insert(start, bit - start);
                if start + len > end {
                    self.runs.insert(end, start + len - end);
                }
            }
        }
        let inside: Vec<(u64, u64)> = self
            .runs
            .range(bit..end)
            .map(|(&start, &len)| (start, len))
            .collect();
        for (start, len) in inside {
            self.runs.remove(&start);
            if start + len > end {
                self.runs.insert(end, start + len - end);
            }
        }
    }

    /// Runs overlapping `[bit, bit + count)`, clipped to it.
    fn overlapping(&self, bit: u64, count: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        let end = bit + count;
        let from = self.run_containing(bit).map_or(bit, |(start, _)| start);
        self.runs
            .range(from..end)
            .map(move |(&start, &len)| (start.max(bit), (start + len).min(end)))
    }
}

impl BitmapBackend for RunTree {
    fn kind(&self) -> BackendKind {
        BackendKind::RunTree
    }

    fn duplicate(&self) -> Result<Box<dyn BitmapBackend>> {
        Ok(Box::new(self.clone()))
    }

    fn resize(&mut self, end: u64, new_end: u64, new_real_end: u64) -> Result<()> {
        let lo = end.min(new_end) + 1;
        let hi = end.max(new_end);
        if lo <= hi {
            self.remove(lo, hi - lo + 1);
        }
        let nbits = new_real_end + 1;
        if nbits < self.nbits {
            self.remove(nbits, self.nbits - nbits);
        }
        self.nbits = nbits;
        Ok(())
    }

    fn mark(&mut self, bit: u64) -> bool {
        let old = self.test(bit);
        if !old {
            self.insert(bit, 1);
        }
        old
    }

    fn unmark(&mut self, bit: u64) -> bool {
        let old = self.test(bit);
        if old {
            self.remove(bit, 1);
        }
        old
    }

    fn test(&self, bit: u64) -> bool {
        self.run_containing(bit).is_some()
    }

    fn mark_extent(&mut self, bit: u64, count: u64) {
        self.insert(bit, count);
    }

    fn unmark_extent(&mut self, bit: u64, count: u64) {
        self.remove(bit, count);
    }

    fn test_clear_extent(&mut self, bit: u64, count: u64) -> bool {
        let all_set = count == 0
            || self
                .run_containing(bit)
                .map_or(false, |(start, len)| start + len >= bit + count);
        self.remove(bit, count);
        all_set
    }

    fn set_range(&mut self, bit: u64, count: u64, data: &[u8]) {
        self.remove(bit, count);
        let mut run_start = None;
        for i in 0..count {
            match (packed_bit(data, i), run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(start)) => {
                    self.insert(bit + start, i - start);
                    run_start = None;
                }
                _ => (),
            }
        }
        if let Some(start) = run_start {
            self.insert(bit + start, count - start);
        }
    }

    fn get_range(&self, bit: u64, count: u64, out: &mut [u8]) {
        let len = ((count + 7) / 8) as usize;
        for byte in out[..len].iter_mut() {
            *byte = 0;
        }
        for (lo, hi) in self.overlapping(bit, count) {
            set_packed_bits(out, lo - bit, hi - bit);
        }
    }

    fn clear(&mut self) {
        self.runs.clear();
    }

    fn print_stats(&self, description: &str) {
        let set: u64 = self.runs.values().sum();
        debug!(
            "runtree {:?}: {} runs covering {} of {} bits",
            description,
            self.runs.len(),
            set,
            self.nbits
        );
    }

    fn count_set(&self, bit: u64, count: u64) -> u64 {
        self.overlapping(bit, count).map(|(lo, hi)| hi - lo).sum()
    }
}
