use std::convert::TryFrom;

use log::debug;

use crate::alloc::backend::{packed_bit, packed_len, BackendKind, BitmapBackend};
use crate::error::{FsError, Result};

/// Mask selecting bits `lo..=hi` of a word.
fn word_mask(lo: u64, hi: u64) -> u64 {
    debug_assert!(lo <= hi && hi < 64);
    (u64::MAX >> (63 - hi)) & (u64::MAX << lo)
}

fn words_for(nbits: u64) -> u64 {
    nbits / 64 + u64::from(nbits % 64 != 0)
}

/// Reserves `additional` words without touching `words` on failure.
fn reserve(words: &mut Vec<u64>, additional: u64) -> Result<()> {
    let bytes = additional.saturating_mul(8);
    let additional =
        usize::try_from(additional).map_err(|_| FsError::AllocationFailure { bytes })?;
    words
        .try_reserve_exact(additional)
        .map_err(|_| FsError::AllocationFailure { bytes })
}

/// Packed bit storage. Bit `n` lives in word `n / 64` at position `n % 64`,
/// which is the same order as the LSB-first byte transfer format.
#[derive(Debug, Clone)]
pub struct BitArray {
    /// Stores the bits of the bitmap from the bitmap's start to its real end.
    words: Vec<u64>,
    /// Capacity in bits.
    nbits: u64,
}

impl BitArray {
    pub fn new(nbits: u64) -> Result<Self> {
        let mut words = Vec::new();
        let nwords = words_for(nbits);
        reserve(&mut words, nwords)?;
        words.resize(nwords as usize, 0);
        Ok(Self { words, nbits })
    }

    /// Applies `f` to every word overlapping `[bit, bit + count)` together
    /// with the mask of the extent's bits in that word. Stops early when `f`
    /// returns false.
    fn for_each_word<F>(&mut self, bit: u64, count: u64, mut f: F)
    where
        F: FnMut(&mut u64, u64) -> bool,
    {
        if count == 0 {
            return;
        }
        let last = bit + count - 1;
        for w in (bit / 64)..=(last / 64) {
            let lo = if w == bit / 64 { bit % 64 } else { 0 };
            let hi = if w == last / 64 { last % 64 } else { 63 };
            if !f(&mut self.words[w as usize], word_mask(lo, hi)) {
                return;
            }
        }
    }

    /// Index of the first word position in `[start, end]` where `view(word)`
    /// has a bit set.
    fn scan(&self, start: u64, end: u64, view: impl Fn(u64) -> u64) -> Option<u64> {
        for w in (start / 64)..=(end / 64) {
            let lo = if w == start / 64 { start % 64 } else { 0 };
            let hi = if w == end / 64 { end % 64 } else { 63 };
            let hits = view(self.words[w as usize]) & word_mask(lo, hi);
            if hits != 0 {
                return Some(w * 64 + u64::from(hits.trailing_zeros()));
            }
        }
        None
    }

    /// Eight bits starting at `bit`, bits past capacity read as zero.
    fn byte_at(&self, bit: u64) -> u8 {
        let w = (bit / 64) as usize;
        let off = bit % 64;
        let mut v = self.words[w] >> off;
        if off > 56 && w + 1 < self.words.len() {
            v |= self.words[w + 1] << (64 - off);
        }
        v as u8
    }
}

impl BitmapBackend for BitArray {
    fn kind(&self) -> BackendKind {
        BackendKind::BitArray
    }

    fn duplicate(&self) -> Result<Box<dyn BitmapBackend>> {
        let mut words = Vec::new();
        reserve(&mut words, self.words.len() as u64)?;
        words.extend_from_slice(&self.words);
        Ok(Box::new(BitArray {
            words,
            nbits: self.nbits,
        }))
    }

    fn resize(&mut self, end: u64, new_end: u64, new_real_end: u64) -> Result<()> {
        let nbits = new_real_end + 1;
        let nwords = words_for(nbits);
        let have = self.words.len() as u64;
        if nwords > have {
            reserve(&mut self.words, nwords - have)?;
        }
        self.words.resize(nwords as usize, 0);
        self.nbits = nbits;

        // Anything between the old and new end must read as zero, whether it is
        // newly exposed or was just cut off.
        let lo = end.min(new_end) + 1;
        let hi = end.max(new_end).min(new_real_end);
        if lo <= hi {
            self.unmark_extent(lo, hi - lo + 1);
        }
        // Bits past capacity in the last word.
        if nbits % 64 != 0 {
            let last = self.words.len() - 1;
            self.words[last] &= word_mask(0, nbits % 64 - 1);
        }
        Ok(())
    }

    fn mark(&mut self, bit: u64) -> bool {
        // Grab the u64 containing the significant bit.
        let word = &mut self.words[(bit / 64) as usize];
        let mask = 1_u64 << (bit % 64);
        let old = *word & mask != 0;
        *word |= mask;
        old
    }

    fn unmark(&mut self, bit: u64) -> bool {
        let word = &mut self.words[(bit / 64) as usize];
        let mask = 1_u64 << (bit % 64);
        let old = *word & mask != 0;
        *word &= !mask;
        old
    }

    fn test(&self, bit: u64) -> bool {
        let word = self.words[(bit / 64) as usize];
        (word >> (bit % 64)) & 1 == 1
    }

    fn mark_extent(&mut self, bit: u64, count: u64) {
        self.for_each_word(bit, count, |word, mask| {
            *word |= mask;
            true
        });
    }

    fn unmark_extent(&mut self, bit: u64, count: u64) {
        self.for_each_word(bit, count, |word, mask| {
            *word &= !mask;
            true
        });
    }

    fn test_clear_extent(&mut self, bit: u64, count: u64) -> bool {
        let mut all_set = true;
        self.for_each_word(bit, count, |word, mask| {
            all_set = *word & mask == mask;
            all_set
        });
        self.unmark_extent(bit, count);
        all_set
    }

    fn set_range(&mut self, bit: u64, count: u64, data: &[u8]) {
        let mut i = 0;
        // Whole words can be copied straight across when the extent is word
        // aligned.
        if bit % 64 == 0 {
            while i + 64 <= count {
                let at = (i / 8) as usize;
                let mut le = [0u8; 8];
                le.copy_from_slice(&data[at..at + 8]);
                self.words[((bit + i) / 64) as usize] = u64::from_le_bytes(le);
                i += 64;
            }
        }
        while i < count {
            if packed_bit(data, i) {
                self.mark(bit + i);
            } else {
                self.unmark(bit + i);
            }
            i += 1;
        }
    }

    fn get_range(&self, bit: u64, count: u64, out: &mut [u8]) {
        let len = packed_len(count);
        for (j, byte) in out[..len].iter_mut().enumerate() {
            *byte = self.byte_at(bit + 8 * j as u64);
        }
        if count % 8 != 0 {
            out[len - 1] &= (1u8 << (count % 8)) - 1;
        }
    }

    fn clear(&mut self) {
        for word in self.words.iter_mut() {
            *word = 0;
        }
    }

    fn print_stats(&self, description: &str) {
        debug!(
            "bitarray {:?}: {} bits in {} words",
            description,
            self.nbits,
            self.words.len()
        );
    }

    fn count_set(&self, bit: u64, count: u64) -> u64 {
        if count == 0 {
            return 0;
        }
        let last = bit + count - 1;
        let mut total = 0;
        for w in (bit / 64)..=(last / 64) {
            let lo = if w == bit / 64 { bit % 64 } else { 0 };
            let hi = if w == last / 64 { last % 64 } else { 63 };
            total += u64::from((self.words[w as usize] & word_mask(lo, hi)).count_ones());
        }
        total
    }

    fn find_first_zero(&self, start: u64, end: u64) -> Option<u64> {
        self.scan(start, end, |word| !word)
    }

    fn find_first_set(&self, start: u64, end: u64) -> Option<u64> {
        self.scan(start, end, |word| word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut bmp = BitArray::new(4096).unwrap();

        assert!(!bmp.mark(2));

        assert!(!bmp.test(0));
        assert!(bmp.test(2));
        assert!(bmp.mark(2));
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut bmp = BitArray::new(4096).unwrap();

        bmp.mark(0);
        bmp.mark(4095);

        assert!(bmp.test(0));
        assert!(bmp.test(4095));
        assert_eq!(bmp.count_set(0, 4096), 2);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut bmp = BitArray::new(64).unwrap();
        bmp.mark(9);

        bmp.mark(10);
        assert!(bmp.test(10));

        assert!(bmp.unmark(10));
        assert!(!bmp.test(10));
        // Neighbours are untouched.
        assert!(bmp.test(9));
    }

    #[test]
    fn extents_cross_word_boundaries() {
        let mut bmp = BitArray::new(300).unwrap();
        bmp.mark_extent(60, 140);

        assert!(!bmp.test(59));
        assert!((60..200).all(|i| bmp.test(i)));
        assert!(!bmp.test(200));
        assert_eq!(bmp.count_set(0, 300), 140);

        bmp.unmark_extent(64, 64);
        assert_eq!(bmp.count_set(0, 300), 76);
        assert_eq!(bmp.find_first_zero(60, 299), Some(64));
        assert_eq!(bmp.find_first_set(64, 299), Some(128));
    }

    #[test]
    fn test_clear_extent_clears_on_partial_match() {
        let mut bmp = BitArray::new(256).unwrap();
        bmp.mark_extent(10, 100);
        assert!(bmp.test_clear_extent(10, 100));
        assert_eq!(bmp.count_set(0, 256), 0);

        bmp.mark_extent(70, 10);
        // Stops comparing at the first partial word but still clears everything.
        assert!(!bmp.test_clear_extent(0, 200));
        assert_eq!(bmp.count_set(0, 256), 0);
    }

    #[test]
    fn unaligned_ranges_round_trip() {
        let mut bmp = BitArray::new(200).unwrap();
        let data = [0b1010_0101, 0xff, 0x00, 0b0000_0011];
        bmp.set_range(13, 26, &data);

        let mut out = [0u8; 4];
        bmp.get_range(13, 26, &mut out);
        assert_eq!(out, [0b1010_0101, 0xff, 0x00, 0b0000_0011]);
        assert!(bmp.test(13));
        assert!(!bmp.test(14));
        assert!(!bmp.test(12));
    }

    #[test]
    fn aligned_ranges_copy_whole_words() {
        let mut bmp = BitArray::new(256).unwrap();
        let data: Vec<u8> = (0..20).map(|i| i as u8 * 13).collect();
        bmp.set_range(64, 160, &data);

        let mut out = vec![0u8; 20];
        bmp.get_range(64, 160, &mut out);
        assert_eq!(out, data);
    }

    #[test]
    fn get_range_masks_trailing_bits() {
        let mut bmp = BitArray::new(64).unwrap();
        bmp.mark_extent(0, 64);
        let mut out = [0u8; 2];
        bmp.get_range(0, 11, &mut out);
        assert_eq!(out, [0xff, 0b0000_0111]);
    }

    #[test]
    fn resize_zeroes_exposed_and_discarded_bits() {
        let mut bmp = BitArray::new(100).unwrap();
        bmp.mark_extent(0, 100);

        // Shrink the end to 49 within the same capacity.
        bmp.resize(99, 49, 99).unwrap();
        assert!(bmp.test(49));
        assert!(!bmp.test(50));
        assert!(!bmp.test(99));

        // Grow past the old capacity.
        bmp.resize(49, 999, 1023).unwrap();
        assert_eq!(bmp.count_set(0, 1024), 50);
        bmp.mark(1023);
        assert!(bmp.test(1023));
    }

    #[test]
    fn duplicate_is_independent() {
        let mut bmp = BitArray::new(128).unwrap();
        bmp.mark(5);
        let mut copy = bmp.duplicate().unwrap();
        copy.mark(6);
        assert!(copy.test(5));
        assert!(!bmp.test(6));
        assert_eq!(copy.kind(), BackendKind::BitArray);
    }

    #[test]
    fn oversized_allocation_fails_cleanly() {
        match BitArray::new(u64::MAX - 64) {
            Err(FsError::AllocationFailure { .. }) => (),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }
}
