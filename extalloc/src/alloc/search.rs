//! Word-at-a-time searches built only on [`BitmapBackend::get_range`].
//!
//! Backends that cannot search their own representation get these through the
//! trait's default methods.

use crate::alloc::backend::BitmapBackend;

const CHUNK: u64 = 64;

fn low_mask(n: u64) -> u64 {
    if n >= 64 {
        u64::MAX
    } else {
        (1 << n) - 1
    }
}

/// Walks `[start, end]` in 64-bit chunks, handing each chunk's first bit,
/// contents and valid-bit mask to `f` until it returns something.
fn chunks<B, T, F>(backend: &B, start: u64, end: u64, mut f: F) -> Option<T>
where
    B: BitmapBackend + ?Sized,
    F: FnMut(u64, u64, u64) -> Option<T>,
{
    let mut pos = start;
    while pos <= end {
        let n = (end - pos + 1).min(CHUNK);
        let mut buf = [0u8; 8];
        backend.get_range(pos, n, &mut buf);
        if let Some(found) = f(pos, u64::from_le_bytes(buf), low_mask(n)) {
            return Some(found);
        }
        pos = pos.checked_add(n)?;
    }
    None
}

pub fn generic_find_first_zero<B>(backend: &B, start: u64, end: u64) -> Option<u64>
where
    B: BitmapBackend + ?Sized,
{
    chunks(backend, start, end, |pos, word, mask| {
        let hits = !word & mask;
        if hits != 0 {
            Some(pos + u64::from(hits.trailing_zeros()))
        } else {
            None
        }
    })
}

pub fn generic_find_first_set<B>(backend: &B, start: u64, end: u64) -> Option<u64>
where
    B: BitmapBackend + ?Sized,
{
    chunks(backend, start, end, |pos, word, mask| {
        let hits = word & mask;
        if hits != 0 {
            Some(pos + u64::from(hits.trailing_zeros()))
        } else {
            None
        }
    })
}

pub fn generic_count_set<B>(backend: &B, bit: u64, count: u64) -> u64
where
    B: BitmapBackend + ?Sized,
{
    if count == 0 {
        return 0;
    }
    let mut total = 0;
    chunks::<B, (), _>(backend, bit, bit + count - 1, |_, word, mask| {
        total += u64::from((word & mask).count_ones());
        None
    });
    total
}
