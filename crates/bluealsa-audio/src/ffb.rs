//! Fixed-byte staging buffer.
//!
//! Append-only buffer with a single write cursor; consuming from the
//! front compacts the remainder. Every transport I/O thread owns its
//! buffers outright, so there is no interior locking.

/// Fixed-capacity staging buffer for PCM samples or wire bytes.
///
/// `len_in` is the writable remainder, `len_out` the readable content.
/// Writers fill [`Ffb::tail_mut`] and commit with [`Ffb::seek`]; readers
/// take from [`Ffb::data`] and release with [`Ffb::shift`].
#[derive(Debug)]
pub struct Ffb<T = u8> {
    buf: Vec<T>,
    len: usize,
}

impl<T: Copy + Default> Ffb<T> {
    /// Allocate a buffer holding `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        Ffb { buf: vec![T::default(); capacity], len: 0 }
    }

    /// Total capacity in elements.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Writable elements remaining.
    pub fn len_in(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Readable elements available.
    pub fn len_out(&self) -> usize {
        self.len
    }

    /// The readable region.
    pub fn data(&self) -> &[T] {
        &self.buf[..self.len]
    }

    /// The writable region past the write cursor.
    pub fn tail_mut(&mut self) -> &mut [T] {
        let len = self.len;
        &mut self.buf[len..]
    }

    /// Advance the write cursor by `n` elements just written.
    pub fn seek(&mut self, n: usize) {
        debug_assert!(n <= self.len_in());
        self.len += n;
    }

    /// Consume `n` elements from the front and compact the remainder.
    pub fn shift(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// Drop all content.
    pub fn rewind(&mut self) {
        self.len = 0;
    }

    /// Append as much of `src` as fits; returns the number copied.
    pub fn append(&mut self, src: &[T]) -> usize {
        let n = src.len().min(self.len_in());
        let len = self.len;
        self.buf[len..len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let ffb: Ffb = Ffb::new(16);
        assert_eq!(ffb.len_in(), 16);
        assert_eq!(ffb.len_out(), 0);
        assert!(ffb.data().is_empty());
    }

    #[test]
    fn seek_commits_written_data() {
        let mut ffb: Ffb = Ffb::new(8);
        ffb.tail_mut()[..3].copy_from_slice(&[1, 2, 3]);
        ffb.seek(3);
        assert_eq!(ffb.data(), &[1, 2, 3]);
        assert_eq!(ffb.len_in(), 5);
    }

    #[test]
    fn shift_compacts_front() {
        let mut ffb: Ffb = Ffb::new(8);
        ffb.append(&[1, 2, 3, 4, 5]);
        ffb.shift(2);
        assert_eq!(ffb.data(), &[3, 4, 5]);
        assert_eq!(ffb.len_in(), 5);
        ffb.append(&[6]);
        assert_eq!(ffb.data(), &[3, 4, 5, 6]);
    }

    #[test]
    fn rewind_resets_cursor() {
        let mut ffb: Ffb = Ffb::new(4);
        ffb.append(&[9, 9]);
        ffb.rewind();
        assert_eq!(ffb.len_out(), 0);
        assert_eq!(ffb.len_in(), 4);
    }

    #[test]
    fn append_truncates_at_capacity() {
        let mut ffb: Ffb = Ffb::new(4);
        assert_eq!(ffb.append(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(ffb.data(), &[1, 2, 3, 4]);
        assert_eq!(ffb.append(&[7]), 0);
    }

    #[test]
    fn sample_buffer() {
        let mut ffb: Ffb<i16> = Ffb::new(4);
        ffb.append(&[-1, 0, 1]);
        assert_eq!(ffb.data(), &[-1, 0, 1]);
        ffb.shift(1);
        assert_eq!(ffb.data(), &[0, 1]);
    }
}
