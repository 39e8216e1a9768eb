//! Helpers for performing vectored (scatter/gather) writes of a piece's
//! blocks across however many files the piece straddles.
//!
//! A piece's blocks live in memory as separate, non-contiguous buffers.
//! When the piece is flushed to disk, as many of those buffers as possible
//! should be written in a single write call, but writes aren't guaranteed
//! to consume the whole input, and a piece that straddles a file boundary
//! needs to stop short of writing past the end of the current file. These
//! two utilities track that bookkeeping without copying block data.

/// A borrowed, non-owning view of a single write buffer.
#[derive(Clone, Copy)]
pub(crate) struct IoVec<'a>(&'a [u8]);

impl<'a> IoVec<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self(buf)
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.0
    }
}

/// A sequence of write buffers, optionally capped to a maximum total byte
/// count (used when a piece's blocks need to be split across file
/// boundaries).
pub(crate) struct IoVecs<'a> {
    bufs: Vec<IoVec<'a>>,
    /// `Some(n)` caps the buffers returned by [`IoVecs::buffers`] to at
    /// most `n` bytes total, e.g. when the next file the piece overlaps
    /// with is shorter than the remaining blocks. `None` means the full
    /// buffer list is always returned.
    bound: Option<usize>,
}

impl<'a> IoVecs<'a> {
    /// Wraps `bufs` without a length cap.
    pub fn unbounded(bufs: Vec<IoVec<'a>>) -> Self {
        Self { bufs, bound: None }
    }

    /// Wraps `bufs`, capping [`IoVecs::buffers`] to at most `bound` bytes.
    pub fn bounded(bufs: Vec<IoVec<'a>>, bound: usize) -> Self {
        Self {
            bufs,
            bound: Some(bound),
        }
    }

    /// Returns the buffers that should be passed to the next write call,
    /// truncating the final buffer if it would exceed the configured
    /// bound.
    pub fn buffers(&self) -> Vec<IoVec<'a>> {
        let bound = match self.bound {
            Some(bound) => bound,
            None => return self.bufs.clone(),
        };
        let mut out = Vec::with_capacity(self.bufs.len());
        let mut remaining = bound;
        for buf in &self.bufs {
            if remaining == 0 {
                break;
            }
            let slice = buf.as_slice();
            if slice.len() <= remaining {
                out.push(*buf);
                remaining -= slice.len();
            } else {
                out.push(IoVec::from_slice(&slice[..remaining]));
                remaining = 0;
            }
        }
        out
    }

    /// Advances past the first `n` written bytes, dropping fully consumed
    /// buffers and splitting a partially consumed one.
    ///
    /// # Panics
    ///
    /// Panics if `n` is larger than the total length of the buffers
    /// returned by the most recent call to [`IoVecs::buffers`].
    pub fn advance(&mut self, mut n: usize) {
        if let Some(bound) = &mut self.bound {
            *bound = bound.saturating_sub(n);
        }
        while n > 0 {
            let first = self.bufs.first().expect("advance past end of buffers").as_slice();
            if first.len() <= n {
                n -= first.len();
                self.bufs.remove(0);
            } else {
                self.bufs[0] = IoVec::from_slice(&first[n..]);
                n = 0;
            }
        }
    }

    /// Consumes `self`, returning whatever buffers (or buffer remainders)
    /// have not yet been written, for use in the next file's write.
    pub fn into_tail(self) -> Vec<IoVec<'a>> {
        self.bufs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_returns_all_buffers() {
        let bufs = vec![IoVec::from_slice(b"abc"), IoVec::from_slice(b"de")];
        let iovecs = IoVecs::unbounded(bufs);
        let total: usize = iovecs.buffers().iter().map(|b| b.as_slice().len()).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn bounded_truncates_last_buffer() {
        let bufs = vec![IoVec::from_slice(b"abc"), IoVec::from_slice(b"defgh")];
        let iovecs = IoVecs::bounded(bufs, 4);
        let buffers = iovecs.buffers();
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[0].as_slice(), b"abc");
        assert_eq!(buffers[1].as_slice(), b"d");
    }

    #[test]
    fn advance_drops_consumed_buffers_and_splits_partial_one() {
        let bufs = vec![IoVec::from_slice(b"abc"), IoVec::from_slice(b"defgh")];
        let mut iovecs = IoVecs::unbounded(bufs);
        iovecs.advance(4);
        let tail = iovecs.into_tail();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].as_slice(), b"efgh");
    }

    #[test]
    fn advance_across_exact_buffer_boundary() {
        let bufs = vec![IoVec::from_slice(b"abc"), IoVec::from_slice(b"de")];
        let mut iovecs = IoVecs::unbounded(bufs);
        iovecs.advance(3);
        let tail = iovecs.into_tail();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].as_slice(), b"de");
    }
}
