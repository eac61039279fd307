use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A queue of `Buf`s presented as one contiguous-enough `Buf`, for
/// vectored writes.
pub(crate) struct BufList<T> {
    bufs: VecDeque<T>,
}

impl<T: Buf> BufList<T> {
    pub(crate) fn new() -> BufList<T> {
        BufList {
            bufs: VecDeque::new(),
        }
    }

    #[inline]
    pub(crate) fn push(&mut self, buf: T) {
        debug_assert!(buf.has_remaining());
        self.bufs.push_back(buf);
    }

    #[inline]
    pub(crate) fn bufs_cnt(&self) -> usize {
        self.bufs.len()
    }
}

impl<T: Buf> Buf for BufList<T> {
    #[inline]
    fn remaining(&self) -> usize {
        self.bufs.iter().map(|buf| buf.remaining()).sum()
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        self.bufs.front().map(Buf::chunk).unwrap_or_default()
    }

    #[inline]
    fn advance(&mut self, mut cnt: usize) {
        while cnt > 0 {
            {
                let front = &mut self.bufs[0];
                let rem = front.remaining();
                if rem > cnt {
                    front.advance(cnt);
                    return;
                } else {
                    front.advance(rem);
                    cnt -= rem;
                }
            }
            self.bufs.pop_front();
        }
    }

    #[inline]
    fn chunks_vectored<'t>(&'t self, dst: &mut [IoSlice<'t>]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let mut vecs = 0;
        for buf in &self.bufs {
            vecs += buf.chunks_vectored(&mut dst[vecs..]);
            if vecs == dst.len() {
                break;
            }
        }
        vecs
    }

    #[inline]
    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        // Our owned bufs are Bytes underneath, so the common case of
        // draining exactly the front buf stays zero-copy.
        if let Some(front) = self.bufs.front_mut() {
            if front.remaining() == len {
                let b = front.copy_to_bytes(len);
                self.bufs.pop_front();
                return b;
            }
        }
        assert!(len <= self.remaining(), "`len` greater than remaining");
        let mut bm = BytesMut::with_capacity(len);
        bm.put(self.take(len));
        bm.freeze()
    }
}

impl<T> std::fmt::Debug for BufList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufList")
            .field("bufs", &self.bufs.len())
            .finish()
    }
}

/// A `Buf` over owned bytes with an explicit read position.
///
/// Used for the write side of a buffered connection, where header bytes
/// are accumulated into a reusable `Vec` and drained across several
/// syscalls.
#[derive(Clone)]
pub(crate) struct Cursor<T> {
    bytes: T,
    pos: usize,
}

impl<T: AsRef<[u8]>> Cursor<T> {
    #[inline]
    pub(crate) fn new(bytes: T) -> Cursor<T> {
        Cursor { bytes, pos: 0 }
    }
}

impl Cursor<Vec<u8>> {
    pub(crate) fn reset(&mut self) {
        self.pos = 0;
        self.bytes.clear();
    }

    pub(crate) fn get_mut(&mut self) -> &mut Vec<u8> {
        debug_assert_eq!(self.pos, 0, "cannot append while partially drained");
        &mut self.bytes
    }
}

impl<T: AsRef<[u8]>> std::fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("pos", &self.pos)
            .field("len", &self.bytes.as_ref().len())
            .finish()
    }
}

impl<T: AsRef<[u8]>> Buf for Cursor<T> {
    #[inline]
    fn remaining(&self) -> usize {
        self.bytes.as_ref().len() - self.pos
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        &self.bytes.as_ref()[self.pos..]
    }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        debug_assert!(self.pos + cnt <= self.bytes.as_ref().len());
        self.pos += cnt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_drains_and_resets() {
        let mut cur = Cursor::new(b"abcdef".to_vec());
        assert_eq!(cur.remaining(), 6);
        cur.advance(4);
        assert_eq!(cur.chunk(), b"ef");
        cur.advance(2);
        assert_eq!(cur.remaining(), 0);
        cur.reset();
        assert_eq!(cur.remaining(), 0);
        cur.get_mut().extend_from_slice(b"xy");
        assert_eq!(cur.chunk(), b"xy");
    }
}
