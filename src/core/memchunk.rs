//! Chunks are borrowed views into memory blocks, plus the frame alignment
//! helper that re-blocks arbitrary chunk streams.

use std::cell::Ref;

use super::memblock::{MemBlock, Mempool};

/// A `(block, index, length)` view into a [`MemBlock`].
///
/// Chunks are value types; cloning one shares the underlying block.
#[derive(Clone, Debug)]
pub struct MemChunk {
    /// The block holding the audio data.
    pub block: MemBlock,
    /// Offset of the view within the block, in bytes.
    pub index: usize,
    /// Length of the view, in bytes.
    pub length: usize,
}

impl MemChunk {
    /// A chunk covering a whole block.
    pub fn from_block(block: MemBlock) -> Self {
        let length = block.len();
        Self {
            block,
            index: 0,
            length,
        }
    }

    /// Whether the view is empty. Empty chunks are no-ops everywhere.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Read access to the viewed bytes.
    pub fn data(&self) -> Ref<'_, [u8]> {
        debug_assert!(self.index + self.length <= self.block.len());
        Ref::map(self.block.data(), |d| {
            &d[self.index..self.index + self.length]
        })
    }

    /// A sub-view of this chunk.
    pub fn slice(&self, offset: usize, length: usize) -> MemChunk {
        debug_assert!(offset + length <= self.length);
        MemChunk {
            block: self.block.clone(),
            index: self.index + offset,
            length,
        }
    }

    /// Advances the view by `n` bytes, shrinking it.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.length);
        self.index += n;
        self.length -= n;
    }

    /// Caps the view at `n` bytes.
    pub fn truncate(&mut self, n: usize) {
        if self.length > n {
            self.length = n;
        }
    }

    /// Ensures the chunk points at a block this holder may write to,
    /// copying the viewed range into a fresh block if the current one is
    /// shared.
    pub fn make_writable(&mut self, pool: &Mempool) {
        if self.block.is_exclusive() {
            return;
        }

        let copy = pool.allocate(self.length);
        copy.data_mut().copy_from_slice(&self.data());
        self.block = copy;
        self.index = 0;
    }
}

/// Re-blocks a stream of arbitrary chunks into chunks whose length is an
/// exact multiple of a base (the frame size). At most `base - 1` bytes are
/// buffered between pushes.
pub struct McAlign {
    base: usize,
    current: Option<MemChunk>,
    leftover: Vec<u8>,
}

impl McAlign {
    /// Creates an aligner for the given base. The base must be non-zero.
    pub fn new(base: usize) -> Self {
        assert!(base > 0);
        Self {
            base,
            current: None,
            leftover: Vec::with_capacity(base),
        }
    }

    /// The alignment base.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Feeds a chunk into the aligner. Only one chunk may be pending;
    /// callers must drain with [`McAlign::pop`] first.
    pub fn push(&mut self, chunk: &MemChunk) {
        assert!(self.current.is_none(), "mcalign push with chunk pending");
        if !chunk.is_empty() {
            self.current = Some(chunk.clone());
        }
    }

    /// Pops the next aligned chunk, or `None` if not enough bytes are
    /// buffered yet.
    pub fn pop(&mut self, pool: &Mempool) -> Option<MemChunk> {
        let mut chunk = self.current.take()?;

        if !self.leftover.is_empty() {
            // Top up the residue from the pending chunk first.
            let want = self.base - self.leftover.len();
            let take = want.min(chunk.length);
            self.leftover.extend_from_slice(&chunk.data()[..take]);
            chunk.consume(take);

            if !chunk.is_empty() {
                self.current = Some(chunk);
            }

            if self.leftover.len() == self.base {
                let out = pool.adopt(std::mem::take(&mut self.leftover));
                return Some(MemChunk::from_block(out));
            }

            return None;
        }

        let aligned = chunk.length - chunk.length % self.base;
        if aligned == 0 {
            self.leftover.extend_from_slice(&chunk.data());
            return None;
        }

        // Emit the aligned head zero-copy, keep the tail as residue.
        let out = chunk.slice(0, aligned);
        let tail = chunk.length - aligned;
        if tail > 0 {
            self.leftover
                .extend_from_slice(&chunk.data()[aligned..aligned + tail]);
        }

        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(pool: &Mempool, bytes: &[u8]) -> MemChunk {
        MemChunk::from_block(pool.adopt(bytes.to_vec()))
    }

    fn drain(m: &mut McAlign, pool: &Mempool, out: &mut Vec<u8>) {
        while let Some(c) = m.pop(pool) {
            assert_eq!(c.length % m.base(), 0, "unaligned chunk emitted");
            out.extend_from_slice(&c.data());
        }
    }

    #[test]
    fn emits_only_aligned_chunks() {
        let pool = Mempool::new();
        let mut m = McAlign::new(4);
        let mut out = Vec::new();

        for piece in [&[1u8, 2, 3][..], &[4, 5][..], &[6, 7, 8, 9, 10, 11][..]] {
            m.push(&chunk_of(&pool, piece));
            drain(&mut m, &pool, &mut out);
        }

        // Concatenation of outputs equals concatenation of inputs, up to
        // the residue held back at the end.
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn aligned_input_passes_through() {
        let pool = Mempool::new();
        let mut m = McAlign::new(4);

        let input = chunk_of(&pool, &[0; 16]);
        m.push(&input);
        let out = m.pop(&pool).unwrap();
        assert_eq!(out.length, 16);
        assert!(m.pop(&pool).is_none());
    }

    #[test]
    fn make_writable_copies_shared_blocks() {
        let pool = Mempool::new();
        let mut chunk = chunk_of(&pool, &[1, 2, 3, 4]);
        let other = chunk.clone();

        chunk.make_writable(&pool);
        chunk.block.data_mut()[0] = 9;

        assert_eq!(&*chunk.data(), &[9, 2, 3, 4]);
        assert_eq!(&*other.data(), &[1, 2, 3, 4]);
    }
}
