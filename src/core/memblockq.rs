//! The bounded per-stream audio queue with prebuffering and seekable write
//! index.

use std::collections::VecDeque;

use thiserror::Error;

use crate::protocol::SeekMode;

use super::memblock::Mempool;
use super::memchunk::{McAlign, MemChunk};

/// Errors surfaced by queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The operation's byte count is not a multiple of the frame size.
    #[error("length is not a multiple of the queue base")]
    Misaligned,
}

/// Why a peek produced no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadable {
    /// The prebuffer has not filled yet (or was re-armed after an
    /// underrun).
    Prebuffering,
    /// No data is buffered ahead of the read index.
    Empty,
}

struct Item {
    index: i64,
    chunk: MemChunk,
}

impl Item {
    fn end(&self) -> i64 {
        self.index + self.chunk.length as i64
    }
}

/// A FIFO of chunks with independent, monotonically advancing read and write
/// byte indices.
///
/// The write index may be seeked: ahead of the read index (leaving a gap
/// that reads as silence), or backwards over already-buffered data
/// (rewriting history). All lengths are multiples of `base`, the frame size.
pub struct MemBlockQ {
    items: VecDeque<Item>,
    read_index: i64,
    write_index: i64,
    maxlength: usize,
    tlength: usize,
    base: usize,
    prebuf: usize,
    minreq: usize,
    maxrewind: usize,
    in_prebuf: bool,
    silence: Option<MemChunk>,
    mcalign: Option<McAlign>,
}

fn round_up(value: usize, base: usize) -> usize {
    value.div_ceil(base) * base
}

fn round_down(value: usize, base: usize) -> usize {
    value - value % base
}

impl MemBlockQ {
    /// Creates a queue. `silence`, when provided, backs reads across gaps
    /// left by forward seeks and overflows.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        start_index: i64,
        maxlength: usize,
        tlength: usize,
        base: usize,
        prebuf: usize,
        minreq: usize,
        maxrewind: usize,
        silence: Option<MemChunk>,
    ) -> Self {
        assert!(base > 0);

        let maxlength = round_up(maxlength.max(base), base);
        let tlength = if tlength == 0 {
            maxlength
        } else {
            round_up(tlength, base).min(maxlength)
        };
        let minreq = round_up(minreq.max(base), base).min(tlength);
        let prebuf = round_up(prebuf, base).min(tlength);
        let maxrewind = round_down(maxrewind, base);

        Self {
            items: VecDeque::new(),
            read_index: start_index,
            write_index: start_index,
            maxlength,
            tlength,
            base,
            prebuf,
            minreq,
            maxrewind,
            in_prebuf: prebuf > 0,
            silence,
            mcalign: None,
        }
    }

    /// Buffered bytes between the read and write indices.
    pub fn len(&self) -> usize {
        (self.write_index - self.read_index).max(0) as usize
    }

    /// Whether nothing is buffered ahead of the read index.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a peek would currently yield data.
    pub fn is_readable(&self) -> bool {
        if self.in_prebuf && self.len() < self.prebuf {
            return false;
        }

        !self.is_empty()
    }

    /// Whether the queue is currently withholding reads to prebuffer.
    pub fn in_prebuf(&self) -> bool {
        self.in_prebuf
    }

    /// The current read position, in bytes since stream start.
    pub fn read_index(&self) -> i64 {
        self.read_index
    }

    /// The current write position, in bytes since stream start.
    pub fn write_index(&self) -> i64 {
        self.write_index
    }

    /// The queue's hard capacity.
    pub fn maxlength(&self) -> usize {
        self.maxlength
    }

    /// The target fill level.
    pub fn tlength(&self) -> usize {
        self.tlength
    }

    /// The configured prebuffer threshold.
    pub fn prebuf(&self) -> usize {
        self.prebuf
    }

    /// The minimum request size.
    pub fn minreq(&self) -> usize {
        self.minreq
    }

    /// The frame size all operations are aligned to.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Replaces the hard capacity, dropping oldest data if the queue now
    /// exceeds it.
    pub fn set_maxlength(&mut self, maxlength: usize) {
        self.maxlength = round_up(maxlength.max(self.base), self.base);
        self.tlength = self.tlength.min(self.maxlength);
        self.prebuf = self.prebuf.min(self.tlength);
        self.minreq = self.minreq.min(self.tlength);

        let over = self.len().saturating_sub(self.maxlength);
        if over > 0 {
            self.advance_read(round_up(over, self.base));
        }
    }

    /// Replaces the target fill level.
    pub fn set_tlength(&mut self, tlength: usize) {
        let tlength = if tlength == 0 { self.maxlength } else { tlength };
        self.tlength = round_up(tlength, self.base).min(self.maxlength);
        self.prebuf = self.prebuf.min(self.tlength);
        self.minreq = self.minreq.min(self.tlength);
    }

    /// Replaces the prebuffer threshold.
    pub fn set_prebuf(&mut self, prebuf: usize) {
        self.prebuf = round_up(prebuf, self.base).min(self.tlength);
        if self.prebuf == 0 {
            self.in_prebuf = false;
        }
    }

    /// Replaces the minimum request size.
    pub fn set_minreq(&mut self, minreq: usize) {
        self.minreq = round_up(minreq.max(self.base), self.base).min(self.tlength);
    }

    /// Appends a chunk at the write index and advances it.
    ///
    /// Pushing past `maxlength` drops the oldest buffered audio; the number
    /// of dropped bytes is returned so the caller can signal an overflow.
    pub fn push(&mut self, chunk: &MemChunk) -> Result<usize, QueueError> {
        if chunk.length % self.base != 0 {
            return Err(QueueError::Misaligned);
        }

        if chunk.is_empty() {
            return Ok(0);
        }

        let start = self.write_index;
        let end = start + chunk.length as i64;

        self.cut_range(start, end);

        let pos = self
            .items
            .iter()
            .position(|item| item.index >= end)
            .unwrap_or(self.items.len());
        self.items.insert(
            pos,
            Item {
                index: start,
                chunk: chunk.clone(),
            },
        );

        self.write_index = end;

        let over = self.len().saturating_sub(self.maxlength);
        let dropped = if over > 0 {
            let dropped = round_up(over, self.base);
            self.advance_read(dropped);
            dropped
        } else {
            0
        };

        self.prune_history();
        Ok(dropped)
    }

    /// Like [`push`](Self::push), but accepts chunks of any length and
    /// buffers a trailing residue until it completes a frame.
    pub fn push_align(&mut self, chunk: &MemChunk, pool: &Mempool) -> Result<usize, QueueError> {
        if self.base == 1 {
            return self.push(chunk);
        }

        if chunk.is_empty() {
            return Ok(0);
        }

        let mcalign = self
            .mcalign
            .get_or_insert_with(|| McAlign::new(self.base));
        mcalign.push(chunk);

        let mut dropped = 0;
        while let Some(aligned) = self.mcalign.as_mut().unwrap().pop(pool) {
            dropped += self.push(&aligned)?;
        }

        Ok(dropped)
    }

    /// Moves the write index.
    pub fn seek(&mut self, offset: i64, mode: SeekMode) {
        self.write_index = match mode {
            SeekMode::Relative | SeekMode::RelativeOnWrite => self.write_index + offset,
            SeekMode::Absolute => offset,
            SeekMode::RelativeOnRead => self.read_index + offset,
        };
    }

    /// Returns the chunk at the read index without consuming it.
    ///
    /// If the write index is ahead of the read index with no data in
    /// between, a slice of the silence chunk is returned instead (when one
    /// is configured).
    pub fn peek(&mut self) -> Result<MemChunk, NotReadable> {
        if self.update_prebuf() {
            return Err(NotReadable::Prebuffering);
        }

        if self.read_index >= self.write_index {
            return Err(NotReadable::Empty);
        }

        // Find the first buffered item at or after the read position.
        let mut next_start = None;
        for item in &self.items {
            if item.end() <= self.read_index {
                continue;
            }

            if item.index <= self.read_index {
                let offset = (self.read_index - item.index) as usize;
                return Ok(item.chunk.slice(offset, item.chunk.length - offset));
            }

            next_start = Some(item.index.min(self.write_index));
            break;
        }

        // The read index sits in a gap; fill it from the silence chunk.
        let gap = (next_start.unwrap_or(self.write_index) - self.read_index) as usize;
        match &self.silence {
            Some(silence) => Ok(silence.slice(0, gap.min(silence.length))),
            None => Err(NotReadable::Empty),
        }
    }

    /// Consumes `n` bytes at the read index.
    pub fn drop_bytes(&mut self, n: usize) -> Result<(), QueueError> {
        if n % self.base != 0 {
            return Err(QueueError::Misaligned);
        }

        self.advance_read(n);
        self.prune_history();
        Ok(())
    }

    /// Moves the read index back by up to `n` bytes, bounded by the
    /// configured rewind window. Returns how far it actually moved.
    pub fn rewind(&mut self, n: usize) -> usize {
        let n = round_down(n, self.base).min(self.maxrewind);
        self.read_index -= n as i64;
        n
    }

    /// Discards all buffered audio, keeping the read position. The
    /// prebuffer re-arms.
    pub fn flush_write(&mut self) {
        self.items.clear();
        self.write_index = self.read_index;
        self.in_prebuf = self.prebuf > 0;
    }

    /// Skips the read index to the write index, discarding buffered audio.
    /// The prebuffer re-arms.
    pub fn flush_read(&mut self) {
        self.items.clear();
        self.read_index = self.write_index;
        self.in_prebuf = self.prebuf > 0;
    }

    /// Re-arms the prebuffer so reads block until it fills again.
    pub fn prebuf_force(&mut self) {
        if self.prebuf > 0 {
            self.in_prebuf = true;
        }
    }

    /// Disengages the prebuffer so buffered audio plays out immediately.
    pub fn prebuf_disable(&mut self) {
        self.in_prebuf = false;
    }

    /// Bytes needed to reach the target length, batched: zero until the
    /// deficit is at least `minreq`.
    pub fn missing(&self) -> usize {
        let length = self.len();
        if length >= self.tlength {
            return 0;
        }

        let missing = self.tlength - length;
        if missing >= self.minreq {
            missing
        } else {
            0
        }
    }

    fn update_prebuf(&mut self) -> bool {
        if self.in_prebuf {
            if self.len() < self.prebuf {
                return true;
            }

            self.in_prebuf = false;
            false
        } else {
            // Once drained completely, the queue prebuffers again before the
            // next playback starts.
            if self.prebuf > 0 && self.read_index >= self.write_index {
                self.in_prebuf = true;
                return true;
            }

            false
        }
    }

    fn advance_read(&mut self, n: usize) {
        self.read_index += n as i64;
    }

    /// Drops items that have fallen out of the rewind window.
    fn prune_history(&mut self) {
        let horizon = self.read_index - self.maxrewind as i64;
        while let Some(item) = self.items.front() {
            if item.end() <= horizon {
                self.items.pop_front();
            } else {
                break;
            }
        }
    }

    /// Removes the byte range `[start, end)` from the buffered items,
    /// splitting items that span a boundary.
    fn cut_range(&mut self, start: i64, end: i64) {
        let mut i = 0;
        while i < self.items.len() {
            let (item_start, item_end) = {
                let item = &self.items[i];
                (item.index, item.end())
            };

            if item_end <= start || item_start >= end {
                i += 1;
                continue;
            }

            if item_start >= start && item_end <= end {
                self.items.remove(i);
                continue;
            }

            if item_start < start && item_end > end {
                // The new range punches a hole in the middle of this item.
                let left_len = (start - item_start) as usize;
                let right_off = (end - item_start) as usize;
                let right = Item {
                    index: end,
                    chunk: self.items[i]
                        .chunk
                        .slice(right_off, (item_end - end) as usize),
                };
                self.items[i].chunk.truncate(left_len);
                self.items.insert(i + 1, right);
                return;
            }

            if item_start < start {
                // Overlap at the item's tail.
                self.items[i].chunk.truncate((start - item_start) as usize);
                i += 1;
            } else {
                // Overlap at the item's head.
                let cut = (end - item_start) as usize;
                self.items[i].index = end;
                self.items[i].chunk.consume(cut);
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::core::sample::silence_chunk;
    use crate::protocol::SampleSpec;

    use super::*;

    fn pool_chunk(pool: &Mempool, bytes: &[u8]) -> MemChunk {
        MemChunk::from_block(pool.adopt(bytes.to_vec()))
    }

    fn queue(maxlength: usize, tlength: usize, prebuf: usize, minreq: usize) -> MemBlockQ {
        MemBlockQ::new(0, maxlength, tlength, 2, prebuf, minreq, 0, None)
    }

    #[test]
    fn length_tracks_indices() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = queue(64, 32, 0, 2);

        q.push(&pool_chunk(&pool, &[0; 8]))?;
        q.push(&pool_chunk(&pool, &[0; 4]))?;
        assert_eq!(q.len(), 12);
        assert_eq!(q.write_index() - q.read_index(), 12);

        q.drop_bytes(6)?;
        assert_eq!(q.len(), 6);
        assert_eq!(q.write_index() - q.read_index(), 6);

        Ok(())
    }

    #[test]
    fn rejects_misaligned_pushes() {
        let pool = Mempool::new();
        let mut q = queue(64, 32, 0, 2);

        assert_eq!(
            q.push(&pool_chunk(&pool, &[0; 3])),
            Err(QueueError::Misaligned)
        );
    }

    #[test]
    fn zero_length_push_is_a_noop() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = queue(64, 32, 0, 2);

        q.push(&pool_chunk(&pool, &[]))?;
        assert_eq!(q.len(), 0);
        assert_eq!(q.write_index(), 0);

        Ok(())
    }

    #[test]
    fn prebuffer_blocks_reads_until_filled() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = queue(64, 32, 8, 2);

        q.push(&pool_chunk(&pool, &[1; 4]))?;
        assert_matches!(q.peek(), Err(NotReadable::Prebuffering));

        q.push(&pool_chunk(&pool, &[2; 4]))?;
        let chunk = q.peek().expect("prebuffer satisfied");
        assert_eq!(chunk.length, 4);

        // Once disengaged, reads keep working below the threshold.
        q.drop_bytes(4)?;
        assert!(q.peek().is_ok());

        Ok(())
    }

    #[test]
    fn prebuffer_rearms_after_running_empty() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = queue(64, 32, 8, 2);

        q.push(&pool_chunk(&pool, &[1; 8]))?;
        assert!(q.peek().is_ok());
        q.drop_bytes(8)?;

        assert_matches!(q.peek(), Err(NotReadable::Prebuffering));

        // A small refill is not enough.
        q.push(&pool_chunk(&pool, &[2; 4]))?;
        assert_matches!(q.peek(), Err(NotReadable::Prebuffering));

        q.push(&pool_chunk(&pool, &[2; 4]))?;
        assert!(q.peek().is_ok());

        Ok(())
    }

    #[test]
    fn zero_prebuf_never_blocks_while_nonempty() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = queue(64, 32, 0, 2);

        q.push(&pool_chunk(&pool, &[1; 2]))?;
        assert!(q.peek().is_ok());
        q.drop_bytes(2)?;
        assert_matches!(q.peek(), Err(NotReadable::Empty));

        q.push(&pool_chunk(&pool, &[1; 2]))?;
        assert!(q.peek().is_ok());

        Ok(())
    }

    #[test]
    fn overflow_drops_oldest() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = queue(8, 8, 0, 2);

        q.push(&pool_chunk(&pool, &[1; 8]))?;
        let dropped = q.push(&pool_chunk(&pool, &[2; 4]))?;
        assert_eq!(dropped, 4);
        assert_eq!(q.len(), 8);

        // The oldest bytes are gone; the head now reads from the first
        // chunk's tail.
        let head = q.peek().unwrap();
        assert_eq!(&*head.data(), &[1; 4]);

        Ok(())
    }

    #[test]
    fn large_push_keeps_write_position_coherent() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = queue(1024, 512, 256, 128);

        let dropped = q.push(&pool_chunk(&pool, &[3; 2048]))?;
        assert_eq!(dropped, 1024);
        assert_eq!(q.len(), 1024);
        assert_eq!(q.write_index(), 2048);
        assert_eq!(q.read_index(), 1024);

        Ok(())
    }

    #[test]
    fn forward_seek_reads_silence() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let spec = SampleSpec::default();
        let silence = silence_chunk(&pool, &spec, 16);
        let mut q = MemBlockQ::new(0, 64, 32, 2, 0, 2, 0, Some(silence));

        q.seek(8, SeekMode::Relative);
        q.push(&pool_chunk(&pool, &[7; 4]))?;

        let head = q.peek().unwrap();
        assert_eq!(head.length, 8);
        assert_eq!(&*head.data(), &[0; 8]);

        q.drop_bytes(8)?;
        let head = q.peek().unwrap();
        assert_eq!(&*head.data(), &[7; 4]);

        Ok(())
    }

    #[test]
    fn rewrite_history_with_seek() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = queue(64, 32, 0, 2);

        q.push(&pool_chunk(&pool, &[1; 8]))?;
        q.seek(-6, SeekMode::RelativeOnWrite);
        q.push(&pool_chunk(&pool, &[9; 4]))?;

        // 2 bytes of the original tail survive behind the rewritten range.
        q.seek(2, SeekMode::Relative);
        assert_eq!(q.len(), 8);

        let head = q.peek().unwrap();
        assert_eq!(&*head.data(), &[1; 2]);
        q.drop_bytes(2)?;

        let head = q.peek().unwrap();
        assert_eq!(&*head.data(), &[9; 4]);
        q.drop_bytes(4)?;

        let head = q.peek().unwrap();
        assert_eq!(&*head.data(), &[1; 2]);

        Ok(())
    }

    #[test]
    fn rewind_is_bounded() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = MemBlockQ::new(0, 64, 32, 2, 0, 2, 4, None);

        q.push(&pool_chunk(&pool, &[1, 2, 3, 4, 5, 6, 7, 8]))?;
        q.drop_bytes(8)?;

        assert_eq!(q.rewind(100), 4);
        let head = q.peek().unwrap();
        assert_eq!(&*head.data(), &[5, 6, 7, 8]);

        Ok(())
    }

    #[test]
    fn missing_batches_by_minreq() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = queue(64, 16, 0, 8);

        assert_eq!(q.missing(), 16);

        q.push(&pool_chunk(&pool, &[0; 10]))?;
        // Deficit of 6 is below minreq.
        assert_eq!(q.missing(), 0);

        q.drop_bytes(2)?;
        assert_eq!(q.missing(), 8);

        Ok(())
    }

    #[test]
    fn push_align_reframes_input() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = MemBlockQ::new(0, 64, 32, 4, 0, 4, 0, None);

        q.push_align(&pool_chunk(&pool, &[1, 2, 3]), &pool)?;
        assert_eq!(q.len(), 0);

        q.push_align(&pool_chunk(&pool, &[4, 5, 6, 7, 8]), &pool)?;
        assert_eq!(q.len(), 8);

        let head = q.peek().unwrap();
        assert_eq!(&*head.data(), &[1, 2, 3, 4]);

        Ok(())
    }

    #[test]
    fn flush_rearms_prebuffer() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = queue(64, 32, 8, 2);

        q.push(&pool_chunk(&pool, &[1; 12]))?;
        assert!(q.peek().is_ok());

        q.flush_write();
        assert_eq!(q.len(), 0);
        assert!(q.in_prebuf());

        Ok(())
    }

    #[test]
    fn trigger_plays_out_partial_prebuffer() -> anyhow::Result<()> {
        let pool = Mempool::new();
        let mut q = queue(64, 32, 16, 2);

        q.push(&pool_chunk(&pool, &[1; 4]))?;
        assert_matches!(q.peek(), Err(NotReadable::Prebuffering));

        q.prebuf_disable();
        assert!(q.peek().is_ok());

        Ok(())
    }
}
