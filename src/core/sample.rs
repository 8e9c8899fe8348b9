//! Sample-level helpers shared by the mixing and queueing code.

use crate::protocol::SampleSpec;

use super::memblock::{MemBlock, Mempool};
use super::memchunk::MemChunk;

/// Fills a buffer with the silent byte pattern for the given format.
pub fn silence_memory(buf: &mut [u8], spec: &SampleSpec) {
    buf.fill(spec.format.silence_byte());
}

/// Silences the viewed range of a chunk. The chunk must be writable.
pub fn silence_memchunk(chunk: &MemChunk, spec: &SampleSpec) {
    let (index, length) = (chunk.index, chunk.length);
    silence_memory(&mut chunk.block.data_mut()[index..index + length], spec);
}

/// Silences an entire block. The block must be exclusively held.
pub fn silence_memblock(block: &MemBlock, spec: &SampleSpec) {
    silence_memory(&mut block.data_mut(), spec);
}

/// Allocates a chunk of silence covering `length` bytes.
pub fn silence_chunk(pool: &Mempool, spec: &SampleSpec, length: usize) -> MemChunk {
    let block = pool.allocate(length);
    silence_memblock(&block, spec);
    MemChunk::from_block(block)
}

#[cfg(test)]
mod tests {
    use crate::protocol::SampleFormat;

    use super::*;

    #[test]
    fn per_format_silence() {
        let mut spec = SampleSpec::default();
        let mut buf = [1u8; 4];

        silence_memory(&mut buf, &spec);
        assert_eq!(buf, [0; 4]);

        spec.format = SampleFormat::U8;
        silence_memory(&mut buf, &spec);
        assert_eq!(buf, [0x80; 4]);

        spec.format = SampleFormat::Ulaw;
        silence_memory(&mut buf, &spec);
        assert_eq!(buf, [0xFF; 4]);

        spec.format = SampleFormat::Alaw;
        silence_memory(&mut buf, &spec);
        assert_eq!(buf, [0x55; 4]);
    }
}
