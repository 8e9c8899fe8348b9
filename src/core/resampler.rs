//! Sample format, channel count and rate conversion between a stream and
//! its device.
//!
//! Conversion runs through f32 intermediates. Rate conversion duplicates or
//! drops frames with a fractional position counter; no interpolation is
//! performed.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::protocol::{SampleFormat, SampleSpec};

use super::memblock::Mempool;
use super::memchunk::MemChunk;

/// The conversion strategy. Negotiated at stream setup and reported by the
/// introspection commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleMethod {
    /// Frame duplication / decimation.
    #[default]
    Trivial,
}

impl ResampleMethod {
    /// The wire name of the method.
    pub fn name(&self) -> &'static str {
        match self {
            ResampleMethod::Trivial => "trivial",
        }
    }
}

/// Converts chunks from one sample spec to another.
pub struct Resampler {
    from: SampleSpec,
    to: SampleSpec,
    method: ResampleMethod,
    // Fractional input-frame remainder carried between runs, in units of
    // 1/to.rate input frames.
    phase: u64,
}

impl Resampler {
    /// Creates a resampler between the given specs.
    pub fn new(from: &SampleSpec, to: &SampleSpec, method: ResampleMethod) -> Self {
        Self {
            from: *from,
            to: *to,
            method,
            phase: 0,
        }
    }

    /// The negotiated method.
    pub fn method(&self) -> ResampleMethod {
        self.method
    }

    /// The input spec.
    pub fn input_spec(&self) -> &SampleSpec {
        &self.from
    }

    /// The output spec.
    pub fn output_spec(&self) -> &SampleSpec {
        &self.to
    }

    /// Changes the input rate, for variable-rate streams.
    pub fn set_input_rate(&mut self, rate: u32) {
        self.from.rate = rate;
        self.phase = 0;
    }

    /// Discards carried conversion state, e.g. after a flush or a move.
    pub fn reset(&mut self) {
        self.phase = 0;
    }

    /// An upper bound on the input bytes needed to produce `out_bytes` of
    /// output.
    pub fn request(&self, out_bytes: usize) -> usize {
        let out_frames = out_bytes / self.to.frame_size();
        let in_frames =
            (out_frames as u64 * self.from.rate as u64).div_ceil(self.to.rate as u64) as usize;
        (in_frames.max(1)) * self.from.frame_size()
    }

    /// Converts a chunk into the output spec.
    pub fn run(&mut self, chunk: &MemChunk, pool: &Mempool) -> MemChunk {
        let in_frame = self.from.frame_size();
        let n_in = chunk.length / in_frame;
        if n_in == 0 {
            return MemChunk::from_block(pool.allocate(0));
        }

        // Decode into an f32 frame matrix in the output channel layout.
        let in_channels = self.from.channels as usize;
        let out_channels = self.to.channels as usize;
        let sample_size = self.from.format.bytes_per_sample();

        let data = chunk.data();
        let mut frames = vec![0f32; n_in * out_channels];
        for i in 0..n_in {
            let frame_off = i * in_frame;
            for (c, slot) in frames[i * out_channels..(i + 1) * out_channels]
                .iter_mut()
                .enumerate()
            {
                *slot = if out_channels > in_channels && in_channels == 1 {
                    // Upmix mono to every output channel.
                    decode(self.from.format, &data[frame_off..])
                } else if out_channels == 1 && in_channels > 1 {
                    // Downmix to mono by averaging.
                    let mut sum = 0.0;
                    for ic in 0..in_channels {
                        sum += decode(self.from.format, &data[frame_off + ic * sample_size..]);
                    }
                    sum / in_channels as f32
                } else {
                    let ic = c.min(in_channels - 1);
                    decode(self.from.format, &data[frame_off + ic * sample_size..])
                };
            }
        }

        // Rate conversion by index mapping, with the fractional remainder
        // carried so long streams do not drift.
        let total = self.phase + n_in as u64 * self.to.rate as u64;
        let n_out = (total / self.from.rate as u64) as usize;
        self.phase = total % self.from.rate as u64;

        let out_frame = self.to.frame_size();
        let block = pool.allocate(n_out * out_frame);
        {
            let mut out = block.data_mut();
            for j in 0..n_out {
                let src = ((j as u64 * self.from.rate as u64) / self.to.rate as u64) as usize;
                let src = src.min(n_in - 1);
                for c in 0..out_channels {
                    let v = frames[src * out_channels + c];
                    encode(
                        self.to.format,
                        v,
                        &mut out[j * out_frame + c * self.to.format.bytes_per_sample()..],
                    );
                }
            }
        }

        MemChunk::from_block(block)
    }
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resampler")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("method", &self.method.name())
            .finish()
    }
}

fn decode(format: SampleFormat, data: &[u8]) -> f32 {
    match format {
        SampleFormat::U8 => (data[0] as f32 - 128.0) / 128.0,
        SampleFormat::Alaw => alaw_to_f32(data[0]),
        SampleFormat::Ulaw => ulaw_to_f32(data[0]),
        SampleFormat::S16Le => LittleEndian::read_i16(data) as f32 / 32768.0,
        SampleFormat::S16Be => BigEndian::read_i16(data) as f32 / 32768.0,
        SampleFormat::Float32Le => LittleEndian::read_f32(data),
        SampleFormat::Float32Be => BigEndian::read_f32(data),
        SampleFormat::S32Le => LittleEndian::read_i32(data) as f32 / 2147483648.0,
        SampleFormat::S32Be => BigEndian::read_i32(data) as f32 / 2147483648.0,
    }
}

fn encode(format: SampleFormat, value: f32, out: &mut [u8]) {
    let value = value.clamp(-1.0, 1.0);
    match format {
        SampleFormat::U8 => out[0] = ((value * 127.0) as i32 + 128).clamp(0, 255) as u8,
        SampleFormat::Alaw => out[0] = f32_to_alaw(value),
        SampleFormat::Ulaw => out[0] = f32_to_ulaw(value),
        SampleFormat::S16Le => LittleEndian::write_i16(out, (value * 32767.0) as i16),
        SampleFormat::S16Be => BigEndian::write_i16(out, (value * 32767.0) as i16),
        SampleFormat::Float32Le => LittleEndian::write_f32(out, value),
        SampleFormat::Float32Be => BigEndian::write_f32(out, value),
        SampleFormat::S32Le => LittleEndian::write_i32(out, (value as f64 * 2147483647.0) as i32),
        SampleFormat::S32Be => BigEndian::write_i32(out, (value as f64 * 2147483647.0) as i32),
    }
}

fn alaw_to_f32(v: u8) -> f32 {
    super::mix::alaw_decode(v) as f32 / 32768.0
}

fn ulaw_to_f32(v: u8) -> f32 {
    super::mix::ulaw_decode(v) as f32 / 32768.0
}

fn f32_to_alaw(v: f32) -> u8 {
    super::mix::alaw_encode((v * 32767.0) as i16)
}

fn f32_to_ulaw(v: f32) -> u8 {
    super::mix::ulaw_encode((v * 32767.0) as i16)
}

#[cfg(test)]
mod tests {
    use crate::core::sample::silence_chunk;
    use crate::protocol::SampleFormat;

    use super::*;

    fn spec(format: SampleFormat, channels: u8, rate: u32) -> SampleSpec {
        SampleSpec {
            format,
            channels,
            rate,
        }
    }

    fn s16_chunk(pool: &Mempool, samples: &[i16]) -> MemChunk {
        let mut bytes = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut bytes);
        MemChunk::from_block(pool.adopt(bytes))
    }

    #[test]
    fn rate_conversion_frame_counts() {
        let pool = Mempool::new();
        let from = spec(SampleFormat::S16Le, 1, 44100);
        let to = spec(SampleFormat::S16Le, 1, 22050);
        let mut r = Resampler::new(&from, &to, ResampleMethod::Trivial);

        let out = r.run(&s16_chunk(&pool, &[0; 100]), &pool);
        assert_eq!(out.length / to.frame_size(), 50);
    }

    #[test]
    fn fractional_rates_do_not_drift() {
        let pool = Mempool::new();
        let from = spec(SampleFormat::S16Le, 1, 44100);
        let to = spec(SampleFormat::S16Le, 1, 48000);
        let mut r = Resampler::new(&from, &to, ResampleMethod::Trivial);

        let mut out_frames = 0;
        for _ in 0..441 {
            let out = r.run(&s16_chunk(&pool, &[0; 100]), &pool);
            out_frames += out.length / to.frame_size();
        }

        // 1 second of input produces exactly 1 second of output.
        assert_eq!(out_frames, 48000);
    }

    #[test]
    fn channel_up_and_down_mix() {
        let pool = Mempool::new();
        let mono = spec(SampleFormat::S16Le, 1, 44100);
        let stereo = spec(SampleFormat::S16Le, 2, 44100);

        let mut up = Resampler::new(&mono, &stereo, ResampleMethod::Trivial);
        let out = up.run(&s16_chunk(&pool, &[1000]), &pool);
        let mut samples = [0i16; 2];
        LittleEndian::read_i16_into(&out.data(), &mut samples);
        assert_eq!(samples, [1000, 1000]);

        let mut down = Resampler::new(&stereo, &mono, ResampleMethod::Trivial);
        let out = down.run(&s16_chunk(&pool, &[1000, 3000]), &pool);
        let mut samples = [0i16; 1];
        LittleEndian::read_i16_into(&out.data(), &mut samples);
        assert_eq!(samples, [2000]);
    }

    #[test]
    fn request_bounds_upstream_pulls() {
        let from = spec(SampleFormat::S16Le, 2, 44100);
        let to = spec(SampleFormat::S16Le, 2, 48000);
        let r = Resampler::new(&from, &to, ResampleMethod::Trivial);

        // Producing a second of output needs no more than a second (and a
        // frame of rounding) of input.
        let bound = r.request(to.bytes_per_second());
        assert!(bound <= from.bytes_per_second() + from.frame_size());
        assert!(bound > 0);

        // Even a tiny request asks for at least one input frame.
        assert!(r.request(0) >= from.frame_size());
    }

    #[test]
    fn silence_converts_to_silence() {
        let pool = Mempool::new();
        let from = spec(SampleFormat::S16Le, 2, 44100);
        let to = spec(SampleFormat::S16Le, 1, 22050);
        let mut r = Resampler::new(&from, &to, ResampleMethod::Trivial);

        let out = r.run(&silence_chunk(&pool, &from, from.frame_size() * 64), &pool);
        assert!(out.data().iter().all(|&b| b == 0));
    }
}
