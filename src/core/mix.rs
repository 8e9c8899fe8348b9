//! Mixing and software volume scaling.
//!
//! All inputs to a mix share the target sample spec; resampling happens
//! upstream, in the per-stream pull path.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::protocol::{ChannelVolume, SampleFormat, SampleSpec, Volume};

use super::memchunk::MemChunk;
use super::memblock::Mempool;

/// One contributing stream in a mix pass.
pub struct MixInput {
    /// The stream's pending audio, in the target sample spec.
    pub chunk: MemChunk,
    /// The stream's software volume.
    pub volume: ChannelVolume,
}

const VOLUME_NORM: i64 = 0x10000;

fn volume_factor(v: Volume) -> i64 {
    v.as_u32() as i64
}

#[inline]
fn scale_i32(sample: i32, factor: i64) -> i64 {
    if factor == VOLUME_NORM {
        sample as i64
    } else {
        (sample as i64 * factor) / VOLUME_NORM
    }
}

/// Decodes one integer-family sample to its native linear range: the 16-bit
/// range for 1- and 2-byte formats, the 32-bit range for S32.
fn decode_int(format: SampleFormat, data: &[u8]) -> i32 {
    match format {
        SampleFormat::U8 => ((data[0] as i32) - 0x80) << 8,
        SampleFormat::Alaw => alaw_decode(data[0]) as i32,
        SampleFormat::Ulaw => ulaw_decode(data[0]) as i32,
        SampleFormat::S16Le => LittleEndian::read_i16(data) as i32,
        SampleFormat::S16Be => BigEndian::read_i16(data) as i32,
        SampleFormat::S32Le => LittleEndian::read_i32(data),
        SampleFormat::S32Be => BigEndian::read_i32(data),
        SampleFormat::Float32Le | SampleFormat::Float32Be => {
            unreachable!("float formats use the float path")
        }
    }
}

fn encode_int(format: SampleFormat, value: i64, out: &mut [u8]) {
    match format {
        SampleFormat::U8 => {
            let v = value.clamp(i16::MIN as i64, i16::MAX as i64) as i32;
            out[0] = ((v >> 8) + 0x80) as u8;
        }
        SampleFormat::Alaw => {
            let v = value.clamp(i16::MIN as i64, i16::MAX as i64) as i16;
            out[0] = alaw_encode(v);
        }
        SampleFormat::Ulaw => {
            let v = value.clamp(i16::MIN as i64, i16::MAX as i64) as i16;
            out[0] = ulaw_encode(v);
        }
        SampleFormat::S16Le => {
            LittleEndian::write_i16(out, value.clamp(i16::MIN as i64, i16::MAX as i64) as i16)
        }
        SampleFormat::S16Be => {
            BigEndian::write_i16(out, value.clamp(i16::MIN as i64, i16::MAX as i64) as i16)
        }
        SampleFormat::S32Le => {
            LittleEndian::write_i32(out, value.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
        }
        SampleFormat::S32Be => {
            BigEndian::write_i32(out, value.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
        }
        SampleFormat::Float32Le | SampleFormat::Float32Be => {
            unreachable!("float formats use the float path")
        }
    }
}

fn decode_f32(format: SampleFormat, data: &[u8]) -> f32 {
    match format {
        SampleFormat::Float32Le => LittleEndian::read_f32(data),
        SampleFormat::Float32Be => BigEndian::read_f32(data),
        _ => unreachable!("integer formats use the integer path"),
    }
}

fn encode_f32(format: SampleFormat, value: f32, out: &mut [u8]) {
    let value = value.clamp(-1.0, 1.0);
    match format {
        SampleFormat::Float32Le => LittleEndian::write_f32(out, value),
        SampleFormat::Float32Be => BigEndian::write_f32(out, value),
        _ => unreachable!("integer formats use the integer path"),
    }
}

fn is_float(format: SampleFormat) -> bool {
    matches!(format, SampleFormat::Float32Le | SampleFormat::Float32Be)
}

fn channel_volume(cv: &ChannelVolume, channel: usize) -> Volume {
    let channels = cv.channels();
    if channels.is_empty() {
        Volume::MUTED
    } else {
        channels[channel % channels.len()]
    }
}

/// Mixes the inputs into `out`, applying per-stream volumes and the master
/// volume, saturating to the format's numeric range.
///
/// Returns the number of bytes written: the shortest input bounds the mix,
/// so partial availability is handled gracefully.
pub fn mix(
    inputs: &[MixInput],
    out: &mut [u8],
    spec: &SampleSpec,
    master: &ChannelVolume,
) -> usize {
    let sample_size = spec.format.bytes_per_sample();
    let channels = spec.channels as usize;
    let frame = spec.frame_size();

    let shortest = inputs
        .iter()
        .map(|i| i.chunk.length)
        .min()
        .unwrap_or(0);
    let length = out.len().min(shortest);
    let length = length - length % frame;

    let datas: Vec<_> = inputs.iter().map(|i| i.chunk.data()).collect();

    let mut offset = 0;
    let mut channel = 0;
    while offset < length {
        let master_factor = volume_factor(channel_volume(master, channel));

        if is_float(spec.format) {
            let mut sum = 0.0f32;
            for (input, data) in inputs.iter().zip(&datas) {
                let factor = volume_factor(channel_volume(&input.volume, channel));
                let v = decode_f32(spec.format, &data[offset..]);
                sum += v * (factor as f32 / VOLUME_NORM as f32);
            }

            sum *= master_factor as f32 / VOLUME_NORM as f32;
            encode_f32(spec.format, sum, &mut out[offset..]);
        } else {
            let mut sum = 0i64;
            for (input, data) in inputs.iter().zip(&datas) {
                let factor = volume_factor(channel_volume(&input.volume, channel));
                let v = decode_int(spec.format, &data[offset..]);
                sum += scale_i32(v, factor);
            }

            if master_factor != VOLUME_NORM {
                sum = sum * master_factor / VOLUME_NORM;
            }

            encode_int(spec.format, sum, &mut out[offset..]);
        }

        offset += sample_size;
        channel = (channel + 1) % channels;
    }

    length
}

/// Scales a chunk in place by a per-channel volume. The chunk must be
/// writable; callers use [`MemChunk::make_writable`] first.
pub fn volume_memchunk(chunk: &mut MemChunk, spec: &SampleSpec, volume: &ChannelVolume) {
    if volume.is_norm() || chunk.is_empty() {
        return;
    }

    let sample_size = spec.format.bytes_per_sample();
    let channels = spec.channels as usize;
    let (start, length) = (chunk.index, chunk.length);

    let mut data = chunk.block.data_mut();
    let data = &mut data[start..start + length];

    let mut offset = 0;
    let mut channel = 0;
    while offset + sample_size <= length {
        let factor = volume_factor(channel_volume(volume, channel));

        if is_float(spec.format) {
            let v = decode_f32(spec.format, &data[offset..]);
            encode_f32(
                spec.format,
                v * (factor as f32 / VOLUME_NORM as f32),
                &mut data[offset..],
            );
        } else {
            let v = decode_int(spec.format, &data[offset..]);
            encode_int(spec.format, scale_i32(v, factor), &mut data[offset..]);
        }

        offset += sample_size;
        channel = (channel + 1) % channels;
    }
}

/// Allocates a writable copy of a chunk scaled by the given volume.
pub fn scaled_copy(
    chunk: &MemChunk,
    spec: &SampleSpec,
    volume: &ChannelVolume,
    pool: &Mempool,
) -> MemChunk {
    let mut copy = chunk.clone();
    copy.make_writable(pool);
    volume_memchunk(&mut copy, spec, volume);
    copy
}

// G.711 companding, used for the A-law and mu-law sample formats.

pub(crate) fn alaw_decode(value: u8) -> i16 {
    let value = value ^ 0x55;
    let exponent = (value >> 4) & 0x07;
    let mantissa = (value & 0x0F) as i16;

    let mut sample = (mantissa << 4) + 8;
    if exponent > 0 {
        sample += 0x100;
    }
    if exponent > 1 {
        sample <<= exponent - 1;
    }

    if value & 0x80 != 0 {
        sample
    } else {
        -sample
    }
}

pub(crate) fn alaw_encode(pcm: i16) -> u8 {
    let (sign, mut magnitude) = if pcm >= 0 {
        (0x80u8, pcm as i32)
    } else {
        (0, -(pcm as i32))
    };

    if magnitude > 0x7FFF {
        magnitude = 0x7FFF;
    }

    let compressed = if magnitude >= 0x100 {
        // Segment = position of the highest set bit, relative to bit 8.
        let exponent = (24 - magnitude.leading_zeros() as i32).clamp(1, 7);
        let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
        ((exponent as u8) << 4) | mantissa as u8
    } else {
        (magnitude >> 4) as u8
    };

    (sign | compressed) ^ 0x55
}

pub(crate) fn ulaw_decode(value: u8) -> i16 {
    let value = !value;
    let exponent = (value >> 4) & 0x07;
    let mantissa = (value & 0x0F) as i16;

    let sample = (((mantissa << 3) + 0x84) << exponent) - 0x84;

    if value & 0x80 != 0 {
        -sample
    } else {
        sample
    }
}

pub(crate) fn ulaw_encode(pcm: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let (sign, mut magnitude) = if pcm >= 0 {
        (0u8, pcm as i32)
    } else {
        (0x80, -(pcm as i32))
    };

    if magnitude > CLIP {
        magnitude = CLIP;
    }
    magnitude += BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | ((exponent as u8) << 4) | mantissa)
}

#[cfg(test)]
mod tests {
    use crate::core::sample::silence_chunk;

    use super::*;

    fn s16_chunk(pool: &Mempool, samples: &[i16]) -> MemChunk {
        let mut bytes = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut bytes);
        MemChunk::from_block(pool.adopt(bytes))
    }

    fn read_s16(data: &[u8]) -> Vec<i16> {
        let mut out = vec![0i16; data.len() / 2];
        LittleEndian::read_i16_into(data, &mut out);
        out
    }

    fn mono_spec() -> SampleSpec {
        SampleSpec {
            format: SampleFormat::S16Le,
            channels: 1,
            rate: 44100,
        }
    }

    #[test]
    fn sums_and_saturates() {
        let pool = Mempool::new();
        let spec = mono_spec();

        let inputs = [
            MixInput {
                chunk: s16_chunk(&pool, &[1000, 30000, -30000]),
                volume: ChannelVolume::norm(1),
            },
            MixInput {
                chunk: s16_chunk(&pool, &[2000, 10000, -10000]),
                volume: ChannelVolume::norm(1),
            },
        ];

        let mut out = vec![0u8; 6];
        let written = mix(&inputs, &mut out, &spec, &ChannelVolume::norm(1));
        assert_eq!(written, 6);
        assert_eq!(read_s16(&out), vec![3000, 32767, -32768]);
    }

    #[test]
    fn shortest_input_bounds_the_mix() {
        let pool = Mempool::new();
        let spec = mono_spec();

        let inputs = [
            MixInput {
                chunk: s16_chunk(&pool, &[1; 8]),
                volume: ChannelVolume::norm(1),
            },
            MixInput {
                chunk: s16_chunk(&pool, &[1; 3]),
                volume: ChannelVolume::norm(1),
            },
        ];

        let mut out = vec![0u8; 16];
        assert_eq!(mix(&inputs, &mut out, &spec, &ChannelVolume::norm(1)), 6);
    }

    #[test]
    fn per_stream_volume_scales() {
        let pool = Mempool::new();
        let spec = mono_spec();

        let mut half = ChannelVolume::empty();
        half.push(Volume::from_u32_clamped(0x8000));

        let inputs = [MixInput {
            chunk: s16_chunk(&pool, &[10000]),
            volume: half,
        }];

        let mut out = vec![0u8; 2];
        mix(&inputs, &mut out, &spec, &ChannelVolume::norm(1));
        assert_eq!(read_s16(&out), vec![5000]);
    }

    #[test]
    fn master_volume_applies_after_summing() {
        let pool = Mempool::new();
        let spec = mono_spec();

        let inputs = [
            MixInput {
                chunk: s16_chunk(&pool, &[8000]),
                volume: ChannelVolume::norm(1),
            },
            MixInput {
                chunk: s16_chunk(&pool, &[8000]),
                volume: ChannelVolume::norm(1),
            },
        ];

        let mut half = ChannelVolume::empty();
        half.push(Volume::from_u32_clamped(0x8000));

        let mut out = vec![0u8; 2];
        mix(&inputs, &mut out, &spec, &half);
        assert_eq!(read_s16(&out), vec![8000]);
    }

    #[test]
    fn silence_mixes_to_silence() {
        let pool = Mempool::new();
        let spec = mono_spec();

        let inputs = [
            MixInput {
                chunk: silence_chunk(&pool, &spec, 8),
                volume: ChannelVolume::norm(1),
            },
            MixInput {
                chunk: silence_chunk(&pool, &spec, 8),
                volume: ChannelVolume::norm(1),
            },
        ];

        let mut out = vec![0xAAu8; 8];
        mix(&inputs, &mut out, &spec, &ChannelVolume::norm(1));
        assert_eq!(out, vec![0; 8]);
    }

    #[test]
    fn volume_memchunk_in_place() {
        let pool = Mempool::new();
        let spec = mono_spec();

        let mut chunk = s16_chunk(&pool, &[10000, -10000]);
        let mut half = ChannelVolume::empty();
        half.push(Volume::from_u32_clamped(0x8000));

        volume_memchunk(&mut chunk, &spec, &half);
        assert_eq!(read_s16(&chunk.data()), vec![5000, -5000]);
    }

    #[test]
    fn g711_codecs_roundtrip_their_code_points() {
        for code in 0u8..=255 {
            assert_eq!(alaw_encode(alaw_decode(code)), code, "alaw {:#x}", code);

            // 0x7F is mu-law negative zero; it decodes to the same sample as
            // 0xFF and cannot round-trip.
            if code != 0x7F {
                assert_eq!(ulaw_encode(ulaw_decode(code)), code, "ulaw {:#x}", code);
            }
        }
    }

    #[test]
    fn g711_silence_bytes_decode_near_zero() {
        assert!(alaw_decode(0x55).unsigned_abs() <= 8);
        assert_eq!(ulaw_decode(0xFF), 0);
    }
}
