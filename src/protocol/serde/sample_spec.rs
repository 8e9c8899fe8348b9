//! Sample specification data type.

use enum_primitive_derive::Primitive;

use super::*;
use crate::protocol::ProtocolError;

/// Maximum number of channels.
pub const CHANNELS_MAX: u8 = 32;

/// Maximum accepted sample rate, in Hz.
pub const RATE_MAX: u32 = 192_000;

/// Describes how individual samples are encoded.
#[derive(Debug, Copy, Clone, Primitive, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Unsigned 8 bit PCM
    U8 = 0,
    /// 8 bit a-Law
    Alaw = 1,
    /// 8 bit mu-Law
    Ulaw = 2,
    /// Signed 16 bit PCM, little endian
    #[default]
    S16Le = 3,
    /// Signed 16 bit PCM, big endian
    S16Be = 4,
    /// 32 bit IEEE floating point, little endian, range -1.0 to 1.0
    Float32Le = 5,
    /// 32 bit IEEE floating point, big endian, range -1.0 to 1.0
    Float32Be = 6,
    /// Signed 32 bit PCM, little endian
    S32Le = 7,
    /// Signed 32 bit PCM, big endian
    S32Be = 8,
}

impl SampleFormat {
    /// Returns the number of bytes used to store a single sample.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::Alaw | SampleFormat::Ulaw => 1,
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
            SampleFormat::Float32Le
            | SampleFormat::Float32Be
            | SampleFormat::S32Le
            | SampleFormat::S32Be => 4,
        }
    }

    /// The byte pattern that encodes silence in this format.
    pub fn silence_byte(&self) -> u8 {
        match self {
            SampleFormat::U8 => 0x80,
            SampleFormat::Alaw => 0x55,
            SampleFormat::Ulaw => 0xFF,
            _ => 0x00,
        }
    }
}

/// A sample specification that fully describes the format of a sample stream
/// between two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    /// Format / encoding of individual samples.
    pub format: SampleFormat,
    /// Number of independent channels.
    pub channels: u8,
    /// Number of samples per second (and per channel).
    pub rate: u32,
}

impl SampleSpec {
    /// Returns true if the spec describes a usable stream format.
    pub fn is_valid(&self) -> bool {
        self.rate > 0
            && self.rate <= RATE_MAX
            && self.channels > 0
            && self.channels <= CHANNELS_MAX
    }

    /// The size of one frame (one sample per channel), in bytes.
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// The number of bytes streamed per second.
    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.rate as usize
    }

    /// Converts a byte length (which must describe whole frames) to a
    /// duration in microseconds.
    pub fn bytes_to_usec(&self, bytes: usize) -> u64 {
        (bytes as u64).saturating_mul(1_000_000) / self.bytes_per_second() as u64
    }

    /// Converts a duration in microseconds to a byte length, rounded down to
    /// a whole frame.
    pub fn usec_to_bytes(&self, usec: u64) -> usize {
        let bytes = (usec.saturating_mul(self.bytes_per_second() as u64) / 1_000_000) as usize;
        bytes - (bytes % self.frame_size())
    }

    /// Like [`usec_to_bytes`](Self::usec_to_bytes), but rounds up to a whole
    /// frame.
    pub fn usec_to_bytes_round_up(&self, usec: u64) -> usize {
        let product = usec.saturating_mul(self.bytes_per_second() as u64);
        let bytes = (product.div_ceil(1_000_000)) as usize;
        let frame = self.frame_size();
        bytes.div_ceil(frame) * frame
    }
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self {
            format: SampleFormat::default(),
            channels: 2,
            rate: 44100,
        }
    }
}

impl std::fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {}ch {}Hz",
            self.format, self.channels, self.rate
        )
    }
}

impl TagStructRead for SampleSpec {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        ts.expect_tag(Tag::SampleSpec)?;
        let format = ts.inner.read_u8()?;
        let format = SampleFormat::from_u8(format)
            .ok_or_else(|| ProtocolError::Invalid(format!("invalid sample format {}", format)))?;
        let channels = ts.inner.read_u8()?;
        let rate = ts.inner.read_u32::<NetworkEndian>()?;

        Ok(Self {
            format,
            channels,
            rate,
        })
    }
}

impl TagStructWrite for SampleSpec {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.inner.write_u8(Tag::SampleSpec as u8)?;
        w.inner.write_u8(self.format as u8)?;
        w.inner.write_u8(self.channels)?;
        w.inner.write_u32::<NetworkEndian>(self.rate)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn sample_spec_serde() -> anyhow::Result<()> {
        let spec = SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        };

        test_serde(&spec)
    }

    #[test]
    fn validation() {
        let mut spec = SampleSpec::default();
        assert!(spec.is_valid());

        spec.rate = 0;
        assert!(!spec.is_valid());

        spec.rate = RATE_MAX + 1;
        assert!(!spec.is_valid());

        spec = SampleSpec {
            channels: CHANNELS_MAX + 1,
            ..SampleSpec::default()
        };
        assert!(!spec.is_valid());
    }

    #[test]
    fn usec_conversions() {
        let spec = SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        };

        assert_eq!(spec.frame_size(), 4);
        assert_eq!(spec.bytes_to_usec(spec.bytes_per_second()), 1_000_000);

        // Round-down lands on a frame boundary.
        assert_eq!(spec.usec_to_bytes(1_000_000), spec.bytes_per_second());
        assert_eq!(spec.usec_to_bytes(1) % spec.frame_size(), 0);
        assert_eq!(spec.usec_to_bytes_round_up(1), spec.frame_size());
    }
}
