//! Volume specification data types.

use std::fmt;

use byteorder::NetworkEndian;

use crate::protocol::ProtocolError;

use super::*;

const VOLUME_NORM: u32 = 0x10000;
const VOLUME_MUTED: u32 = 0;
const VOLUME_MAX: u32 = u32::MAX / 2;

/// Volume specification for a single channel.
///
/// Volumes are linear fixed-point values where [`Volume::NORM`] is unity
/// gain. The decibel mapping uses a cubic scale and is only meaningful for
/// presentation.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Volume(u32);

impl Volume {
    /// The normal volume (100%, 0 dB, no attenuation, no amplification).
    pub const NORM: Self = Volume(VOLUME_NORM);

    /// The muted volume (0%, -Inf dB).
    pub const MUTED: Self = Volume(VOLUME_MUTED);

    /// Gets the raw volume value as a `u32`.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Creates a volume from a raw `u32` sent over the wire.
    ///
    /// If the raw value is out of the valid range, it will be clamped.
    pub fn from_u32_clamped(raw: u32) -> Self {
        Volume(raw.min(VOLUME_MAX))
    }

    /// Multiplies two volumes, rounding to nearest and saturating.
    ///
    /// [`Volume::NORM`] is the identity; multiplication by
    /// [`Volume::MUTED`] yields silence.
    pub fn multiply(self, other: Volume) -> Volume {
        let product =
            (self.0 as u64 * other.0 as u64 + VOLUME_NORM as u64 / 2) / VOLUME_NORM as u64;
        Volume(product.min(VOLUME_MAX as u64) as u32)
    }

    /// Whether scaling by this volume is a no-op.
    pub fn is_norm(&self) -> bool {
        self.0 == VOLUME_NORM
    }

    /// Whether this volume silences the signal entirely.
    pub fn is_muted(&self) -> bool {
        self.0 == VOLUME_MUTED
    }

    /// Gets the amplification/attenuation in decibel (dB) corresponding to
    /// this volume.
    pub fn to_db(&self) -> f32 {
        self.to_linear().log10() * 20.0
    }

    /// Converts the volume to a linear factor, using a cubic scale.
    ///
    /// The range goes from 0.0 (muted) over 1.0 (0 dB) and beyond for
    /// amplification.
    pub fn to_linear(&self) -> f32 {
        let f = self.0 as f32 / VOLUME_NORM as f32;
        f * f * f
    }

    /// Converts from a linear factor. Out-of-range values are clamped.
    pub fn from_linear(linear: f32) -> Self {
        let raw = (linear.max(0.0).cbrt() * VOLUME_NORM as f32) as u32;
        Volume(raw.min(VOLUME_MAX))
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} dB", self.to_db())
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Volume")
            .field(&format!(
                "raw={:.1}, linear={:.1}, {:.1} dB",
                self.0 as f32 / VOLUME_NORM as f32,
                self.to_linear(),
                self.to_db()
            ))
            .finish()
    }
}

impl TagStructRead for Volume {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        ts.expect_tag(Tag::Volume)?;
        Ok(Volume::from_u32_clamped(
            ts.inner.read_u32::<NetworkEndian>()?,
        ))
    }
}

impl TagStructWrite for Volume {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.inner.write_u8(Tag::Volume as u8)?;
        w.inner.write_u32::<NetworkEndian>(self.as_u32())?;
        Ok(())
    }
}

/// Per-channel volume setting.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelVolume {
    channels: u8,
    volumes: [Volume; CHANNELS_MAX as usize],
}

impl Default for ChannelVolume {
    fn default() -> Self {
        Self::norm(1)
    }
}

impl ChannelVolume {
    /// Creates an empty `ChannelVolume` specifying no volumes for any
    /// channel. Note that empty volumes are invalid on the wire.
    pub fn empty() -> Self {
        Self {
            channels: 0,
            volumes: [Volume::MUTED; CHANNELS_MAX as usize],
        }
    }

    /// Create a `ChannelVolume` with N channels, all muted.
    pub fn muted(channels: usize) -> ChannelVolume {
        Self {
            channels: channels.min(CHANNELS_MAX as usize) as u8,
            volumes: [Volume::MUTED; CHANNELS_MAX as usize],
        }
    }

    /// Create a `ChannelVolume` with N channels, all at full volume.
    pub fn norm(channels: usize) -> ChannelVolume {
        Self {
            channels: channels.min(CHANNELS_MAX as usize) as u8,
            volumes: [Volume::NORM; CHANNELS_MAX as usize],
        }
    }

    /// Append a new volume to the list.
    pub fn push(&mut self, volume: Volume) {
        if self.channels < CHANNELS_MAX {
            self.volumes[self.channels as usize] = volume;
            self.channels += 1;
        }
    }

    /// The per-channel volumes stored in `self`.
    pub fn channels(&self) -> &[Volume] {
        &self.volumes[..self.channels as usize]
    }

    /// Whether every channel is at unity gain.
    pub fn is_norm(&self) -> bool {
        self.channels().iter().all(Volume::is_norm)
    }

    /// The average of the per-channel volumes, used where a scalar volume is
    /// needed.
    pub fn average(&self) -> Volume {
        if self.channels == 0 {
            return Volume::MUTED;
        }

        let sum: u64 = self.channels().iter().map(|v| v.as_u32() as u64).sum();
        Volume::from_u32_clamped((sum / self.channels as u64) as u32)
    }
}

impl fmt::Debug for ChannelVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only print the occupied part of the backing storage.
        self.channels().fmt(f)
    }
}

impl TagStructRead for ChannelVolume {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        ts.expect_tag(Tag::CVolume)?;
        let n_channels = ts.inner.read_u8()?;
        if n_channels == 0 || n_channels > CHANNELS_MAX {
            return Err(ProtocolError::Invalid(format!(
                "invalid cvolume channel count {}, must be between 1 and {}",
                n_channels, CHANNELS_MAX
            )));
        }

        let mut cvolume = ChannelVolume::empty();
        for _ in 0..n_channels {
            let raw = ts.inner.read_u32::<NetworkEndian>()?;
            cvolume.push(Volume::from_u32_clamped(raw))
        }

        Ok(cvolume)
    }
}

impl TagStructWrite for ChannelVolume {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.inner.write_u8(Tag::CVolume as u8)?;

        w.inner.write_u8(self.channels().len() as u8)?;
        for volume in self.channels() {
            w.inner.write_u32::<NetworkEndian>(volume.as_u32())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{test_util::test_serde_version, MAX_VERSION};

    use super::*;

    #[test]
    fn volume_serde() -> anyhow::Result<()> {
        let v = Volume::from_linear(0.5);
        test_serde_version(&v, MAX_VERSION)?;
        Ok(())
    }

    #[test]
    fn cvolume_serde() -> anyhow::Result<()> {
        let mut cv = ChannelVolume::empty();
        cv.push(Volume::from_linear(0.5));
        cv.push(Volume::from_linear(0.5));
        test_serde_version(&cv, MAX_VERSION)?;
        Ok(())
    }

    #[test]
    fn multiply_composition() {
        let half = Volume::from_u32_clamped(0x8000);

        // NORM is the identity, MUTED annihilates, and the operation is
        // commutative.
        assert_eq!(Volume::NORM.multiply(half), half);
        assert_eq!(half.multiply(Volume::NORM), half);
        assert_eq!(Volume::MUTED.multiply(half), Volume::MUTED);

        let a = Volume::from_u32_clamped(0x5123);
        let b = Volume::from_u32_clamped(0xC000);
        assert_eq!(a.multiply(b), b.multiply(a));
    }

    #[test]
    fn volume_conversions() {
        assert_eq!(Volume::NORM.to_linear(), 1.0);
        assert_eq!(Volume::MUTED.to_linear(), 0.0);
        assert_eq!(Volume::from_linear(-43.0).to_linear(), 0.0);
        assert_eq!(Volume::NORM.to_db(), 0.0);
        assert_eq!(Volume::MUTED.to_db(), -f32::INFINITY);
    }
}
