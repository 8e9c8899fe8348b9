//! Mappings from stream channels to speaker positions.

use std::fmt;

use enum_primitive_derive::Primitive;

use super::*;
use crate::protocol::ProtocolError;

/// Channel position labels.
#[allow(missing_docs)]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum ChannelPosition {
    #[default]
    Mono = 0,
    FrontLeft = 1,
    FrontRight = 2,
    FrontCenter = 3,
    RearCenter = 4,
    RearLeft = 5,
    RearRight = 6,
    Lfe = 7,
    FrontLeftOfCenter = 8,
    FrontRightOfCenter = 9,
    SideLeft = 10,
    SideRight = 11,
    Aux0 = 12,
    Aux1 = 13,
    Aux2 = 14,
    Aux3 = 15,
}

/// A map from stream channels to speaker positions.
///
/// These values are relevant for conversion and mixing of streams.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    channels: u8,
    map: [ChannelPosition; CHANNELS_MAX as usize],
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::mono()
    }
}

impl ChannelMap {
    /// Creates an empty channel map.
    pub fn empty() -> Self {
        ChannelMap {
            channels: 0,
            map: [Default::default(); CHANNELS_MAX as usize],
        }
    }

    /// Creates a channel map with a single mono channel.
    pub fn mono() -> Self {
        let mut map = Self::empty();
        map.push(ChannelPosition::Mono);
        map
    }

    /// Creates a channel map for stereo streams.
    pub fn stereo() -> Self {
        let mut map = Self::empty();
        map.push(ChannelPosition::FrontLeft);
        map.push(ChannelPosition::FrontRight);
        map
    }

    /// Creates a default map for the given number of channels: mono and
    /// stereo get their named positions, anything else is mapped in position
    /// order.
    pub fn default_for(channels: u8) -> Self {
        use num_traits::FromPrimitive as _;

        match channels {
            1 => Self::mono(),
            2 => Self::stereo(),
            n => {
                let mut map = Self::empty();
                for i in 0..n.min(CHANNELS_MAX) {
                    map.push(
                        ChannelPosition::from_u8(1 + i % 15).unwrap_or(ChannelPosition::Mono),
                    );
                }
                map
            }
        }
    }

    /// Appends a position to the map. Positions beyond the channel limit are
    /// ignored.
    pub fn push(&mut self, position: ChannelPosition) {
        if self.channels < CHANNELS_MAX {
            self.map[self.channels as usize] = position;
            self.channels += 1;
        }
    }

    /// The number of channels in the map.
    pub fn num_channels(&self) -> u8 {
        self.channels
    }

    /// The mapped positions.
    pub fn positions(&self) -> &[ChannelPosition] {
        &self.map[..self.channels as usize]
    }
}

impl fmt::Debug for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only print the occupied part of the backing storage.
        self.positions().fmt(f)
    }
}

impl TagStructRead for ChannelMap {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        use num_traits::FromPrimitive as _;

        ts.expect_tag(Tag::ChannelMap)?;

        let channels = ts.inner.read_u8()?;
        if channels > CHANNELS_MAX {
            return Err(ProtocolError::Invalid(format!(
                "channel map too large ({} channels)",
                channels
            )));
        }

        let mut map = ChannelMap::empty();
        for _ in 0..channels {
            let raw = ts.inner.read_u8()?;
            map.push(ChannelPosition::from_u8(raw).ok_or_else(|| {
                ProtocolError::Invalid(format!("invalid channel position {}", raw))
            })?);
        }

        Ok(map)
    }
}

impl TagStructWrite for ChannelMap {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.inner.write_u8(Tag::ChannelMap as u8)?;
        w.inner.write_u8(self.channels)?;
        for position in self.positions() {
            w.inner.write_u8(*position as u8)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn channel_map_serde() -> anyhow::Result<()> {
        test_serde(&ChannelMap::stereo())
    }

    #[test]
    fn default_maps() {
        assert_eq!(ChannelMap::default_for(1).positions(), &[ChannelPosition::Mono]);
        assert_eq!(
            ChannelMap::default_for(2).positions(),
            &[ChannelPosition::FrontLeft, ChannelPosition::FrontRight]
        );
        assert_eq!(ChannelMap::default_for(6).num_channels(), 6);
    }
}
