//! Sink input introspection.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// A description of one playback stream, as returned by the info queries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SinkInputInfo {
    /// The index of the sink input.
    pub index: u32,
    /// The name of the stream.
    pub name: Option<CString>,
    /// The module owning the stream, if any.
    pub owner_module: Option<u32>,
    /// The client owning the stream, if any.
    pub client_index: Option<u32>,
    /// The sink the stream is attached to.
    pub sink_index: u32,
    /// The stream's native sample format.
    pub sample_spec: SampleSpec,
    /// The stream's channel map.
    pub channel_map: ChannelMap,
    /// The stream's volume.
    pub cvolume: ChannelVolume,
    /// Latency due to buffered audio, in microseconds.
    pub buffer_usec: u64,
    /// Latency of the sink, in microseconds.
    pub sink_usec: u64,
    /// The resampling method in use, if any.
    pub resample_method: Option<CString>,
    /// The driver that created the stream.
    pub driver: Option<CString>,
    /// Whether the stream is muted.
    pub muted: bool,
    /// Additional metadata.
    pub props: Props,
}

impl CommandReply for SinkInputInfo {}

impl TagStructRead for SinkInputInfo {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid sink input index".into()))?,
            name: ts.read_string()?,
            owner_module: ts.read_index()?,
            client_index: ts.read_index()?,
            sink_index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid sink index".into()))?,
            sample_spec: ts.read()?,
            channel_map: ts.read()?,
            cvolume: ts.read()?,
            buffer_usec: ts.read_usec()?,
            sink_usec: ts.read_usec()?,
            resample_method: ts.read_string()?,
            driver: ts.read_string()?,
            muted: if protocol_version >= 11 {
                ts.read_bool()?
            } else {
                false
            },
            props: if protocol_version >= 13 {
                ts.read()?
            } else {
                Props::new()
            },
        })
    }
}

impl TagStructWrite for SinkInputInfo {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        w.write_string(self.name.as_ref())?;
        w.write_index(self.owner_module)?;
        w.write_index(self.client_index)?;
        w.write_u32(self.sink_index)?;
        w.write(self.sample_spec)?;
        w.write(self.channel_map)?;
        w.write(self.cvolume)?;
        w.write_usec(self.buffer_usec)?;
        w.write_usec(self.sink_usec)?;
        w.write_string(self.resample_method.as_ref())?;
        w.write_string(self.driver.as_ref())?;

        if protocol_version >= 11 {
            w.write_bool(self.muted)?;
        }

        if protocol_version >= 13 {
            w.write(&self.props)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn sink_input_info_serde() -> anyhow::Result<()> {
        test_serde(&SinkInputInfo {
            index: 7,
            name: Some(CString::new("music")?),
            client_index: Some(3),
            sink_index: 0,
            cvolume: ChannelVolume::norm(2),
            buffer_usec: 30_000,
            ..Default::default()
        })
    }
}
