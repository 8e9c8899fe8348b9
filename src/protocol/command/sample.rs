//! Sample cache commands: uploads and playback.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// Parameters for [`super::Command::CreateUploadStream`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadStreamParams {
    /// The name to store the sample under.
    pub name: Option<CString>,
    /// The sample's format.
    pub sample_spec: SampleSpec,
    /// The sample's channel map.
    pub channel_map: ChannelMap,
    /// The total size of the sample data, in bytes.
    pub length: u32,
    /// Additional metadata.
    pub props: Props,
}

impl TagStructRead for UploadStreamParams {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: ts.read_string()?,
            sample_spec: ts.read()?,
            channel_map: ts.read()?,
            length: ts.read_u32()?,
            props: if protocol_version >= 13 {
                ts.read()?
            } else {
                Props::new()
            },
        })
    }
}

impl TagStructWrite for UploadStreamParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_string(self.name.as_ref())?;
        w.write(self.sample_spec)?;
        w.write(self.channel_map)?;
        w.write_u32(self.length)?;

        if protocol_version >= 13 {
            w.write(&self.props)?;
        }

        Ok(())
    }
}

/// The server response to [`super::Command::CreateUploadStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateUploadStreamReply {
    /// The channel the client should write the sample data to.
    pub channel: u32,
    /// The expected total size, echoed back.
    pub length: u32,
}

impl CommandReply for CreateUploadStreamReply {}

impl TagStructRead for CreateUploadStreamReply {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?,
            length: ts.read_u32()?,
        })
    }
}

impl TagStructWrite for CreateUploadStreamReply {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.channel)?;
        w.write_u32(self.length)?;
        Ok(())
    }
}

/// Parameters for [`super::Command::PlaySample`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlaySampleParams {
    /// The sink to play on, or `None` for the default sink.
    pub sink_index: Option<u32>,
    /// The name of the sink to play on. Ignored if `sink_index` is set.
    pub sink_name: Option<CString>,
    /// The volume to play at.
    pub volume: ChannelVolume,
    /// The name of the cached sample.
    pub name: Option<CString>,
    /// Additional metadata for the spawned stream.
    pub props: Props,
}

impl TagStructRead for PlaySampleParams {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            sink_index: ts.read_index()?,
            sink_name: ts.read_string()?,
            volume: ts.read()?,
            name: ts.read_string()?,
            props: if protocol_version >= 13 {
                ts.read()?
            } else {
                Props::new()
            },
        })
    }
}

impl TagStructWrite for PlaySampleParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_index(self.sink_index)?;
        w.write_string(self.sink_name.as_ref())?;
        w.write(self.volume)?;
        w.write_string(self.name.as_ref())?;

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
    fn upload_params_serde() -> anyhow::Result<()> {
        test_serde(&UploadStreamParams {
            name: Some(CString::new("bell")?),
            length: 44100,
            ..Default::default()
        })
    }

    #[test]
    fn play_sample_serde() -> anyhow::Result<()> {
        test_serde(&PlaySampleParams {
            sink_index: None,
            sink_name: Some(CString::new("null")?),
            volume: ChannelVolume::norm(2),
            name: Some(CString::new("bell")?),
            ..Default::default()
        })
    }
}
