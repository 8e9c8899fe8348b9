//! Sample cache introspection.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// A description of one cached sample.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleInfo {
    /// The index of the sample.
    pub index: u32,
    /// The name the sample was uploaded under.
    pub name: Option<CString>,
    /// The default volume the sample plays at.
    pub cvolume: ChannelVolume,
    /// The duration of the sample, in microseconds.
    pub duration_usec: u64,
    /// The sample's format.
    pub sample_spec: SampleSpec,
    /// The sample's channel map.
    pub channel_map: ChannelMap,
    /// The size of the sample data, in bytes.
    pub bytes: u32,
    /// Whether the sample is loaded lazily from a file.
    pub lazy: bool,
    /// The filename backing a lazy sample.
    pub filename: Option<CString>,
    /// Additional metadata.
    pub props: Props,
}

impl CommandReply for SampleInfo {}

impl TagStructRead for SampleInfo {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid sample index".into()))?,
            name: ts.read_string()?,
            cvolume: ts.read()?,
            duration_usec: ts.read_usec()?,
            sample_spec: ts.read()?,
            channel_map: ts.read()?,
            bytes: ts.read_u32()?,
            lazy: ts.read_bool()?,
            filename: ts.read_string()?,
            props: if protocol_version >= 13 {
                ts.read()?
            } else {
                Props::new()
            },
        })
    }
}

impl TagStructWrite for SampleInfo {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        w.write_string(self.name.as_ref())?;
        w.write(self.cvolume)?;
        w.write_usec(self.duration_usec)?;
        w.write(self.sample_spec)?;
        w.write(self.channel_map)?;
        w.write_u32(self.bytes)?;
        w.write_bool(self.lazy)?;
        w.write_string(self.filename.as_ref())?;

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
    fn sample_info_serde() -> anyhow::Result<()> {
        test_serde(&SampleInfo {
            index: 0,
            name: Some(CString::new("bell")?),
            cvolume: ChannelVolume::norm(1),
            duration_usec: 250_000,
            bytes: 22050,
            ..Default::default()
        })
    }
}
