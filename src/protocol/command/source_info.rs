//! Source introspection.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// A description of one source, as returned by the info queries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceInfo {
    /// The index of the source.
    pub index: u32,
    /// The name of the source.
    pub name: Option<CString>,
    /// A human readable description.
    pub description: Option<CString>,
    /// The source's native sample format.
    pub sample_spec: SampleSpec,
    /// The source's channel map.
    pub channel_map: ChannelMap,
    /// The module that created this source.
    pub owner_module: Option<u32>,
    /// The capture volume.
    pub cvolume: ChannelVolume,
    /// Whether the source is muted.
    pub muted: bool,
    /// The sink this source is a monitor of, if any.
    pub monitor_of_sink_index: Option<u32>,
    /// The name of the monitored sink.
    pub monitor_of_sink_name: Option<CString>,
    /// The source's current latency, in microseconds.
    pub latency_usec: u64,
    /// The driver backing the source.
    pub driver: Option<CString>,
    /// Additional metadata.
    pub props: Props,
}

impl CommandReply for SourceInfo {}

impl TagStructRead for SourceInfo {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid source index".into()))?,
            name: ts.read_string()?,
            description: ts.read_string()?,
            sample_spec: ts.read()?,
            channel_map: ts.read()?,
            owner_module: ts.read_index()?,
            cvolume: ts.read()?,
            muted: ts.read_bool()?,
            monitor_of_sink_index: ts.read_index()?,
            monitor_of_sink_name: ts.read_string()?,
            latency_usec: ts.read_usec()?,
            driver: ts.read_string()?,
            props: if protocol_version >= 13 {
                ts.read()?
            } else {
                Props::new()
            },
        })
    }
}

impl TagStructWrite for SourceInfo {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        w.write_string(self.name.as_ref())?;
        w.write_string(self.description.as_ref())?;
        w.write(self.sample_spec)?;
        w.write(self.channel_map)?;
        w.write_index(self.owner_module)?;
        w.write(self.cvolume)?;
        w.write_bool(self.muted)?;
        w.write_index(self.monitor_of_sink_index)?;
        w.write_string(self.monitor_of_sink_name.as_ref())?;
        w.write_usec(self.latency_usec)?;
        w.write_string(self.driver.as_ref())?;

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
    fn source_info_serde() -> anyhow::Result<()> {
        test_serde(&SourceInfo {
            index: 1,
            name: Some(CString::new("null.monitor")?),
            monitor_of_sink_index: Some(0),
            monitor_of_sink_name: Some(CString::new("null")?),
            cvolume: ChannelVolume::norm(2),
            ..Default::default()
        })
    }
}
