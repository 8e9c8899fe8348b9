//! Sink introspection.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// Parameters for the info queries that address a device by index or name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetDeviceInfoParams {
    /// The index of the device, or `None` to look it up by name.
    pub index: Option<u32>,
    /// The name of the device.
    pub name: Option<CString>,
}

impl TagStructRead for GetDeviceInfoParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts.read_index()?,
            name: ts.read_string()?,
        })
    }
}

impl TagStructWrite for GetDeviceInfoParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_index(self.index)?;
        w.write_string(self.name.as_ref())?;
        Ok(())
    }
}

/// A description of one sink, as returned by the info queries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SinkInfo {
    /// The index of the sink.
    pub index: u32,
    /// The name of the sink.
    pub name: Option<CString>,
    /// A human readable description.
    pub description: Option<CString>,
    /// The sink's native sample format.
    pub sample_spec: SampleSpec,
    /// The sink's channel map.
    pub channel_map: ChannelMap,
    /// The module that created this sink.
    pub owner_module: Option<u32>,
    /// The master volume.
    pub cvolume: ChannelVolume,
    /// Whether the sink is muted.
    pub muted: bool,
    /// The index of the sink's monitor source.
    pub monitor_source_index: u32,
    /// The name of the sink's monitor source.
    pub monitor_source_name: Option<CString>,
    /// The sink's current latency, in microseconds.
    pub latency_usec: u64,
    /// The driver backing the sink.
    pub driver: Option<CString>,
    /// Additional metadata.
    pub props: Props,
}

impl CommandReply for SinkInfo {}

impl TagStructRead for SinkInfo {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid sink index".into()))?,
            name: ts.read_string()?,
            description: ts.read_string()?,
            sample_spec: ts.read()?,
            channel_map: ts.read()?,
            owner_module: ts.read_index()?,
            cvolume: ts.read()?,
            muted: ts.read_bool()?,
            monitor_source_index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid monitor source".into()))?,
            monitor_source_name: ts.read_string()?,
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

impl TagStructWrite for SinkInfo {
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
        w.write_u32(self.monitor_source_index)?;
        w.write_string(self.monitor_source_name.as_ref())?;
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
    fn sink_info_serde() -> anyhow::Result<()> {
        test_serde(&SinkInfo {
            index: 0,
            name: Some(CString::new("null")?),
            description: Some(CString::new("Null Output")?),
            cvolume: ChannelVolume::norm(2),
            monitor_source_index: 1,
            monitor_source_name: Some(CString::new("null.monitor")?),
            driver: Some(CString::new("null-sink")?),
            ..Default::default()
        })
    }
}
