//! Source output introspection.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// A description of one record stream, as returned by the info queries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceOutputInfo {
    /// The index of the source output.
    pub index: u32,
    /// The name of the stream.
    pub name: Option<CString>,
    /// The module owning the stream, if any.
    pub owner_module: Option<u32>,
    /// The client owning the stream, if any.
    pub client_index: Option<u32>,
    /// The source the stream is attached to.
    pub source_index: u32,
    /// The stream's native sample format.
    pub sample_spec: SampleSpec,
    /// The stream's channel map.
    pub channel_map: ChannelMap,
    /// Latency due to buffered audio, in microseconds.
    pub buffer_usec: u64,
    /// Latency of the source, in microseconds.
    pub source_usec: u64,
    /// The resampling method in use, if any.
    pub resample_method: Option<CString>,
    /// The driver that created the stream.
    pub driver: Option<CString>,
    /// Additional metadata.
    pub props: Props,
}

impl CommandReply for SourceOutputInfo {}

impl TagStructRead for SourceOutputInfo {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid source output index".into()))?,
            name: ts.read_string()?,
            owner_module: ts.read_index()?,
            client_index: ts.read_index()?,
            source_index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid source index".into()))?,
            sample_spec: ts.read()?,
            channel_map: ts.read()?,
            buffer_usec: ts.read_usec()?,
            source_usec: ts.read_usec()?,
            resample_method: ts.read_string()?,
            driver: ts.read_string()?,
            props: if protocol_version >= 13 {
                ts.read()?
            } else {
                Props::new()
            },
        })
    }
}

impl TagStructWrite for SourceOutputInfo {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        w.write_string(self.name.as_ref())?;
        w.write_index(self.owner_module)?;
        w.write_index(self.client_index)?;
        w.write_u32(self.source_index)?;
        w.write(self.sample_spec)?;
        w.write(self.channel_map)?;
        w.write_usec(self.buffer_usec)?;
        w.write_usec(self.source_usec)?;
        w.write_string(self.resample_method.as_ref())?;
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
    fn source_output_info_serde() -> anyhow::Result<()> {
        test_serde(&SourceOutputInfo {
            index: 2,
            name: Some(CString::new("recorder")?),
            source_index: 1,
            ..Default::default()
        })
    }
}
