//! Server-initiated stream notifications.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

/// A request for more stream data, sent by the server whenever a playback
/// buffer's deficit reaches the minimum request size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Request {
    /// The channel of the stream.
    pub channel: u32,
    /// The number of bytes the client should write.
    pub length: u32,
}

impl TagStructRead for Request {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?,
            length: ts.read_u32()?,
        })
    }
}

impl TagStructWrite for Request {
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

/// Notifies a client that a stream's device was suspended or resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamSuspendedParams {
    /// The channel of the stream.
    pub channel: u32,
    /// Whether the device is now suspended.
    pub suspended: bool,
}

impl TagStructRead for StreamSuspendedParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?,
            suspended: ts.read_bool()?,
        })
    }
}

impl TagStructWrite for StreamSuspendedParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.channel)?;
        w.write_bool(self.suspended)?;
        Ok(())
    }
}

/// Notifies a client that its playback stream was moved to a different sink.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlaybackStreamMovedParams {
    /// The channel of the stream.
    pub channel: u32,
    /// The index of the new sink.
    pub sink_index: u32,
    /// The name of the new sink.
    pub sink_name: Option<CString>,
    /// Whether the new sink is suspended.
    pub suspended: bool,
}

impl TagStructRead for PlaybackStreamMovedParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?,
            sink_index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid sink index".into()))?,
            sink_name: ts.read_string()?,
            suspended: ts.read_bool()?,
        })
    }
}

impl TagStructWrite for PlaybackStreamMovedParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.channel)?;
        w.write_u32(self.sink_index)?;
        w.write_string(self.sink_name.as_ref())?;
        w.write_bool(self.suspended)?;
        Ok(())
    }
}

/// Notifies a client that its record stream was moved to a different source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordStreamMovedParams {
    /// The channel of the stream.
    pub channel: u32,
    /// The index of the new source.
    pub source_index: u32,
    /// The name of the new source.
    pub source_name: Option<CString>,
    /// Whether the new source is suspended.
    pub suspended: bool,
}

impl TagStructRead for RecordStreamMovedParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?,
            source_index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid source index".into()))?,
            source_name: ts.read_string()?,
            suspended: ts.read_bool()?,
        })
    }
}

impl TagStructWrite for RecordStreamMovedParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.channel)?;
        w.write_u32(self.source_index)?;
        w.write_string(self.source_name.as_ref())?;
        w.write_bool(self.suspended)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn request_serde() -> anyhow::Result<()> {
        test_serde(&Request {
            channel: 0,
            length: 1024,
        })
    }

    #[test]
    fn moved_serde() -> anyhow::Result<()> {
        test_serde(&PlaybackStreamMovedParams {
            channel: 1,
            sink_index: 2,
            sink_name: Some(CString::new("null-sink")?),
            suspended: false,
        })
    }
}
