//! Latency / timing queries.

use std::time;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// Parameters for the latency queries. The client timestamps the request so
/// it can estimate the transport delay from the echoed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyParams {
    /// The channel of the stream.
    pub channel: u32,
    /// The client's clock at the time of the request.
    pub now: time::SystemTime,
}

impl Default for LatencyParams {
    fn default() -> Self {
        Self {
            channel: 0,
            now: time::UNIX_EPOCH,
        }
    }
}

impl TagStructRead for LatencyParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?,
            now: ts.read_timeval()?,
        })
    }
}

impl TagStructWrite for LatencyParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.channel)?;
        w.write_timeval(self.now)?;
        Ok(())
    }
}

/// Reply to the playback and record latency queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyReply {
    /// Latency attributable to the device, in microseconds.
    pub device_usec: u64,
    /// Latency attributable to the device's monitor, in microseconds. Zero
    /// for playback streams.
    pub monitor_usec: u64,
    /// Whether the stream is actively transferring audio.
    pub playing: bool,
    /// The client's clock, echoed back from the request.
    pub client_time: time::SystemTime,
    /// The server's clock when the reply was assembled.
    pub server_time: time::SystemTime,
    /// The stream queue's write index, in bytes.
    pub write_index: i64,
    /// The stream queue's read index, in bytes.
    pub read_index: i64,
}

impl Default for LatencyReply {
    fn default() -> Self {
        Self {
            device_usec: 0,
            monitor_usec: 0,
            playing: false,
            client_time: time::UNIX_EPOCH,
            server_time: time::UNIX_EPOCH,
            write_index: 0,
            read_index: 0,
        }
    }
}

impl CommandReply for LatencyReply {}

impl TagStructRead for LatencyReply {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            device_usec: ts.read_usec()?,
            monitor_usec: ts.read_usec()?,
            playing: ts.read_bool()?,
            client_time: ts.read_timeval()?,
            server_time: ts.read_timeval()?,
            write_index: ts.read_i64()?,
            read_index: ts.read_i64()?,
        })
    }
}

impl TagStructWrite for LatencyReply {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_usec(self.device_usec)?;
        w.write_usec(self.monitor_usec)?;
        w.write_bool(self.playing)?;
        w.write_timeval(self.client_time)?;
        w.write_timeval(self.server_time)?;
        w.write_i64(self.write_index)?;
        w.write_i64(self.read_index)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn latency_serde() -> anyhow::Result<()> {
        test_serde(&LatencyParams {
            channel: 0,
            now: time::UNIX_EPOCH + time::Duration::new(1000, 5000),
        })?;

        test_serde(&LatencyReply {
            device_usec: 40_000,
            playing: true,
            write_index: 16384,
            read_index: 8192,
            ..Default::default()
        })
    }
}
