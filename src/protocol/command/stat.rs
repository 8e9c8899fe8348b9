//! Memory pool statistics.

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// Reply to [`super::Command::Stat`]: a snapshot of the server's block pool
/// counters and the sample cache size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatInfo {
    /// Blocks currently allocated.
    pub n_allocated: u32,
    /// Bytes of audio data in currently allocated blocks.
    pub allocated_bytes: u32,
    /// Blocks allocated over the lifetime of the server.
    pub n_accumulated: u32,
    /// Bytes allocated over the lifetime of the server.
    pub accumulated_bytes: u32,
    /// Bytes held by the sample cache.
    pub sample_cache_bytes: u32,
}

impl CommandReply for StatInfo {}

impl TagStructRead for StatInfo {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            n_allocated: ts.read_u32()?,
            allocated_bytes: ts.read_u32()?,
            n_accumulated: ts.read_u32()?,
            accumulated_bytes: ts.read_u32()?,
            sample_cache_bytes: ts.read_u32()?,
        })
    }
}

impl TagStructWrite for StatInfo {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.n_allocated)?;
        w.write_u32(self.allocated_bytes)?;
        w.write_u32(self.n_accumulated)?;
        w.write_u32(self.accumulated_bytes)?;
        w.write_u32(self.sample_cache_bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn stat_serde() -> anyhow::Result<()> {
        test_serde(&StatInfo {
            n_allocated: 1,
            allocated_bytes: 4096,
            n_accumulated: 10,
            accumulated_bytes: 40960,
            sample_cache_bytes: 0,
        })
    }
}
