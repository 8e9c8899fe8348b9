//! Name lookup commands.

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// Reply to [`super::Command::LookupSink`] and
/// [`super::Command::LookupSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LookupReply {
    /// The index of the named entity.
    pub index: u32,
}

impl CommandReply for LookupReply {}

impl TagStructRead for LookupReply {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts.read_u32()?,
        })
    }
}

impl TagStructWrite for LookupReply {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        Ok(())
    }
}
