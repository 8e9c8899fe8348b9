//! Authentication / handshake command and reply.

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

const VERSION_MASK: u32 = 0x0000ffff;
const FLAG_SHM: u32 = 0x80000000;

/// Establishes the connection and authenticates the client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthParams {
    /// The client's protocol version.
    pub version: u16,
    /// Whether the client can resolve shared-pool block references.
    pub supports_shm: bool,
    /// The authentication cookie.
    pub cookie: Vec<u8>,
}

impl TagStructRead for AuthParams {
    fn read(ts: &mut TagStructReader<'_>, _version: u16) -> Result<Self, ProtocolError> {
        let (flags_and_version, cookie) = (ts.read_u32()?, ts.read_arbitrary()?);

        Ok(Self {
            version: (flags_and_version & VERSION_MASK) as u16,
            supports_shm: flags_and_version & FLAG_SHM != 0,
            cookie,
        })
    }
}

impl TagStructWrite for AuthParams {
    fn write(&self, w: &mut TagStructWriter<'_>, _version: u16) -> Result<(), ProtocolError> {
        let flags_and_version: u32 =
            (self.version as u32 & VERSION_MASK) | if self.supports_shm { FLAG_SHM } else { 0 };

        w.write_u32(flags_and_version)?;
        w.write_arbitrary(self.cookie.as_slice())?;
        Ok(())
    }
}

/// Server reply to [`super::Command::Auth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthReply {
    /// The server's protocol version.
    pub version: u16,
    /// The outcome of the shared-pool negotiation.
    pub use_shm: bool,
}

impl CommandReply for AuthReply {}

impl TagStructRead for AuthReply {
    fn read(ts: &mut TagStructReader<'_>, _version: u16) -> Result<Self, ProtocolError> {
        let reply = ts.read_u32()?;

        Ok(Self {
            version: (reply & VERSION_MASK) as u16,
            use_shm: reply & FLAG_SHM != 0,
        })
    }
}

impl TagStructWrite for AuthReply {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        let reply: u32 = self.version as u32 | if self.use_shm { FLAG_SHM } else { 0 };
        w.write_u32(reply)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn auth_serde() -> anyhow::Result<()> {
        let auth = AuthParams {
            version: 13,
            supports_shm: true,
            cookie: vec![1, 2, 3, 4],
        };

        test_serde(&auth)
    }
}
