//! Client introspection.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// A description of one connected client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientInfo {
    /// The index of the client.
    pub index: u32,
    /// The client's name.
    pub name: Option<CString>,
    /// The module owning the client, if any.
    pub owner_module: Option<u32>,
    /// The protocol the client connected with.
    pub driver: Option<CString>,
    /// Additional metadata.
    pub props: Props,
}

impl CommandReply for ClientInfo {}

impl TagStructRead for ClientInfo {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid client index".into()))?,
            name: ts.read_string()?,
            owner_module: ts.read_index()?,
            driver: ts.read_string()?,
            props: if protocol_version >= 13 {
                ts.read()?
            } else {
                Props::new()
            },
        })
    }
}

impl TagStructWrite for ClientInfo {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        w.write_string(self.name.as_ref())?;
        w.write_index(self.owner_module)?;
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
    fn client_info_serde() -> anyhow::Result<()> {
        test_serde(&ClientInfo {
            index: 0,
            name: Some(CString::new("pavucontrol")?),
            driver: Some(CString::new("native")?),
            ..Default::default()
        })
    }
}
