//! The client-name / client-properties handshake command.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// Updates the client's properties. Before protocol version 13 this carried
/// only a name string, which is mapped onto the
/// [`Prop::ApplicationName`] property.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetClientNameParams {
    /// The client's properties.
    pub props: Props,
}

impl TagStructRead for SetClientNameParams {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        let mut props = Props::new();
        if protocol_version >= 13 {
            props = ts.read()?;
        } else if let Some(name) = ts.read_string()? {
            props.set(Prop::ApplicationName, name);
        }

        Ok(Self { props })
    }
}

impl TagStructWrite for SetClientNameParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        if protocol_version >= 13 {
            w.write(&self.props)?;
        } else {
            let name = self
                .props
                .get(Prop::ApplicationName)
                .and_then(|v| CString::new(v.strip_suffix(&[0]).unwrap_or(v)).ok());
            w.write_string(name.as_ref())?;
        }

        Ok(())
    }
}

/// Server reply to [`super::Command::SetClientName`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetClientNameReply {
    /// The index of the client's entity on the server.
    pub client_index: u32,
}

impl CommandReply for SetClientNameReply {}

impl TagStructRead for SetClientNameReply {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        let client_index = if protocol_version >= 13 {
            ts.read_u32()?
        } else {
            u32::MAX
        };

        Ok(Self { client_index })
    }
}

impl TagStructWrite for SetClientNameReply {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        if protocol_version >= 13 {
            w.write_u32(self.client_index)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::{test_serde, test_serde_version};

    use super::*;

    #[test]
    fn params_serde() -> anyhow::Result<()> {
        let mut props = Props::new();
        props.set_str(Prop::ApplicationName, "sonord-tests");

        test_serde(&SetClientNameParams { props })
    }

    #[test]
    fn reply_serde_v13() -> anyhow::Result<()> {
        test_serde_version(&SetClientNameReply { client_index: 3 }, 13)
    }
}
