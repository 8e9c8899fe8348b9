//! Server introspection.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// Reply to [`super::Command::GetServerInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerInfo {
    /// The name of the server implementation.
    pub server_name: Option<CString>,
    /// The server's version string.
    pub server_version: Option<CString>,
    /// The user the server runs as.
    pub user_name: Option<CString>,
    /// The host the server runs on.
    pub host_name: Option<CString>,
    /// The server's default sample spec.
    pub sample_spec: SampleSpec,
    /// The name of the default sink.
    pub default_sink_name: Option<CString>,
    /// The name of the default source.
    pub default_source_name: Option<CString>,
    /// A random cookie identifying this server instance.
    pub cookie: u32,
}

impl CommandReply for ServerInfo {}

impl TagStructRead for ServerInfo {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            server_name: ts.read_string()?,
            server_version: ts.read_string()?,
            user_name: ts.read_string()?,
            host_name: ts.read_string()?,
            sample_spec: ts.read()?,
            default_sink_name: ts.read_string()?,
            default_source_name: ts.read_string()?,
            cookie: ts.read_u32()?,
        })
    }
}

impl TagStructWrite for ServerInfo {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_string(self.server_name.as_ref())?;
        w.write_string(self.server_version.as_ref())?;
        w.write_string(self.user_name.as_ref())?;
        w.write_string(self.host_name.as_ref())?;
        w.write(self.sample_spec)?;
        w.write_string(self.default_sink_name.as_ref())?;
        w.write_string(self.default_source_name.as_ref())?;
        w.write_u32(self.cookie)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn server_info_serde() -> anyhow::Result<()> {
        test_serde(&ServerInfo {
            server_name: Some(CString::new("sonord")?),
            server_version: Some(CString::new("0.3.0")?),
            default_sink_name: Some(CString::new("null")?),
            cookie: 0xfeed,
            ..Default::default()
        })
    }
}
