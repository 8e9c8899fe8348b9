//! Module introspection.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// A description of one loaded module.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleInfo {
    /// The index of the module.
    pub index: u32,
    /// The module's name.
    pub name: Option<CString>,
    /// The argument string the module was loaded with.
    pub argument: Option<CString>,
    /// How many entities depend on the module.
    pub n_used: Option<u32>,
    /// Whether the module unloads itself when idle.
    pub auto_unload: bool,
}

impl CommandReply for ModuleInfo {}

impl TagStructRead for ModuleInfo {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid module index".into()))?,
            name: ts.read_string()?,
            argument: ts.read_string()?,
            n_used: ts.read_index()?,
            auto_unload: ts.read_bool()?,
        })
    }
}

impl TagStructWrite for ModuleInfo {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        w.write_string(self.name.as_ref())?;
        w.write_string(self.argument.as_ref())?;
        w.write_index(self.n_used)?;
        w.write_bool(self.auto_unload)?;
        Ok(())
    }
}

/// Parameters for [`super::Command::LoadModule`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadModuleParams {
    /// The name of the module to load.
    pub name: Option<CString>,
    /// The module's argument string.
    pub argument: Option<CString>,
}

impl TagStructRead for LoadModuleParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: ts.read_string()?,
            argument: ts.read_string()?,
        })
    }
}

impl TagStructWrite for LoadModuleParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_string(self.name.as_ref())?;
        w.write_string(self.argument.as_ref())?;
        Ok(())
    }
}

/// Reply to [`super::Command::LoadModule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadModuleReply {
    /// The index of the loaded module.
    pub index: u32,
}

impl CommandReply for LoadModuleReply {}

impl TagStructRead for LoadModuleReply {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts.read_u32()?,
        })
    }
}

impl TagStructWrite for LoadModuleReply {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn module_info_serde() -> anyhow::Result<()> {
        test_serde(&ModuleInfo {
            index: 0,
            name: Some(CString::new("module-null-sink")?),
            argument: Some(CString::new("sink_name=null")?),
            n_used: None,
            auto_unload: false,
        })
    }
}
