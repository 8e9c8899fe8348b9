//! Device suspend commands.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

/// Parameters for [`super::Command::SuspendSink`] and
/// [`super::Command::SuspendSource`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SuspendParams {
    /// The index of the device, or `None` to look it up by name.
    pub index: Option<u32>,
    /// The name of the device.
    pub name: Option<CString>,
    /// Whether to suspend or resume.
    pub suspend: bool,
}

impl TagStructRead for SuspendParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts.read_index()?,
            name: ts.read_string()?,
            suspend: ts.read_bool()?,
        })
    }
}

impl TagStructWrite for SuspendParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_index(self.index)?;
        w.write_string(self.name.as_ref())?;
        w.write_bool(self.suspend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn suspend_params_serde() -> anyhow::Result<()> {
        test_serde(&SuspendParams {
            index: Some(0),
            name: None,
            suspend: true,
        })
    }
}
