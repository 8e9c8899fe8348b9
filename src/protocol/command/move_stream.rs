//! Stream move commands.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

/// Parameters for [`super::Command::MoveSinkInput`] and
/// [`super::Command::MoveSourceOutput`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MoveStreamParams {
    /// The index of the stream to move.
    pub index: u32,
    /// The index of the destination device, or `None` to look it up by name.
    pub device_index: Option<u32>,
    /// The name of the destination device.
    pub device_name: Option<CString>,
}

impl TagStructRead for MoveStreamParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid stream index".into()))?,
            device_index: ts.read_index()?,
            device_name: ts.read_string()?,
        })
    }
}

impl TagStructWrite for MoveStreamParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        w.write_index(self.device_index)?;
        w.write_string(self.device_name.as_ref())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn move_params_serde() -> anyhow::Result<()> {
        test_serde(&MoveStreamParams {
            index: 1,
            device_index: Some(2),
            device_name: None,
        })
    }
}
