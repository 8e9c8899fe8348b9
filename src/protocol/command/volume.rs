//! Volume and mute control commands.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

/// Parameters for the device volume commands, addressing a sink or source by
/// index or name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetDeviceVolumeParams {
    /// The index of the device, or `None` to look it up by name.
    pub index: Option<u32>,
    /// The name of the device.
    pub name: Option<CString>,
    /// The volume to apply.
    pub cvolume: ChannelVolume,
}

impl TagStructRead for SetDeviceVolumeParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts.read_index()?,
            name: ts.read_string()?,
            cvolume: ts.read()?,
        })
    }
}

impl TagStructWrite for SetDeviceVolumeParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_index(self.index)?;
        w.write_string(self.name.as_ref())?;
        w.write(self.cvolume)?;
        Ok(())
    }
}

/// Parameters for the stream volume commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetStreamVolumeParams {
    /// The index of the stream.
    pub index: u32,
    /// The volume to apply.
    pub cvolume: ChannelVolume,
}

impl TagStructRead for SetStreamVolumeParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid stream index".into()))?,
            cvolume: ts.read()?,
        })
    }
}

impl TagStructWrite for SetStreamVolumeParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        w.write(self.cvolume)?;
        Ok(())
    }
}

/// Parameters for the device mute commands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetDeviceMuteParams {
    /// The index of the device, or `None` to look it up by name.
    pub index: Option<u32>,
    /// The name of the device.
    pub name: Option<CString>,
    /// Whether to mute or unmute.
    pub mute: bool,
}

impl TagStructRead for SetDeviceMuteParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts.read_index()?,
            name: ts.read_string()?,
            mute: ts.read_bool()?,
        })
    }
}

impl TagStructWrite for SetDeviceMuteParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_index(self.index)?;
        w.write_string(self.name.as_ref())?;
        w.write_bool(self.mute)?;
        Ok(())
    }
}

/// Parameters for the stream mute commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetStreamMuteParams {
    /// The index of the stream.
    pub index: u32,
    /// Whether to mute or unmute.
    pub mute: bool,
}

impl TagStructRead for SetStreamMuteParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid stream index".into()))?,
            mute: ts.read_bool()?,
        })
    }
}

impl TagStructWrite for SetStreamMuteParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        w.write_bool(self.mute)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn volume_params_serde() -> anyhow::Result<()> {
        test_serde(&SetDeviceVolumeParams {
            index: None,
            name: Some(CString::new("null")?),
            cvolume: ChannelVolume::norm(2),
        })?;

        test_serde(&SetStreamMuteParams {
            index: 3,
            mute: true,
        })
    }
}
