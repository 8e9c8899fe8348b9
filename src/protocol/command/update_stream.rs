//! Runtime stream reconfiguration: names, buffer metrics, sample rates and
//! property lists.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// Parameters for the stream rename commands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetStreamNameParams {
    /// The channel of the stream.
    pub channel: u32,
    /// The new name.
    pub name: Option<CString>,
}

impl TagStructRead for SetStreamNameParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?,
            name: ts.read_string()?,
        })
    }
}

impl TagStructWrite for SetStreamNameParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.channel)?;
        w.write_string(self.name.as_ref())?;
        Ok(())
    }
}

/// Parameters for the buffer-attr update commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetStreamBufferAttrParams {
    /// The channel of the stream.
    pub channel: u32,
    /// The requested metrics. For playback streams `max_length`,
    /// `target_length`, `pre_buffering` and `minimum_request_length` apply;
    /// for record streams `max_length` and `fragment_size`.
    pub buffer_attr: BufferAttr,
    /// Re-run the device latency adjustment with the new metrics.
    pub adjust_latency: bool,
    /// See [`StreamFlags::early_requests`].
    pub early_requests: bool,
    /// True if this update addresses a playback stream. Not serialized;
    /// implied by the command.
    pub playback: bool,
}

impl SetStreamBufferAttrParams {
    fn read_with(
        ts: &mut TagStructReader<'_>,
        protocol_version: u16,
        playback: bool,
    ) -> Result<Self, ProtocolError> {
        let mut params = Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?,
            playback,
            ..Default::default()
        };

        params.buffer_attr.max_length = ts.read_u32()?;
        if playback {
            params.buffer_attr.target_length = ts.read_u32()?;
            params.buffer_attr.pre_buffering = ts.read_u32()?;
            params.buffer_attr.minimum_request_length = ts.read_u32()?;
        } else {
            params.buffer_attr.fragment_size = ts.read_u32()?;
        }

        if protocol_version >= 13 {
            params.adjust_latency = ts.read_bool()?;
            params.early_requests = ts.read_bool()?;
        }

        Ok(params)
    }

    /// Reads the playback-stream form of the command payload.
    pub fn read_playback(
        ts: &mut TagStructReader<'_>,
        protocol_version: u16,
    ) -> Result<Self, ProtocolError> {
        Self::read_with(ts, protocol_version, true)
    }

    /// Reads the record-stream form of the command payload.
    pub fn read_record(
        ts: &mut TagStructReader<'_>,
        protocol_version: u16,
    ) -> Result<Self, ProtocolError> {
        Self::read_with(ts, protocol_version, false)
    }
}

impl TagStructWrite for SetStreamBufferAttrParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.channel)?;
        w.write_u32(self.buffer_attr.max_length)?;
        if self.playback {
            w.write_u32(self.buffer_attr.target_length)?;
            w.write_u32(self.buffer_attr.pre_buffering)?;
            w.write_u32(self.buffer_attr.minimum_request_length)?;
        } else {
            w.write_u32(self.buffer_attr.fragment_size)?;
        }

        if protocol_version >= 13 {
            w.write_bool(self.adjust_latency)?;
            w.write_bool(self.early_requests)?;
        }

        Ok(())
    }
}

/// Reply to the playback buffer-attr update: the effective metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetPlaybackBufferAttrReply {
    /// The effective metrics.
    pub buffer_attr: BufferAttr,
    /// The number of bytes the client may write immediately.
    pub missing: u32,
}

impl CommandReply for SetPlaybackBufferAttrReply {}

impl TagStructRead for SetPlaybackBufferAttrReply {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            buffer_attr: BufferAttr {
                max_length: ts.read_u32()?,
                target_length: ts.read_u32()?,
                pre_buffering: ts.read_u32()?,
                minimum_request_length: ts.read_u32()?,
                ..Default::default()
            },
            missing: ts.read_u32()?,
        })
    }
}

impl TagStructWrite for SetPlaybackBufferAttrReply {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.buffer_attr.max_length)?;
        w.write_u32(self.buffer_attr.target_length)?;
        w.write_u32(self.buffer_attr.pre_buffering)?;
        w.write_u32(self.buffer_attr.minimum_request_length)?;
        w.write_u32(self.missing)?;
        Ok(())
    }
}

/// Reply to the record buffer-attr update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetRecordBufferAttrReply {
    /// The effective metrics.
    pub buffer_attr: BufferAttr,
}

impl CommandReply for SetRecordBufferAttrReply {}

impl TagStructRead for SetRecordBufferAttrReply {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            buffer_attr: BufferAttr {
                max_length: ts.read_u32()?,
                fragment_size: ts.read_u32()?,
                ..Default::default()
            },
        })
    }
}

impl TagStructWrite for SetRecordBufferAttrReply {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.buffer_attr.max_length)?;
        w.write_u32(self.buffer_attr.fragment_size)?;
        Ok(())
    }
}

/// Parameters for the sample rate update commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateSampleRateParams {
    /// The channel of the stream.
    pub channel: u32,
    /// The new sample rate, in Hz.
    pub rate: u32,
}

impl TagStructRead for UpdateSampleRateParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?,
            rate: ts.read_u32()?,
        })
    }
}

impl TagStructWrite for UpdateSampleRateParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.channel)?;
        w.write_u32(self.rate)?;
        Ok(())
    }
}

/// Parameters for the client proplist update command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateClientProplistParams {
    /// How to combine the update with the existing list.
    pub mode: PropsUpdateMode,
    /// The properties to apply.
    pub props: Props,
}

impl Default for UpdateClientProplistParams {
    fn default() -> Self {
        Self {
            mode: PropsUpdateMode::Replace,
            props: Props::new(),
        }
    }
}

impl TagStructRead for UpdateClientProplistParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            mode: ts.read_enum()?,
            props: ts.read()?,
        })
    }
}

impl TagStructWrite for UpdateClientProplistParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.mode as u32)?;
        w.write(&self.props)?;
        Ok(())
    }
}

/// Parameters for the stream proplist update commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStreamProplistParams {
    /// The channel of the stream.
    pub channel: u32,
    /// How to combine the update with the existing list.
    pub mode: PropsUpdateMode,
    /// The properties to apply.
    pub props: Props,
}

impl Default for UpdateStreamProplistParams {
    fn default() -> Self {
        Self {
            channel: 0,
            mode: PropsUpdateMode::Replace,
            props: Props::new(),
        }
    }
}

impl TagStructRead for UpdateStreamProplistParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?,
            mode: ts.read_enum()?,
            props: ts.read()?,
        })
    }
}

impl TagStructWrite for UpdateStreamProplistParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.channel)?;
        w.write_u32(self.mode as u32)?;
        w.write(&self.props)?;
        Ok(())
    }
}

/// Parameters for the client proplist key removal command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoveClientProplistParams {
    /// The keys to remove.
    pub keys: Vec<CString>,
}

impl TagStructRead for RemoveClientProplistParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        let mut keys = Vec::new();
        while let Some(key) = ts.read_string()? {
            keys.push(key);
        }

        Ok(Self { keys })
    }
}

impl TagStructWrite for RemoveClientProplistParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        for key in &self.keys {
            w.write_string(Some(key))?;
        }
        w.write_null_string()?;
        Ok(())
    }
}

/// Parameters for the stream proplist key removal commands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoveStreamProplistParams {
    /// The channel of the stream.
    pub channel: u32,
    /// The keys to remove.
    pub keys: Vec<CString>,
}

impl TagStructRead for RemoveStreamProplistParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        let channel = ts
            .read_index()?
            .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?;

        let mut keys = Vec::new();
        while let Some(key) = ts.read_string()? {
            keys.push(key);
        }

        Ok(Self { channel, keys })
    }
}

impl TagStructWrite for RemoveStreamProplistParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.channel)?;
        for key in &self.keys {
            w.write_string(Some(key))?;
        }
        w.write_null_string()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::test_util::test_serde;

    use super::*;

    #[test]
    fn stream_name_serde() -> anyhow::Result<()> {
        test_serde(&SetStreamNameParams {
            channel: 0,
            name: Some(CString::new("renamed")?),
        })
    }

    #[test]
    fn update_proplist_serde() -> anyhow::Result<()> {
        let mut props = Props::new();
        props.set_str(Prop::MediaRole, "music");

        test_serde(&UpdateStreamProplistParams {
            channel: 1,
            mode: PropsUpdateMode::Merge,
            props,
        })
    }

    #[test]
    fn remove_proplist_serde() -> anyhow::Result<()> {
        test_serde(&RemoveStreamProplistParams {
            channel: 1,
            keys: vec![CString::new("media.role")?],
        })
    }
}
