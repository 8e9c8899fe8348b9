//! Record stream creation.

use std::ffi::CString;

use crate::protocol::{serde::*, ProtocolError};

use super::CommandReply;

/// Parameters for [`super::Command::CreateRecordStream`].
#[derive(Default, Debug, Clone, Eq, PartialEq)]
pub struct RecordStreamParams {
    /// Stream name. Carried explicitly before protocol version 13, in the
    /// properties afterwards.
    pub name: Option<CString>,

    /// Sample format for the stream.
    pub sample_spec: SampleSpec,

    /// Channel map for the stream.
    pub channel_map: ChannelMap,

    /// Index of the source to capture from, or `None` for the default
    /// source.
    pub source_index: Option<u32>,

    /// Name of the source to capture from. Ignored if `source_index` is set.
    pub source_name: Option<CString>,

    /// Buffer attributes; only `max_length` and `fragment_size` apply to
    /// record streams.
    pub buffer_attr: BufferAttr,

    /// Stream flags.
    pub flags: StreamFlags,

    /// Capture the pre-mix signal of a single sink input instead of a
    /// source. Streams bound this way cannot be moved.
    pub direct_on_input_index: Option<u32>,

    /// Additional properties for the stream.
    pub props: Props,
}

impl TagStructRead for RecordStreamParams {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        let mut params = Self {
            name: if protocol_version < 13 {
                ts.read_string()?
            } else {
                None
            },
            sample_spec: ts.read()?,
            channel_map: ts.read()?,
            source_index: ts.read_index()?,
            source_name: ts.read_string()?,
            ..Default::default()
        };

        params.buffer_attr.max_length = ts.read_u32()?;
        params.flags.start_corked = ts.read_bool()?;
        params.buffer_attr.fragment_size = ts.read_u32()?;

        if protocol_version >= 12 {
            params.flags.no_remap_channels = ts.read_bool()?;
            params.flags.no_remix_channels = ts.read_bool()?;
            params.flags.fix_format = ts.read_bool()?;
            params.flags.fix_rate = ts.read_bool()?;
            params.flags.fix_channels = ts.read_bool()?;
            params.flags.no_move = ts.read_bool()?;
            params.flags.variable_rate = ts.read_bool()?;
        }

        if protocol_version >= 13 {
            params.flags.adjust_latency = ts.read_bool()?;
            params.props = ts.read()?;
            params.direct_on_input_index = ts.read_index()?;
        }

        Ok(params)
    }
}

impl TagStructWrite for RecordStreamParams {
    fn write(
        &self,
        ts: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        if protocol_version < 13 {
            ts.write_string(self.name.as_ref())?;
        }

        ts.write(self.sample_spec)?;
        ts.write(self.channel_map)?;
        ts.write_index(self.source_index)?;
        ts.write_string(self.source_name.as_ref())?;
        ts.write_u32(self.buffer_attr.max_length)?;
        ts.write_bool(self.flags.start_corked)?;
        ts.write_u32(self.buffer_attr.fragment_size)?;

        if protocol_version >= 12 {
            ts.write_bool(self.flags.no_remap_channels)?;
            ts.write_bool(self.flags.no_remix_channels)?;
            ts.write_bool(self.flags.fix_format)?;
            ts.write_bool(self.flags.fix_rate)?;
            ts.write_bool(self.flags.fix_channels)?;
            ts.write_bool(self.flags.no_move)?;
            ts.write_bool(self.flags.variable_rate)?;
        }

        if protocol_version >= 13 {
            ts.write_bool(self.flags.adjust_latency)?;
            ts.write(&self.props)?;
            ts.write_index(self.direct_on_input_index)?;
        }

        Ok(())
    }
}

/// The server response to [`super::Command::CreateRecordStream`].
#[derive(Default, Debug, Clone, Eq, PartialEq)]
pub struct CreateRecordStreamReply {
    /// Channel ID, used in other commands and in audio frames to refer to
    /// this stream. Scoped to the connection.
    pub channel: u32,

    /// Server-side index of the created source output.
    pub source_output_index: u32,

    /// Effective attributes of the created buffer.
    pub buffer_attr: BufferAttr,

    /// The negotiated sample format.
    pub sample_spec: SampleSpec,

    /// The negotiated channel map.
    pub channel_map: ChannelMap,

    /// The index of the source the stream is connected to.
    pub source_index: u32,

    /// Name of the source the stream is connected to.
    pub source_name: Option<CString>,

    /// Whether the source is suspended.
    pub suspended: bool,

    /// The latency of the source, in microseconds.
    pub stream_latency: u64,
}

impl CommandReply for CreateRecordStreamReply {}

impl TagStructRead for CreateRecordStreamReply {
    fn read(ts: &mut TagStructReader<'_>, protocol_version: u16) -> Result<Self, ProtocolError> {
        let mut reply = Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel".into()))?,
            source_output_index: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid source output index".into()))?,
            ..Default::default()
        };

        if protocol_version >= 9 {
            reply.buffer_attr.max_length = ts.read_u32()?;
            reply.buffer_attr.fragment_size = ts.read_u32()?;
        }

        if protocol_version >= 12 {
            reply.sample_spec = ts.read()?;
            reply.channel_map = ts.read()?;
            reply.source_index = ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid source index".into()))?;
            reply.source_name = ts.read_string()?;
            reply.suspended = ts.read_bool()?;
        }

        if protocol_version >= 13 {
            reply.stream_latency = ts.read_usec()?;
        }

        Ok(reply)
    }
}

impl TagStructWrite for CreateRecordStreamReply {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.channel)?;
        w.write_u32(self.source_output_index)?;

        if protocol_version >= 9 {
            w.write_u32(self.buffer_attr.max_length)?;
            w.write_u32(self.buffer_attr.fragment_size)?;
        }

        if protocol_version >= 12 {
            w.write(self.sample_spec)?;
            w.write(self.channel_map)?;
            w.write_u32(self.source_index)?;
            w.write_string(self.source_name.as_ref())?;
            w.write_bool(self.suspended)?;
        }

        if protocol_version >= 13 {
            w.write_usec(self.stream_latency)?;
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
        let params = RecordStreamParams {
            sample_spec: SampleSpec {
                format: SampleFormat::Float32Le,
                rate: 48000,
                channels: 1,
            },
            channel_map: ChannelMap::mono(),
            ..Default::default()
        };

        test_serde(&params)
    }

    #[test]
    fn reply_serde() -> anyhow::Result<()> {
        test_serde_version(
            &CreateRecordStreamReply {
                channel: 1,
                source_output_index: 4,
                source_index: 0,
                stream_latency: 20_000,
                ..Default::default()
            },
            13,
        )?;

        test_serde(&CreateRecordStreamReply {
            channel: 1,
            source_output_index: 4,
            ..Default::default()
        })
    }
}
