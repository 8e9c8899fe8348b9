//! Stream buffer metrics and configuration flags.
//!
//! A stream connected to a source is one of the source's "source outputs", a
//! stream connected to a sink is one of the sink's "sink inputs".

use super::*;

/// Stream configuration flags.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct StreamFlags {
    /// Create the stream in the corked state.
    pub start_corked: bool,

    /// Create the stream muted.
    pub start_muted: bool,

    /// Don't remap channels by their name, instead map them simply by their
    /// index.
    pub no_remap_channels: bool,

    /// When remapping channels by name, don't upmix or downmix them to
    /// related channels; copy them into matching channels 1:1.
    pub no_remix_channels: bool,

    /// Use the sample format of the device this stream is connected to, and
    /// ignore the format in the passed sample spec.
    pub fix_format: bool,

    /// Use the sample rate of the device, and ignore the rate in the passed
    /// sample spec.
    pub fix_rate: bool,

    /// Use the channel count and map of the device, and ignore the passed
    /// map.
    pub fix_channels: bool,

    /// Don't allow moving this stream to another device.
    pub no_move: bool,

    /// Allow dynamic changing of the sampling rate during playback.
    pub variable_rate: bool,

    /// Adjust the latency of the device based on the requested buffer
    /// metrics, splitting the target length between the device and the
    /// per-stream queue. May not be combined with `early_requests`.
    pub adjust_latency: bool,

    /// Emulate a fragment-style playback model: the device latency is pinned
    /// to the minimum request size so that requests are generated as soon as
    /// that much space frees up. May not be combined with `adjust_latency`.
    pub early_requests: bool,
}

/// Playback and record buffer settings.
///
/// Fields set to `u32::MAX` ask the server to pick a sensible value; the
/// effective values are returned in the stream-create reply.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BufferAttr {
    /// Maximum length of the buffer in bytes. Writes beyond this drop the
    /// oldest buffered audio.
    pub max_length: u32,

    /// The target length of the buffer. The server requests more data
    /// whenever less than this is buffered. Only valid for playback.
    pub target_length: u32,

    /// Pre-buffering: playback does not start before this many bytes are
    /// buffered. 0 disables prebuffering, so an underrunning stream keeps
    /// playing (silence) instead of pausing. Only valid for playback.
    pub pre_buffering: u32,

    /// The minimum request size. The server batches data requests until at
    /// least this much is missing. Only valid for playback.
    pub minimum_request_length: u32,

    /// The fragment size. The server ships captured audio in blocks of this
    /// size. Only valid for recording.
    pub fragment_size: u32,
}

impl Default for BufferAttr {
    fn default() -> Self {
        Self {
            max_length: u32::MAX,
            target_length: u32::MAX,
            pre_buffering: u32::MAX,
            minimum_request_length: u32::MAX,
            fragment_size: u32::MAX,
        }
    }
}

/// Parameters for a cork/uncork command.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct CorkStreamParams {
    /// The channel to cork or uncork.
    pub channel: u32,

    /// Whether to cork or uncork the stream.
    pub cork: bool,
}

impl TagStructRead for CorkStreamParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: ts
                .read_index()?
                .ok_or_else(|| ProtocolError::Invalid("invalid channel index".to_string()))?,
            cork: ts.read_bool()?,
        })
    }
}

impl TagStructWrite for CorkStreamParams {
    fn write(
        &self,
        ts: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        ts.write_index(Some(self.channel))?;
        ts.write_bool(self.cork)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cork_params_serde() -> anyhow::Result<()> {
        let params = CorkStreamParams {
            channel: 0,
            cork: true,
        };

        test_util::test_serde(&params)
    }
}
