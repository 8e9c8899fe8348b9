//! Per-connection protocol state: the command handlers and the playback /
//! record stream lifecycle.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::time::SystemTime;

use log::{debug, warn};

use crate::core::memblockq::MemBlockQ;
use crate::core::sink::DeviceState;
use crate::core::sink_input::{StreamOwner, StreamState};
use crate::core::{Core, CoreError, StreamEvent};
use crate::core::memchunk::MemChunk;
use crate::protocol::{
    self, BufferAttr, ChannelMap, ChannelVolume, ClientInfo, Command, CommandReply,
    CreatePlaybackStreamReply, CreateRecordStreamReply, CreateUploadStreamReply, ErrorCode,
    LatencyReply, LookupReply, ModuleInfo, PlaybackStreamMovedParams, PlaybackStreamParams, Prop,
    Props, ProtocolError, RecordStreamMovedParams, RecordStreamParams, Request, SampleInfo,
    SampleSpec, SeekMode, ServerInfo, SetClientNameReply, SetPlaybackBufferAttrReply,
    SetRecordBufferAttrReply, SinkInfo, SinkInputInfo, SourceInfo, SourceOutputInfo, StreamFlags,
    StreamSuspendedParams, SubscriptionEvent, SubscriptionMask, MAX_VERSION, MIN_VERSION,
};

use super::pdispatch::Pdispatch;
use super::pstream::PStream;

/// Hard cap on a playback queue.
const MAX_QUEUE_LENGTH: usize = 4 * 1024 * 1024;

/// Hard cap on an uploaded sample.
const MAX_SAMPLE_BYTES: usize = 16 * 1024 * 1024;

/// Default target length, when the client asks the server to choose.
const DEFAULT_TLENGTH_MSEC: u64 = 2000;

/// Default minimum request / fragment granularity.
const DEFAULT_PROCESS_MSEC: u64 = 20;

/// An in-progress sample upload.
struct UploadStream {
    name: String,
    sample_spec: SampleSpec,
    channel_map: ChannelMap,
    expected: usize,
    data: Vec<u8>,
    props: Props,
}

/// Work the connection cannot do by itself and hands back to the server.
#[derive(Debug)]
pub enum ServerAction {
    /// Load a device module and reply with its index.
    LoadModule {
        /// Reply tag.
        seq: u32,
        /// Module implementation name.
        name: String,
        /// Raw module arguments.
        argument: String,
    },
    /// Kick the connection owning the given client entity.
    KillClient {
        /// Reply tag.
        seq: u32,
        /// The client entity to kill.
        client_index: u32,
    },
}

/// One accepted client connection.
pub struct Connection {
    /// The connection id, used to address core notifications.
    pub id: u32,
    /// The framed transport.
    pub pstream: PStream,
    /// The packet dispatcher.
    pub pdispatch: Pdispatch,
    /// Whether the peer passed authentication.
    pub authorized: bool,
    /// The negotiated protocol version.
    pub version: u16,
    /// The core entity representing this client.
    pub client_index: u32,
    /// The peer's subscription mask.
    pub subscription: SubscriptionMask,

    playback: BTreeMap<u32, u32>,
    records: BTreeMap<u32, u32>,
    uploads: BTreeMap<u32, UploadStream>,
    next_channel: u32,
    record_cursor: u32,
}

impl Connection {
    /// Wraps an accepted socket.
    pub fn new(id: u32, pstream: PStream, client_index: u32) -> Self {
        Self {
            id,
            pstream,
            pdispatch: Pdispatch::new(MAX_VERSION),
            authorized: false,
            version: MAX_VERSION,
            client_index,
            subscription: SubscriptionMask::empty(),
            playback: BTreeMap::new(),
            records: BTreeMap::new(),
            uploads: BTreeMap::new(),
            next_channel: 0,
            record_cursor: u32::MAX,
        }
    }

    /// The sink inputs owned by this connection, for teardown.
    pub fn playback_streams(&self) -> Vec<u32> {
        self.playback.values().copied().collect()
    }

    /// The source outputs owned by this connection, for teardown.
    pub fn record_streams(&self) -> Vec<u32> {
        self.records.values().copied().collect()
    }

    fn alloc_channel(&mut self) -> u32 {
        let channel = self.next_channel;
        self.next_channel += 1;
        channel
    }

    // === Outbound helpers ===

    pub(crate) fn send_reply<R: CommandReply>(&mut self, seq: u32, reply: &R) {
        let mut frame = Vec::new();
        if let Err(e) = protocol::write_reply_message(&mut frame, seq, reply, self.version) {
            warn!("conn {}: failed to encode reply: {}", self.id, e);
            return;
        }
        self.pstream.send_frame(frame);
    }

    pub(crate) fn send_ack(&mut self, seq: u32) {
        let mut frame = Vec::new();
        if protocol::write_ack_message(&mut frame, seq).is_ok() {
            self.pstream.send_frame(frame);
        }
    }

    pub(crate) fn send_error(&mut self, seq: u32, code: ErrorCode) {
        let mut frame = Vec::new();
        if protocol::write_error(&mut frame, seq, code).is_ok() {
            self.pstream.send_frame(frame);
        }
    }

    fn send_command(&mut self, command: &Command) {
        let mut frame = Vec::new();
        match protocol::write_command_message(&mut frame, u32::MAX, command, self.version) {
            Ok(()) => self.pstream.send_frame(frame),
            Err(e) => warn!("conn {}: failed to encode {:?}: {}", self.id, command.tag(), e),
        }
    }

    // === Inbound entry points ===

    /// Accepts audio for a playback or upload channel.
    pub(crate) fn handle_memblock(
        &mut self,
        core: &mut Core,
        channel: u32,
        offset: i64,
        seek: SeekMode,
        chunk: MemChunk,
    ) -> Result<(), ProtocolError> {
        if let Some(&input) = self.playback.get(&channel) {
            core.sink_input_write(input, offset, seek, &chunk)
                .map_err(|_| ProtocolError::Invalid("write to dead stream".into()))?;

            // The sink pulls on its own clock; only the credit accounting
            // reacts immediately.
            core.request_bytes(input);
            return Ok(());
        }

        if let Some(upload) = self.uploads.get_mut(&channel) {
            let remaining = upload.expected.saturating_sub(upload.data.len());
            let take = remaining.min(chunk.length);
            upload.data.extend_from_slice(&chunk.data()[..take]);
            return Ok(());
        }

        Err(ProtocolError::Invalid(format!(
            "audio for unknown channel {}",
            channel
        )))
    }

    /// Dispatches one decoded command.
    pub fn handle_command(
        &mut self,
        core: &mut Core,
        seq: u32,
        command: Command,
    ) -> Result<Option<ServerAction>, ProtocolError> {
        debug!("conn {}: {:?}", self.id, command.tag());

        // Unauthorized connections may only authenticate and set their
        // name.
        if !self.authorized
            && !matches!(command, Command::Auth(_) | Command::SetClientName(_))
        {
            self.send_error(seq, ErrorCode::AccessDenied);
            return Ok(None);
        }

        match command {
            // The server routes the handshake commands before the generic
            // handler; they never arrive here.
            Command::Auth(_) | Command::SetClientName(_) => {
                self.send_error(seq, ErrorCode::Protocol);
            }

            Command::Exit => {
                core.quit_requested = true;
                self.send_ack(seq);
            }

            // --- Playback streams ---
            Command::CreatePlaybackStream(params) => {
                self.create_playback_stream(core, seq, params)
            }
            Command::DeletePlaybackStream(channel) => {
                match self.playback.remove(&channel) {
                    Some(input) => {
                        core.sink_input_unlink(input);
                        self.send_ack(seq);
                    }
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::DrainPlaybackStream(channel) => match self.playback.get(&channel) {
                Some(&input) => match core.sink_input_drain(input, seq) {
                    Ok(true) => self.send_ack(seq),
                    Ok(false) => {}
                    Err(e) => self.send_error(seq, map_core_error(e)),
                },
                None => self.send_error(seq, ErrorCode::NoEntity),
            },
            Command::CorkPlaybackStream(params) => {
                self.playback_control(core, seq, params.channel, |core, input| {
                    core.sink_input_cork(input, params.cork)
                })
            }
            Command::FlushPlaybackStream(channel) => {
                self.playback_control(core, seq, channel, |core, input| {
                    core.sink_input_flush(input)
                })
            }
            Command::TriggerPlaybackStream(channel) => {
                self.playback_control(core, seq, channel, |core, input| {
                    core.sink_input_trigger(input)
                })
            }
            Command::PrebufPlaybackStream(channel) => {
                self.playback_control(core, seq, channel, |core, input| {
                    core.sink_input_prebuf_force(input)
                })
            }
            Command::GetPlaybackLatency(params) => {
                self.playback_latency(core, seq, params.channel, params.now)
            }
            Command::SetPlaybackStreamName(params) => {
                match self.playback.get(&params.channel) {
                    Some(&input) => {
                        let name = cstring_lossy(params.name.as_ref());
                        match core.sink_input_set_name(input, &name) {
                            Ok(()) => self.send_ack(seq),
                            Err(e) => self.send_error(seq, map_core_error(e)),
                        }
                    }
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::SetPlaybackStreamBufferAttr(params) => {
                self.set_playback_buffer_attr(core, seq, params.channel, params.buffer_attr)
            }
            Command::UpdatePlaybackStreamSampleRate(params) => {
                match self.playback.get(&params.channel) {
                    Some(&input) => match core.sink_input_set_rate(input, params.rate) {
                        Ok(()) => self.send_ack(seq),
                        Err(e) => self.send_error(seq, map_core_error(e)),
                    },
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::UpdatePlaybackStreamProplist(params) => {
                match self.playback.get(&params.channel) {
                    Some(&input) => {
                        let result = core.sink_input_update_props(input, |props| {
                            props.update(params.mode, &params.props)
                        });
                        match result {
                            Ok(()) => self.send_ack(seq),
                            Err(e) => self.send_error(seq, map_core_error(e)),
                        }
                    }
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::RemovePlaybackStreamProplist(params) => {
                match self.playback.get(&params.channel) {
                    Some(&input) => {
                        let result = core.sink_input_update_props(input, |props| {
                            for key in &params.keys {
                                props.remove(key);
                            }
                        });
                        match result {
                            Ok(()) => self.send_ack(seq),
                            Err(e) => self.send_error(seq, map_core_error(e)),
                        }
                    }
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::MoveSinkInput(params) => {
                let target = core.resolve_sink(
                    params.device_index,
                    params.device_name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                match target {
                    Some(sink) => match core.move_sink_input(params.index, sink) {
                        Ok(()) => self.send_ack(seq),
                        Err(e) => self.send_error(seq, map_core_error(e)),
                    },
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }

            // --- Record streams ---
            Command::CreateRecordStream(params) => self.create_record_stream(core, seq, params),
            Command::DeleteRecordStream(channel) => match self.records.remove(&channel) {
                Some(output) => {
                    core.source_output_unlink(output);
                    self.send_ack(seq);
                }
                None => self.send_error(seq, ErrorCode::NoEntity),
            },
            Command::CorkRecordStream(params) => match self.records.get(&params.channel) {
                Some(&output) => match core.source_output_cork(output, params.cork) {
                    Ok(()) => self.send_ack(seq),
                    Err(e) => self.send_error(seq, map_core_error(e)),
                },
                None => self.send_error(seq, ErrorCode::NoEntity),
            },
            Command::FlushRecordStream(channel) => match self.records.get(&channel) {
                Some(&output) => {
                    if let Some(output) = core.source_outputs.get_mut(output) {
                        output.queue.flush_read();
                    }
                    self.send_ack(seq);
                }
                None => self.send_error(seq, ErrorCode::NoEntity),
            },
            Command::GetRecordLatency(params) => {
                self.record_latency(core, seq, params.channel, params.now)
            }
            Command::SetRecordStreamName(params) => match self.records.get(&params.channel) {
                Some(&output) => {
                    let name = cstring_lossy(params.name.as_ref());
                    match core.source_output_set_name(output, &name) {
                        Ok(()) => self.send_ack(seq),
                        Err(e) => self.send_error(seq, map_core_error(e)),
                    }
                }
                None => self.send_error(seq, ErrorCode::NoEntity),
            },
            Command::SetRecordStreamBufferAttr(params) => {
                self.set_record_buffer_attr(core, seq, params.channel, params.buffer_attr)
            }
            Command::UpdateRecordStreamSampleRate(params) => {
                match self.records.get(&params.channel) {
                    Some(&output) => match core.source_output_set_rate(output, params.rate) {
                        Ok(()) => self.send_ack(seq),
                        Err(e) => self.send_error(seq, map_core_error(e)),
                    },
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::UpdateRecordStreamProplist(params) => {
                match self.records.get(&params.channel) {
                    Some(&output) => {
                        let result = core.source_output_update_props(output, |props| {
                            props.update(params.mode, &params.props)
                        });
                        match result {
                            Ok(()) => self.send_ack(seq),
                            Err(e) => self.send_error(seq, map_core_error(e)),
                        }
                    }
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::RemoveRecordStreamProplist(params) => {
                match self.records.get(&params.channel) {
                    Some(&output) => {
                        let result = core.source_output_update_props(output, |props| {
                            for key in &params.keys {
                                props.remove(key);
                            }
                        });
                        match result {
                            Ok(()) => self.send_ack(seq),
                            Err(e) => self.send_error(seq, map_core_error(e)),
                        }
                    }
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::MoveSourceOutput(params) => {
                let target = core.resolve_source(
                    params.device_index,
                    params.device_name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                match target {
                    Some(source) => match core.move_source_output(params.index, source) {
                        Ok(()) => self.send_ack(seq),
                        Err(e) => self.send_error(seq, map_core_error(e)),
                    },
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }

            // --- Sample cache ---
            Command::CreateUploadStream(params) => self.create_upload_stream(seq, params),
            Command::DeleteUploadStream(channel) => {
                match self.uploads.remove(&channel) {
                    Some(_) => self.send_ack(seq),
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::FinishUploadStream(channel) => self.finish_upload_stream(core, seq, channel),
            Command::PlaySample(params) => {
                let sink = core.resolve_sink(
                    params.sink_index,
                    params.sink_name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                let name = cstring_lossy(params.name.as_ref());

                match sink {
                    Some(sink) => {
                        match core.play_sample(&name, sink, params.volume, params.props) {
                            Ok(_) => self.send_ack(seq),
                            Err(e) => self.send_error(seq, map_core_error(e)),
                        }
                    }
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::RemoveSample(name) => {
                match core.scache_remove(&name.to_string_lossy()) {
                    Ok(_) => self.send_ack(seq),
                    Err(e) => self.send_error(seq, map_core_error(e)),
                }
            }

            // --- Introspection ---
            Command::Stat => {
                let stat = core.stat();
                self.send_reply(seq, &stat);
            }
            Command::LookupSink(name) => {
                match core.resolve_sink(None, Some(&name.to_string_lossy())) {
                    Some(index) => self.send_reply(seq, &LookupReply { index }),
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::LookupSource(name) => {
                match core.resolve_source(None, Some(&name.to_string_lossy())) {
                    Some(index) => self.send_reply(seq, &LookupReply { index }),
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::GetServerInfo => {
                let info = server_info(core);
                self.send_reply(seq, &info);
            }
            Command::GetSinkInfo(params) => {
                let index = core.resolve_sink(
                    params.index,
                    params.name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                match index.and_then(|i| sink_info(core, i)) {
                    Some(info) => self.send_reply(seq, &info),
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::GetSinkInfoList => {
                let infos: Vec<SinkInfo> = core
                    .sinks
                    .indices()
                    .into_iter()
                    .filter_map(|i| sink_info(core, i))
                    .collect();
                self.send_reply(seq, &infos);
            }
            Command::GetSourceInfo(params) => {
                let index = core.resolve_source(
                    params.index,
                    params.name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                match index.and_then(|i| source_info(core, i)) {
                    Some(info) => self.send_reply(seq, &info),
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::GetSourceInfoList => {
                let infos: Vec<SourceInfo> = core
                    .sources
                    .indices()
                    .into_iter()
                    .filter_map(|i| source_info(core, i))
                    .collect();
                self.send_reply(seq, &infos);
            }
            Command::GetModuleInfo(index) => match module_info(core, index) {
                Some(info) => self.send_reply(seq, &info),
                None => self.send_error(seq, ErrorCode::NoEntity),
            },
            Command::GetModuleInfoList => {
                let infos: Vec<ModuleInfo> = core
                    .modules
                    .indices()
                    .into_iter()
                    .filter_map(|i| module_info(core, i))
                    .collect();
                self.send_reply(seq, &infos);
            }
            Command::GetClientInfo(index) => match client_info(core, index) {
                Some(info) => self.send_reply(seq, &info),
                None => self.send_error(seq, ErrorCode::NoEntity),
            },
            Command::GetClientInfoList => {
                let infos: Vec<ClientInfo> = core
                    .clients
                    .indices()
                    .into_iter()
                    .filter_map(|i| client_info(core, i))
                    .collect();
                self.send_reply(seq, &infos);
            }
            Command::GetSinkInputInfo(index) => match sink_input_info(core, index) {
                Some(info) => self.send_reply(seq, &info),
                None => self.send_error(seq, ErrorCode::NoEntity),
            },
            Command::GetSinkInputInfoList => {
                let infos: Vec<SinkInputInfo> = core
                    .sink_inputs
                    .indices()
                    .into_iter()
                    .filter_map(|i| sink_input_info(core, i))
                    .collect();
                self.send_reply(seq, &infos);
            }
            Command::GetSourceOutputInfo(index) => match source_output_info(core, index) {
                Some(info) => self.send_reply(seq, &info),
                None => self.send_error(seq, ErrorCode::NoEntity),
            },
            Command::GetSourceOutputInfoList => {
                let infos: Vec<SourceOutputInfo> = core
                    .source_outputs
                    .indices()
                    .into_iter()
                    .filter_map(|i| source_output_info(core, i))
                    .collect();
                self.send_reply(seq, &infos);
            }
            Command::GetSampleInfo(index) => match sample_info(core, index) {
                Some(info) => self.send_reply(seq, &info),
                None => self.send_error(seq, ErrorCode::NoEntity),
            },
            Command::GetSampleInfoList => {
                let infos: Vec<SampleInfo> = core
                    .scache
                    .iter()
                    .map(|s| s.index)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .filter_map(|i| sample_info(core, i))
                    .collect();
                self.send_reply(seq, &infos);
            }
            Command::Subscribe(mask) => {
                self.subscription = mask;
                self.send_ack(seq);
            }

            // --- Volume and mute ---
            Command::SetSinkVolume(params) => {
                let index = core.resolve_sink(
                    params.index,
                    params.name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                match index {
                    Some(i) => match core.sink_set_volume(i, params.cvolume) {
                        Ok(()) => self.send_ack(seq),
                        Err(e) => self.send_error(seq, map_core_error(e)),
                    },
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::SetSourceVolume(params) => {
                let index = core.resolve_source(
                    params.index,
                    params.name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                match index {
                    Some(i) => match core.source_set_volume(i, params.cvolume) {
                        Ok(()) => self.send_ack(seq),
                        Err(e) => self.send_error(seq, map_core_error(e)),
                    },
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::SetSinkInputVolume(params) => {
                match core.sink_input_set_volume(params.index, params.cvolume) {
                    Ok(()) => self.send_ack(seq),
                    Err(e) => self.send_error(seq, map_core_error(e)),
                }
            }
            Command::SetSinkMute(params) => {
                let index = core.resolve_sink(
                    params.index,
                    params.name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                match index {
                    Some(i) => match core.sink_set_mute(i, params.mute) {
                        Ok(()) => self.send_ack(seq),
                        Err(e) => self.send_error(seq, map_core_error(e)),
                    },
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::SetSourceMute(params) => {
                let index = core.resolve_source(
                    params.index,
                    params.name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                match index {
                    Some(i) => match core.source_set_mute(i, params.mute) {
                        Ok(()) => self.send_ack(seq),
                        Err(e) => self.send_error(seq, map_core_error(e)),
                    },
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::SetSinkInputMute(params) => {
                match core.sink_input_set_mute(params.index, params.mute) {
                    Ok(()) => self.send_ack(seq),
                    Err(e) => self.send_error(seq, map_core_error(e)),
                }
            }

            // --- Policy and administration ---
            Command::SetDefaultSink(name) => {
                let name = name.map(|n| n.to_string_lossy().into_owned());
                match core.set_default_sink(name.as_deref()) {
                    Ok(()) => self.send_ack(seq),
                    Err(e) => self.send_error(seq, map_core_error(e)),
                }
            }
            Command::SetDefaultSource(name) => {
                let name = name.map(|n| n.to_string_lossy().into_owned());
                match core.set_default_source(name.as_deref()) {
                    Ok(()) => self.send_ack(seq),
                    Err(e) => self.send_error(seq, map_core_error(e)),
                }
            }
            Command::KillClient(index) => {
                if core.clients.contains(index) {
                    return Ok(Some(ServerAction::KillClient {
                        seq,
                        client_index: index,
                    }));
                }
                self.send_error(seq, ErrorCode::NoEntity);
            }
            Command::KillSinkInput(index) => {
                if core.sink_inputs.contains(index) {
                    core.sink_input_kill(index);
                    self.send_ack(seq);
                } else {
                    self.send_error(seq, ErrorCode::NoEntity);
                }
            }
            Command::KillSourceOutput(index) => {
                if core.source_outputs.contains(index) {
                    core.source_output_kill(index);
                    self.send_ack(seq);
                } else {
                    self.send_error(seq, ErrorCode::NoEntity);
                }
            }
            Command::SuspendSink(params) => {
                let index = core.resolve_sink(
                    params.index,
                    params.name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                match index {
                    Some(i) => match core.sink_suspend(i, params.suspend) {
                        Ok(()) => self.send_ack(seq),
                        Err(e) => self.send_error(seq, map_core_error(e)),
                    },
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::SuspendSource(params) => {
                let index = core.resolve_source(
                    params.index,
                    params.name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                match index {
                    Some(i) => match core.source_suspend(i, params.suspend) {
                        Ok(()) => self.send_ack(seq),
                        Err(e) => self.send_error(seq, map_core_error(e)),
                    },
                    None => self.send_error(seq, ErrorCode::NoEntity),
                }
            }
            Command::LoadModule(params) => {
                return Ok(Some(ServerAction::LoadModule {
                    seq,
                    name: cstring_lossy(params.name.as_ref()),
                    argument: cstring_lossy(params.argument.as_ref()),
                }));
            }
            Command::UnloadModule(index) => match core.unload_module(index) {
                Ok(()) => self.send_ack(seq),
                Err(e) => self.send_error(seq, map_core_error(e)),
            },

            // --- Client metadata ---
            Command::UpdateClientProplist(params) => {
                let result = core.client_update_props(self.client_index, |props| {
                    props.update(params.mode, &params.props)
                });
                match result {
                    Ok(()) => self.send_ack(seq),
                    Err(e) => self.send_error(seq, map_core_error(e)),
                }
            }
            Command::RemoveClientProplist(params) => {
                let result = core.client_update_props(self.client_index, |props| {
                    for key in &params.keys {
                        props.remove(key);
                    }
                });
                match result {
                    Ok(()) => self.send_ack(seq),
                    Err(e) => self.send_error(seq, map_core_error(e)),
                }
            }

            // Server-to-client commands arriving inbound are nonsense.
            Command::Reply
            | Command::Request(_)
            | Command::Overflow(_)
            | Command::Underflow(_)
            | Command::Started(_)
            | Command::PlaybackStreamKilled(_)
            | Command::RecordStreamKilled(_)
            | Command::PlaybackStreamSuspended(_)
            | Command::RecordStreamSuspended(_)
            | Command::PlaybackStreamMoved(_)
            | Command::RecordStreamMoved(_)
            | Command::SubscribeEvent(_) => {
                self.send_error(seq, ErrorCode::Protocol);
            }

            Command::Unknown(raw) => {
                debug!("conn {}: unknown command id {}", self.id, raw);
                self.send_error(seq, ErrorCode::Command);
            }
            Command::Unsupported(tag) => {
                debug!("conn {}: unsupported command {:?}", self.id, tag);
                self.send_error(seq, ErrorCode::NotImplemented);
            }
        }

        Ok(None)
    }

    /// Handles the Auth handshake. Returns whether authentication
    /// succeeded.
    pub fn handle_auth(
        &mut self,
        seq: u32,
        params: &protocol::AuthParams,
        cookie_ok: bool,
    ) -> bool {
        if params.version < MIN_VERSION {
            warn!(
                "conn {}: protocol version {} too old",
                self.id, params.version
            );
            self.send_error(seq, ErrorCode::Version);
            return false;
        }

        if !cookie_ok {
            warn!("conn {}: denied access with invalid cookie", self.id);
            self.send_error(seq, ErrorCode::AccessDenied);
            return false;
        }

        self.authorized = true;
        self.version = params.version.min(MAX_VERSION);
        self.pdispatch.set_protocol_version(self.version);

        // SHM transfer is negotiated off; audio always travels inline.
        self.send_reply(
            seq,
            &protocol::AuthReply {
                version: MAX_VERSION,
                use_shm: false,
            },
        );

        true
    }

    /// Handles SetClientName, merging the metadata into the client entity.
    pub fn handle_set_client_name(
        &mut self,
        core: &mut Core,
        seq: u32,
        params: protocol::SetClientNameParams,
    ) {
        let _ = core.client_update_props(self.client_index, |props| {
            props.update(protocol::PropsUpdateMode::Replace, &params.props);
        });

        let reply = SetClientNameReply {
            client_index: self.client_index,
        };
        self.send_reply(seq, &reply);
    }

    fn playback_control(
        &mut self,
        core: &mut Core,
        seq: u32,
        channel: u32,
        op: impl FnOnce(&mut Core, u32) -> Result<(), CoreError>,
    ) {
        match self.playback.get(&channel) {
            Some(&input) => match op(core, input) {
                Ok(()) => self.send_ack(seq),
                Err(e) => self.send_error(seq, map_core_error(e)),
            },
            None => self.send_error(seq, ErrorCode::NoEntity),
        }
    }

    // === Stream creation ===

    fn create_playback_stream(
        &mut self,
        core: &mut Core,
        seq: u32,
        params: PlaybackStreamParams,
    ) {
        if !params.sample_spec.is_valid()
            || params.channel_map.num_channels() != params.sample_spec.channels
        {
            self.send_error(seq, ErrorCode::Invalid);
            return;
        }

        // Streams sharing a sync id are bound to the group's sink and
        // phase-aligned with its read position.
        let master = core.sync_group_master(self.id, params.sync_id);
        let sink = match master {
            Some(master_input) => {
                let master_sink = core.sink_inputs.get(master_input).map(|i| i.sink);
                let explicit = core.resolve_sink(
                    params.sink_index,
                    params.sink_name.as_deref().map(cstr_lossy_owned).as_deref(),
                );
                match (master_sink, explicit, params.sink_index.is_some() || params.sink_name.is_some()) {
                    (Some(ms), Some(ex), true) if ms != ex => {
                        self.send_error(seq, ErrorCode::Invalid);
                        return;
                    }
                    (Some(ms), _, _) => Some(ms),
                    (None, _, _) => None,
                }
            }
            None => core.resolve_sink(
                params.sink_index,
                params.sink_name.as_deref().map(cstr_lossy_owned).as_deref(),
            ),
        };

        let Some(sink) = sink else {
            self.send_error(seq, ErrorCode::NoEntity);
            return;
        };

        let spec = params.sample_spec;
        let mut attr = params.buffer_attr;
        let device_latency =
            fix_playback_buffer_attr(&mut attr, &spec, &params.flags, core.sink_latency_usec(sink));

        let start_index = master
            .and_then(|m| core.sink_inputs.get(m))
            .map(|i| i.queue.read_index())
            .unwrap_or(0);

        let silence = core.make_silence(
            &spec,
            (attr.minimum_request_length as usize).max(spec.frame_size()),
        );
        let queue = MemBlockQ::new(
            start_index,
            attr.max_length as usize,
            attr.target_length as usize,
            spec.frame_size(),
            attr.pre_buffering as usize,
            attr.minimum_request_length as usize,
            0,
            Some(silence),
        );

        let name = params
            .name
            .as_deref()
            .map(cstr_lossy_owned)
            .or_else(|| params.props.get_str(Prop::MediaName).map(str::to_string))
            .unwrap_or_else(|| "playback stream".to_string());

        let cvolume = params.cvolume;
        let input = match core.create_sink_input(
            &name,
            sink,
            spec,
            params.channel_map,
            cvolume,
            params.flags.start_muted,
            queue,
            params.sync_id,
            params.props,
        ) {
            Ok(input) => input,
            Err(e) => {
                self.send_error(seq, map_core_error(e));
                return;
            }
        };

        let channel = self.alloc_channel();
        {
            let entry = core.sink_inputs.get_mut(input).unwrap();
            entry.client = Some(self.client_index);
            entry.owner = Some(StreamOwner {
                connection: self.id,
                channel,
            });
            entry.no_move = params.flags.no_move;
            entry.variable_rate = params.flags.variable_rate;
        }

        core.sink_input_put(input, params.flags.start_corked);
        self.playback.insert(channel, input);

        // Grant the initial write credit immediately.
        let (missing, effective) = {
            let entry = core.sink_inputs.get_mut(input).unwrap();
            let missing = entry.queue.missing();
            entry.requested_bytes = missing;
            (
                missing,
                BufferAttr {
                    max_length: entry.queue.maxlength() as u32,
                    target_length: entry.queue.tlength() as u32,
                    pre_buffering: entry.queue.prebuf() as u32,
                    minimum_request_length: entry.queue.minreq() as u32,
                    fragment_size: u32::MAX,
                },
            )
        };

        let (sink_name, suspended) = core
            .sinks
            .get(sink)
            .map(|s| (s.name.clone(), s.state == DeviceState::Suspended))
            .unwrap_or_default();

        let reply = CreatePlaybackStreamReply {
            channel,
            sink_input_index: input,
            requested_bytes: missing as u32,
            buffer_attr: effective,
            sample_spec: spec,
            channel_map: params.channel_map,
            sink_index: sink,
            sink_name: CString::new(sink_name).ok(),
            suspended,
            stream_latency: device_latency,
        };

        debug!(
            "conn {}: created playback stream {} (sink input {})",
            self.id, channel, input
        );
        self.send_reply(seq, &reply);
    }

    fn create_record_stream(&mut self, core: &mut Core, seq: u32, params: RecordStreamParams) {
        if !params.sample_spec.is_valid()
            || params.channel_map.num_channels() != params.sample_spec.channels
        {
            self.send_error(seq, ErrorCode::Invalid);
            return;
        }

        // Direct-on-input streams tap a single playback stream; their
        // source is the owning sink's monitor.
        let direct_on_input = params.direct_on_input_index;
        let source = match direct_on_input {
            Some(input) => core
                .sink_inputs
                .get(input)
                .and_then(|i| core.sinks.get(i.sink))
                .map(|s| s.monitor_source),
            None => core.resolve_source(
                params.source_index,
                params.source_name.as_deref().map(cstr_lossy_owned).as_deref(),
            ),
        };

        let Some(source) = source else {
            self.send_error(seq, ErrorCode::NoEntity);
            return;
        };

        let spec = params.sample_spec;
        let mut attr = params.buffer_attr;
        fix_record_buffer_attr(&mut attr, &spec);

        let queue = MemBlockQ::new(
            0,
            attr.max_length as usize,
            attr.max_length as usize,
            spec.frame_size(),
            0,
            spec.frame_size(),
            0,
            None,
        );

        let name = params
            .name
            .as_deref()
            .map(cstr_lossy_owned)
            .or_else(|| params.props.get_str(Prop::MediaName).map(str::to_string))
            .unwrap_or_else(|| "record stream".to_string());

        let output = match core.create_source_output(
            &name,
            source,
            spec,
            params.channel_map,
            queue,
            attr.fragment_size as usize,
            params.props,
        ) {
            Ok(output) => output,
            Err(e) => {
                self.send_error(seq, map_core_error(e));
                return;
            }
        };

        let channel = self.alloc_channel();
        {
            let entry = core.source_outputs.get_mut(output).unwrap();
            entry.client = Some(self.client_index);
            entry.owner = Some(StreamOwner {
                connection: self.id,
                channel,
            });
            entry.no_move = params.flags.no_move || direct_on_input.is_some();
            entry.direct_on_input = direct_on_input;
        }

        core.source_output_put(output, params.flags.start_corked);
        self.records.insert(channel, output);

        let (source_name, suspended) = core
            .sources
            .get(source)
            .map(|s| (s.name.clone(), s.state == DeviceState::Suspended))
            .unwrap_or_default();

        let reply = CreateRecordStreamReply {
            channel,
            source_output_index: output,
            buffer_attr: BufferAttr {
                max_length: attr.max_length,
                fragment_size: attr.fragment_size,
                ..Default::default()
            },
            sample_spec: spec,
            channel_map: params.channel_map,
            source_index: source,
            source_name: CString::new(source_name).ok(),
            suspended,
            stream_latency: core.source_latency_usec(source),
        };

        debug!(
            "conn {}: created record stream {} (source output {})",
            self.id, channel, output
        );
        self.send_reply(seq, &reply);
    }

    fn create_upload_stream(&mut self, seq: u32, params: protocol::UploadStreamParams) {
        if !params.sample_spec.is_valid()
            || params.length == 0
            || params.length as usize > MAX_SAMPLE_BYTES
            || params.length as usize % params.sample_spec.frame_size() != 0
        {
            self.send_error(seq, ErrorCode::TooLarge);
            return;
        }

        let name = params
            .name
            .as_deref()
            .map(cstr_lossy_owned)
            .or_else(|| params.props.get_str(Prop::MediaName).map(str::to_string));
        let Some(name) = name else {
            self.send_error(seq, ErrorCode::Invalid);
            return;
        };

        let channel = self.alloc_channel();
        self.uploads.insert(
            channel,
            UploadStream {
                name,
                sample_spec: params.sample_spec,
                channel_map: params.channel_map,
                expected: params.length as usize,
                data: Vec::with_capacity(params.length as usize),
                props: params.props,
            },
        );

        self.send_reply(
            seq,
            &CreateUploadStreamReply {
                channel,
                length: params.length,
            },
        );
    }

    fn finish_upload_stream(&mut self, core: &mut Core, seq: u32, channel: u32) {
        let Some(upload) = self.uploads.remove(&channel) else {
            self.send_error(seq, ErrorCode::NoEntity);
            return;
        };

        if upload.data.len() != upload.expected {
            self.send_error(seq, ErrorCode::TooLarge);
            return;
        }

        let chunk = MemChunk::from_block(core.pool.adopt(upload.data));
        let channels = upload.sample_spec.channels as usize;
        core.scache_add(
            &upload.name,
            upload.sample_spec,
            upload.channel_map,
            ChannelVolume::norm(channels),
            chunk,
            upload.props,
        );

        self.send_ack(seq);
    }

    // === Latency and buffer metrics ===

    fn playback_latency(&mut self, core: &mut Core, seq: u32, channel: u32, now: SystemTime) {
        let Some(&input) = self.playback.get(&channel) else {
            self.send_error(seq, ErrorCode::NoEntity);
            return;
        };

        let Some(entry) = core.sink_inputs.get(input) else {
            self.send_error(seq, ErrorCode::NoEntity);
            return;
        };

        if entry.queue.write_index() == 0 && !entry.playing {
            self.send_error(seq, ErrorCode::NoData);
            return;
        }

        let reply = LatencyReply {
            device_usec: core.sink_latency_usec(entry.sink),
            monitor_usec: 0,
            playing: entry.playing,
            client_time: now,
            server_time: SystemTime::now(),
            write_index: entry.queue.write_index(),
            read_index: entry.queue.read_index(),
        };

        self.send_reply(seq, &reply);
    }

    fn record_latency(&mut self, core: &mut Core, seq: u32, channel: u32, now: SystemTime) {
        let Some(&output) = self.records.get(&channel) else {
            self.send_error(seq, ErrorCode::NoEntity);
            return;
        };

        let Some(entry) = core.source_outputs.get(output) else {
            self.send_error(seq, ErrorCode::NoEntity);
            return;
        };

        let reply = LatencyReply {
            device_usec: core.source_latency_usec(entry.source),
            monitor_usec: entry.latency_usec(),
            playing: entry.state == StreamState::Running,
            client_time: now,
            server_time: SystemTime::now(),
            write_index: entry.queue.write_index(),
            read_index: entry.queue.read_index(),
        };

        self.send_reply(seq, &reply);
    }

    fn set_playback_buffer_attr(
        &mut self,
        core: &mut Core,
        seq: u32,
        channel: u32,
        mut attr: BufferAttr,
    ) {
        let Some(&input) = self.playback.get(&channel) else {
            self.send_error(seq, ErrorCode::NoEntity);
            return;
        };

        let Some(entry) = core.sink_inputs.get_mut(input) else {
            self.send_error(seq, ErrorCode::NoEntity);
            return;
        };

        let spec = entry.sample_spec;
        fix_playback_buffer_attr(&mut attr, &spec, &StreamFlags::default(), 0);

        entry.queue.set_maxlength(attr.max_length as usize);
        entry.queue.set_tlength(attr.target_length as usize);
        entry.queue.set_prebuf(attr.pre_buffering as usize);
        entry.queue.set_minreq(attr.minimum_request_length as usize);

        let missing = entry.queue.missing();
        let reply = SetPlaybackBufferAttrReply {
            buffer_attr: BufferAttr {
                max_length: entry.queue.maxlength() as u32,
                target_length: entry.queue.tlength() as u32,
                pre_buffering: entry.queue.prebuf() as u32,
                minimum_request_length: entry.queue.minreq() as u32,
                fragment_size: u32::MAX,
            },
            missing: missing as u32,
        };

        self.send_reply(seq, &reply);
    }

    fn set_record_buffer_attr(
        &mut self,
        core: &mut Core,
        seq: u32,
        channel: u32,
        mut attr: BufferAttr,
    ) {
        let Some(&output) = self.records.get(&channel) else {
            self.send_error(seq, ErrorCode::NoEntity);
            return;
        };

        let Some(entry) = core.source_outputs.get_mut(output) else {
            self.send_error(seq, ErrorCode::NoEntity);
            return;
        };

        let spec = entry.sample_spec;
        fix_record_buffer_attr(&mut attr, &spec);

        entry.queue.set_maxlength(attr.max_length as usize);
        entry.fragment_size = attr.fragment_size as usize;

        let reply = SetRecordBufferAttrReply {
            buffer_attr: BufferAttr {
                max_length: entry.queue.maxlength() as u32,
                fragment_size: entry.fragment_size as u32,
                ..Default::default()
            },
        };

        self.send_reply(seq, &reply);
    }

    // === Notifications ===

    /// Translates one core notification into wire commands, updating local
    /// channel bookkeeping where streams went away.
    pub fn deliver_stream_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Request { channel, bytes } => {
                self.send_command(&Command::Request(Request {
                    channel: *channel,
                    length: *bytes,
                }));
            }
            StreamEvent::Overflow { channel } => {
                self.send_command(&Command::Overflow(*channel));
            }
            StreamEvent::Underflow { channel } => {
                self.send_command(&Command::Underflow(*channel));
            }
            StreamEvent::Started { channel } => {
                if self.version >= 13 {
                    self.send_command(&Command::Started(*channel));
                }
            }
            StreamEvent::PlaybackKilled { channel } => {
                self.playback.remove(channel);
                self.send_command(&Command::PlaybackStreamKilled(*channel));
            }
            StreamEvent::RecordKilled { channel } => {
                self.records.remove(channel);
                self.send_command(&Command::RecordStreamKilled(*channel));
            }
            StreamEvent::DrainDone { tag } => {
                self.send_ack(*tag);
            }
            StreamEvent::DrainFailed { tag } => {
                self.send_error(*tag, ErrorCode::NoEntity);
            }
            StreamEvent::Suspended {
                channel,
                playback,
                suspended,
            } => {
                if self.version >= 12 {
                    let params = StreamSuspendedParams {
                        channel: *channel,
                        suspended: *suspended,
                    };
                    self.send_command(&if *playback {
                        Command::PlaybackStreamSuspended(params)
                    } else {
                        Command::RecordStreamSuspended(params)
                    });
                }
            }
            StreamEvent::Moved {
                channel,
                playback,
                device_index,
                device_name,
                device_suspended,
            } => {
                if self.version >= 12 {
                    if *playback {
                        self.send_command(&Command::PlaybackStreamMoved(
                            PlaybackStreamMovedParams {
                                channel: *channel,
                                sink_index: *device_index,
                                sink_name: CString::new(device_name.clone()).ok(),
                                suspended: *device_suspended,
                            },
                        ));
                    } else {
                        self.send_command(&Command::RecordStreamMoved(RecordStreamMovedParams {
                            channel: *channel,
                            source_index: *device_index,
                            source_name: CString::new(device_name.clone()).ok(),
                            suspended: *device_suspended,
                        }));
                    }
                }
            }
        }
    }

    /// Forwards an entity change to a subscribed peer.
    pub fn deliver_subscription(&mut self, event: SubscriptionEvent) {
        if self.subscription.contains(event.facility.mask()) {
            self.send_command(&Command::SubscribeEvent(event));
        }
    }

    /// Ships the next pending record fragment, round-robin across this
    /// connection's record streams so none starves.
    pub fn pump_record(&mut self, core: &mut Core) {
        if self.records.is_empty() {
            return;
        }

        let channels: Vec<u32> = self.records.keys().copied().collect();
        let start = channels
            .iter()
            .position(|&c| c > self.record_cursor)
            .unwrap_or(0);

        for i in 0..channels.len() {
            let channel = channels[(start + i) % channels.len()];
            let output_index = self.records[&channel];

            let Some(output) = core.source_outputs.get_mut(output_index) else {
                continue;
            };

            if let Ok(mut chunk) = output.queue.peek() {
                chunk.truncate(output.fragment_size);
                let len = chunk.length;
                self.pstream
                    .send_memblock(channel, 0, SeekMode::Relative, &chunk);
                let _ = output.queue.drop_bytes(len);
                self.record_cursor = channel;
                return;
            }
        }
    }
}

fn map_core_error(e: CoreError) -> ErrorCode {
    match e {
        CoreError::NoEntity => ErrorCode::NoEntity,
        CoreError::Invalid => ErrorCode::Invalid,
        CoreError::NotSupported => ErrorCode::NotSupported,
        CoreError::Exist => ErrorCode::Exist,
    }
}

fn cstring_lossy(s: Option<&CString>) -> String {
    s.map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

fn cstr_lossy_owned(s: &std::ffi::CStr) -> String {
    s.to_string_lossy().into_owned()
}

// === Introspection builders ===

fn cstring(s: &str) -> Option<CString> {
    CString::new(s).ok()
}

fn server_info(core: &Core) -> ServerInfo {
    ServerInfo {
        server_name: cstring("sonord"),
        server_version: cstring(env!("CARGO_PKG_VERSION")),
        user_name: std::env::var("USER").ok().as_deref().and_then(cstring),
        host_name: std::env::var("HOSTNAME").ok().as_deref().and_then(cstring),
        sample_spec: core.default_spec,
        default_sink_name: core.default_sink_name().and_then(cstring),
        default_source_name: core.default_source_name().and_then(cstring),
        cookie: 0,
    }
}

fn sink_info(core: &Core, index: u32) -> Option<SinkInfo> {
    let sink = core.sinks.get(index)?;
    let monitor_name = core
        .sources
        .get(sink.monitor_source)
        .map(|s| s.name.clone())
        .unwrap_or_default();

    Some(SinkInfo {
        index,
        name: cstring(&sink.name),
        description: cstring(&sink.description),
        sample_spec: sink.sample_spec,
        channel_map: sink.channel_map,
        owner_module: sink.owner_module,
        cvolume: sink.cvolume,
        muted: sink.muted,
        monitor_source_index: sink.monitor_source,
        monitor_source_name: cstring(&monitor_name),
        latency_usec: core.sink_latency_usec(index),
        driver: cstring(sink.driver),
        props: sink.props.clone(),
    })
}

fn source_info(core: &Core, index: u32) -> Option<SourceInfo> {
    let source = core.sources.get(index)?;
    let monitor_of_name = source
        .monitor_of
        .and_then(|s| core.sinks.get(s))
        .map(|s| s.name.clone());

    Some(SourceInfo {
        index,
        name: cstring(&source.name),
        description: cstring(&source.description),
        sample_spec: source.sample_spec,
        channel_map: source.channel_map,
        owner_module: source.owner_module,
        cvolume: source.cvolume,
        muted: source.muted,
        monitor_of_sink_index: source.monitor_of,
        monitor_of_sink_name: monitor_of_name.as_deref().and_then(cstring),
        latency_usec: core.source_latency_usec(index),
        driver: cstring(source.driver),
        props: source.props.clone(),
    })
}

fn module_info(core: &Core, index: u32) -> Option<ModuleInfo> {
    let module = core.modules.get(index)?;

    Some(ModuleInfo {
        index,
        name: cstring(&module.name),
        argument: cstring(&module.argument),
        n_used: None,
        auto_unload: false,
    })
}

fn client_info(core: &Core, index: u32) -> Option<ClientInfo> {
    let client = core.clients.get(index)?;
    let name = client.props.get_str(Prop::ApplicationName).unwrap_or("");

    Some(ClientInfo {
        index,
        name: cstring(name),
        owner_module: None,
        driver: cstring(client.driver),
        props: client.props.clone(),
    })
}

fn sink_input_info(core: &Core, index: u32) -> Option<SinkInputInfo> {
    let input = core.sink_inputs.get(index)?;

    Some(SinkInputInfo {
        index,
        name: cstring(&input.name),
        owner_module: input.owner_module,
        client_index: input.client,
        sink_index: input.sink,
        sample_spec: input.sample_spec,
        channel_map: input.channel_map,
        cvolume: input.cvolume,
        buffer_usec: input.latency_usec(),
        sink_usec: core.sink_latency_usec(input.sink),
        resample_method: input.resample_method().and_then(cstring),
        driver: cstring("native"),
        muted: input.muted,
        props: input.props.clone(),
    })
}

fn source_output_info(core: &Core, index: u32) -> Option<SourceOutputInfo> {
    let output = core.source_outputs.get(index)?;

    Some(SourceOutputInfo {
        index,
        name: cstring(&output.name),
        owner_module: output.owner_module,
        client_index: output.client,
        source_index: output.source,
        sample_spec: output.sample_spec,
        channel_map: output.channel_map,
        buffer_usec: output.latency_usec(),
        source_usec: core.source_latency_usec(output.source),
        resample_method: output.resample_method().and_then(cstring),
        driver: cstring("native"),
        props: output.props.clone(),
    })
}

fn sample_info(core: &Core, index: u32) -> Option<SampleInfo> {
    let sample = core.scache.get(index)?;

    Some(SampleInfo {
        index,
        name: cstring(&sample.name),
        cvolume: sample.cvolume,
        duration_usec: sample.duration_usec(),
        sample_spec: sample.sample_spec,
        channel_map: sample.channel_map,
        bytes: sample.chunk.length as u32,
        lazy: false,
        filename: None,
        props: sample.props.clone(),
    })
}

/// Adapts requested playback buffer metrics to what the device can do,
/// returning the configured device latency in microseconds.
pub fn fix_playback_buffer_attr(
    attr: &mut BufferAttr,
    spec: &SampleSpec,
    flags: &StreamFlags,
    sink_latency_usec: u64,
) -> u64 {
    let frame = spec.frame_size() as u32;

    if attr.max_length == u32::MAX || attr.max_length as usize > MAX_QUEUE_LENGTH {
        attr.max_length = MAX_QUEUE_LENGTH as u32;
    }
    attr.max_length = attr.max_length.max(frame);

    if attr.target_length == u32::MAX {
        attr.target_length =
            spec.usec_to_bytes_round_up(DEFAULT_TLENGTH_MSEC * 1000) as u32;
    }
    attr.target_length = attr.target_length.clamp(frame, attr.max_length);

    if attr.minimum_request_length == u32::MAX {
        attr.minimum_request_length =
            spec.usec_to_bytes_round_up(DEFAULT_PROCESS_MSEC * 1000) as u32;
    }
    attr.minimum_request_length = attr.minimum_request_length.max(frame).div_ceil(frame) * frame;

    if attr.target_length < attr.minimum_request_length + frame {
        attr.target_length = attr.minimum_request_length + frame;
    }

    let tlength_usec = spec.bytes_to_usec(attr.target_length as usize);
    let minreq_usec = spec.bytes_to_usec(attr.minimum_request_length as usize);

    let device_usec = if flags.early_requests {
        // Fragment emulation: the device consumes in minreq-sized bites.
        minreq_usec
    } else if flags.adjust_latency {
        // Split the requested overall latency between the device and the
        // per-stream queue.
        (tlength_usec.saturating_sub(2 * minreq_usec)) / 2
    } else {
        tlength_usec.saturating_sub(2 * minreq_usec)
    };

    let device_usec = device_usec.max(sink_latency_usec.min(tlength_usec));

    // The queue must cover the device buffer plus two request periods.
    let floor = spec.usec_to_bytes_round_up(device_usec) as u32
        + 2 * attr.minimum_request_length;
    if attr.target_length < floor {
        attr.target_length = floor.min(attr.max_length);
    }

    if attr.pre_buffering == u32::MAX || attr.pre_buffering > attr.target_length {
        attr.pre_buffering = attr.target_length;
    }

    device_usec
}

/// Adapts requested record buffer metrics.
pub fn fix_record_buffer_attr(attr: &mut BufferAttr, spec: &SampleSpec) {
    let frame = spec.frame_size() as u32;

    if attr.max_length == u32::MAX || attr.max_length as usize > MAX_QUEUE_LENGTH {
        attr.max_length = MAX_QUEUE_LENGTH as u32;
    }
    attr.max_length = attr.max_length.max(frame);

    if attr.fragment_size == u32::MAX {
        attr.fragment_size = spec.usec_to_bytes_round_up(DEFAULT_PROCESS_MSEC * 1000) as u32;
    }

    attr.fragment_size -= attr.fragment_size % frame;
    attr.fragment_size = attr.fragment_size.clamp(frame, attr.max_length);
}

#[cfg(test)]
mod tests {
    use crate::protocol::SampleFormat;

    use super::*;

    fn spec() -> SampleSpec {
        SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        }
    }

    #[test]
    fn playback_attr_defaults() {
        let mut attr = BufferAttr::default();
        fix_playback_buffer_attr(&mut attr, &spec(), &StreamFlags::default(), 0);

        assert_eq!(attr.max_length as usize, MAX_QUEUE_LENGTH);
        assert_eq!(attr.target_length as usize % spec().frame_size(), 0);
        assert!(attr.pre_buffering <= attr.target_length);
        assert!(attr.minimum_request_length > 0);
    }

    #[test]
    fn playback_attr_keeps_explicit_values() {
        let mut attr = BufferAttr {
            max_length: 65536,
            target_length: 16384,
            pre_buffering: 8192,
            minimum_request_length: 1024,
            fragment_size: u32::MAX,
        };
        fix_playback_buffer_attr(&mut attr, &spec(), &StreamFlags::default(), 0);

        assert_eq!(attr.max_length, 65536);
        assert_eq!(attr.target_length, 16384);
        assert_eq!(attr.pre_buffering, 8192);
        assert_eq!(attr.minimum_request_length, 1024);
    }

    #[test]
    fn early_requests_pin_device_latency_to_minreq() {
        let mut attr = BufferAttr {
            max_length: 65536,
            target_length: 16384,
            pre_buffering: 8192,
            minimum_request_length: 1024,
            fragment_size: u32::MAX,
        };
        let flags = StreamFlags {
            early_requests: true,
            ..Default::default()
        };

        let device = fix_playback_buffer_attr(&mut attr, &spec(), &flags, 0);
        assert_eq!(device, spec().bytes_to_usec(1024));
    }

    #[test]
    fn adjust_latency_splits_target() {
        let mut attr = BufferAttr {
            max_length: 1 << 20,
            target_length: 32768,
            pre_buffering: u32::MAX,
            minimum_request_length: 2048,
            fragment_size: u32::MAX,
        };
        let flags = StreamFlags {
            adjust_latency: true,
            ..Default::default()
        };

        let device = fix_playback_buffer_attr(&mut attr, &spec(), &flags, 0);
        let expected =
            (spec().bytes_to_usec(32768) - 2 * spec().bytes_to_usec(2048)) / 2;
        assert_eq!(device, expected);
    }

    #[test]
    fn record_attr_fragment_rounding() {
        let mut attr = BufferAttr {
            max_length: 65536,
            fragment_size: 1001,
            ..Default::default()
        };
        fix_record_buffer_attr(&mut attr, &spec());

        assert_eq!(attr.fragment_size as usize % spec().frame_size(), 0);
        assert!(attr.fragment_size > 0);
    }
}
