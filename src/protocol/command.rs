//! Commands are the top-level IPC structure of the protocol.

use std::ffi::CString;
use std::io::{BufRead, Write};

mod auth;
mod client_info;
mod lookup;
mod module_info;
mod move_stream;
mod playback_stream;
mod record_stream;
mod sample;
mod sample_info;
mod server_info;
mod set_client_name;
mod sink_info;
mod sink_input_info;
mod source_info;
mod source_output_info;
mod stat;
mod stream_events;
mod subscribe;
mod suspend;
mod timing_info;
mod update_stream;
mod volume;

pub use auth::*;
pub use client_info::*;
pub use lookup::*;
pub use module_info::*;
pub use move_stream::*;
pub use playback_stream::*;
pub use record_stream::*;
pub use sample::*;
pub use sample_info::*;
pub use server_info::*;
pub use set_client_name::*;
pub use sink_info::*;
pub use sink_input_info::*;
pub use source_info::*;
pub use source_output_info::*;
pub use stat::*;
pub use stream_events::*;
pub use subscribe::*;
pub use suspend::*;
pub use timing_info::*;
pub use update_stream::*;
pub use volume::*;

use super::{serde::*, ProtocolError};

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive as _;

/// The numeric id of each command. Ids are stable; new protocol versions
/// append, never renumber.
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum CommandTag {
    /* Generic commands */
    Error = 0,
    Timeout = 1, /* pseudo command */
    Reply = 2,

    /* CLIENT -> SERVER */
    CreatePlaybackStream = 3, /* Payload changed in v9, v12, v13 */
    DeletePlaybackStream = 4,
    CreateRecordStream = 5, /* Payload changed in v9, v12, v13 */
    DeleteRecordStream = 6,
    Exit = 7,
    Auth = 8,
    SetClientName = 9,
    LookupSink = 10,
    LookupSource = 11,
    DrainPlaybackStream = 12,
    Stat = 13,
    GetPlaybackLatency = 14,
    CreateUploadStream = 15,
    DeleteUploadStream = 16,
    FinishUploadStream = 17,
    PlaySample = 18,
    RemoveSample = 19,

    GetServerInfo = 20,
    GetSinkInfo = 21,
    GetSinkInfoList = 22,
    GetSourceInfo = 23,
    GetSourceInfoList = 24,
    GetModuleInfo = 25,
    GetModuleInfoList = 26,
    GetClientInfo = 27,
    GetClientInfoList = 28,
    GetSinkInputInfo = 29,
    GetSinkInputInfoList = 30,
    GetSourceOutputInfo = 31,
    GetSourceOutputInfoList = 32,
    GetSampleInfo = 33,
    GetSampleInfoList = 34,
    Subscribe = 35,

    SetSinkVolume = 36,
    SetSinkInputVolume = 37,
    SetSourceVolume = 38,

    SetSinkMute = 39,
    SetSourceMute = 40,

    CorkPlaybackStream = 41,
    FlushPlaybackStream = 42,
    TriggerPlaybackStream = 43,

    SetDefaultSink = 44,
    SetDefaultSource = 45,

    SetPlaybackStreamName = 46,
    SetRecordStreamName = 47,

    KillClient = 48,
    KillSinkInput = 49,
    KillSourceOutput = 50,

    LoadModule = 51,
    UnloadModule = 52,

    /* Obsolete */
    AddAutoloadObsolete = 53,
    RemoveAutoloadObsolete = 54,
    GetAutoloadInfoObsolete = 55,
    GetAutoloadInfoListObsolete = 56,

    GetRecordLatency = 57,
    CorkRecordStream = 58,
    FlushRecordStream = 59,
    PrebufPlaybackStream = 60,

    /* SERVER -> CLIENT */
    Request = 61,
    Overflow = 62,
    Underflow = 63,
    PlaybackStreamKilled = 64,
    RecordStreamKilled = 65,
    SubscribeEvent = 66,

    /* Supported since protocol v10 */
    MoveSinkInput = 67,
    MoveSourceOutput = 68,

    /* Supported since protocol v11 */
    SetSinkInputMute = 69,

    SuspendSink = 70,
    SuspendSource = 71,

    /* Supported since protocol v12 */
    SetPlaybackStreamBufferAttr = 72,
    SetRecordStreamBufferAttr = 73,

    UpdatePlaybackStreamSampleRate = 74,
    UpdateRecordStreamSampleRate = 75,

    /* SERVER -> CLIENT */
    PlaybackStreamSuspended = 76,
    RecordStreamSuspended = 77,
    PlaybackStreamMoved = 78,
    RecordStreamMoved = 79,

    /* Supported since protocol v13 */
    UpdateRecordStreamProplist = 80,
    UpdatePlaybackStreamProplist = 81,
    UpdateClientProplist = 82,
    RemoveRecordStreamProplist = 83,
    RemovePlaybackStreamProplist = 84,
    RemoveClientProplist = 85,

    /* SERVER -> CLIENT */
    Started = 86,
}

impl TagStructRead for CommandTag {
    fn read(r: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        let v = r.read_u32()?;

        CommandTag::from_u32(v)
            .ok_or_else(|| ProtocolError::Invalid(format!("invalid command tag: {}", v)))
    }
}

impl TagStructWrite for CommandTag {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(*self as u32)?;

        Ok(())
    }
}

/// A marker trait for reply data.
pub trait CommandReply: TagStructRead + TagStructWrite {}

impl<T: TagStructRead> TagStructRead for Vec<T> {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        let mut items = Vec::new();
        while ts.has_data_left()? {
            items.push(ts.read()?);
        }

        Ok(items)
    }
}

impl<T: TagStructWrite> TagStructWrite for Vec<T> {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        for item in self {
            w.write(item)?;
        }

        Ok(())
    }
}

impl<T: TagStructRead + TagStructWrite> CommandReply for Vec<T> {}

/// A parsed command message.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum Command {
    /// A reply to some other command. The payload is command-specific and
    /// has yet to be read.
    Reply,

    /// Authentication request (and protocol handshake).
    Auth(AuthParams),

    /// Updates client properties (not just the name).
    SetClientName(SetClientNameParams),

    /// Stream management.
    CreatePlaybackStream(PlaybackStreamParams),
    DeletePlaybackStream(u32),
    CreateRecordStream(RecordStreamParams),
    DeleteRecordStream(u32),
    DrainPlaybackStream(u32),
    GetPlaybackLatency(LatencyParams),
    GetRecordLatency(LatencyParams),

    /// Stream control.
    CorkPlaybackStream(CorkStreamParams),
    FlushPlaybackStream(u32),
    TriggerPlaybackStream(u32),
    PrebufPlaybackStream(u32),
    CorkRecordStream(CorkStreamParams),
    FlushRecordStream(u32),
    MoveSinkInput(MoveStreamParams),
    MoveSourceOutput(MoveStreamParams),
    SetPlaybackStreamBufferAttr(SetStreamBufferAttrParams),
    SetRecordStreamBufferAttr(SetStreamBufferAttrParams),
    UpdatePlaybackStreamSampleRate(UpdateSampleRateParams),
    UpdateRecordStreamSampleRate(UpdateSampleRateParams),
    SetPlaybackStreamName(SetStreamNameParams),
    SetRecordStreamName(SetStreamNameParams),

    /// The sample cache.
    CreateUploadStream(UploadStreamParams),
    DeleteUploadStream(u32),
    FinishUploadStream(u32),
    PlaySample(PlaySampleParams),
    RemoveSample(CString),

    /// Introspection.
    Stat,
    LookupSink(CString),
    LookupSource(CString),
    GetServerInfo,
    GetSinkInfo(GetDeviceInfoParams),
    GetSinkInfoList,
    GetSourceInfo(GetDeviceInfoParams),
    GetSourceInfoList,
    GetModuleInfo(u32),
    GetModuleInfoList,
    GetClientInfo(u32),
    GetClientInfoList,
    GetSinkInputInfo(u32),
    GetSinkInputInfoList,
    GetSourceOutputInfo(u32),
    GetSourceOutputInfoList,
    GetSampleInfo(u32),
    GetSampleInfoList,
    Subscribe(SubscriptionMask),

    /// Volume control.
    SetSinkVolume(SetDeviceVolumeParams),
    SetSourceVolume(SetDeviceVolumeParams),
    SetSinkInputVolume(SetStreamVolumeParams),
    SetSinkMute(SetDeviceMuteParams),
    SetSourceMute(SetDeviceMuteParams),
    SetSinkInputMute(SetStreamMuteParams),

    /// Policy and administration.
    SetDefaultSink(Option<CString>),
    SetDefaultSource(Option<CString>),
    KillClient(u32),
    KillSinkInput(u32),
    KillSourceOutput(u32),
    SuspendSink(SuspendParams),
    SuspendSource(SuspendParams),
    LoadModule(LoadModuleParams),
    UnloadModule(u32),
    Exit,

    /// Metadata updates.
    UpdateClientProplist(UpdateClientProplistParams),
    UpdatePlaybackStreamProplist(UpdateStreamProplistParams),
    UpdateRecordStreamProplist(UpdateStreamProplistParams),
    RemoveClientProplist(RemoveClientProplistParams),
    RemovePlaybackStreamProplist(RemoveStreamProplistParams),
    RemoveRecordStreamProplist(RemoveStreamProplistParams),

    /// Server-initiated notifications.
    Request(Request),
    Overflow(u32),
    Underflow(u32),
    Started(u32),
    PlaybackStreamKilled(u32),
    RecordStreamKilled(u32),
    PlaybackStreamSuspended(StreamSuspendedParams),
    RecordStreamSuspended(StreamSuspendedParams),
    PlaybackStreamMoved(PlaybackStreamMovedParams),
    RecordStreamMoved(RecordStreamMovedParams),
    SubscribeEvent(SubscriptionEvent),

    /// A command id outside the catalog. Servers answer this with
    /// [`crate::protocol::ErrorCode::Command`].
    Unknown(u32),

    /// A catalog command this library does not process. Servers answer this
    /// with [`crate::protocol::ErrorCode::NotImplemented`].
    Unsupported(CommandTag),
}

impl Command {
    /// Reads a `(command, tag)`-prefixed message.
    ///
    /// Messages with ids outside the catalog parse as [`Command::Unknown`],
    /// and catalog commands with no parser as [`Command::Unsupported`], so
    /// that a server can reject either without tearing down the connection.
    pub fn read_tag_prefixed<R: BufRead>(
        r: &mut R,
        protocol_version: u16,
    ) -> Result<(u32, Self), ProtocolError> {
        let mut ts = TagStructReader::new(r, protocol_version);
        let (raw, seq) = (ts.read_u32()?, ts.read_u32()?);

        let command = match CommandTag::from_u32(raw) {
            Some(tag) => tag,
            None => return Ok((seq, Command::Unknown(raw))),
        };

        let cmd = match command {
            CommandTag::Error => Err(ProtocolError::ServerError(ts.read_enum()?)),
            CommandTag::Timeout => Err(ProtocolError::Timeout),
            CommandTag::Reply => Ok(Command::Reply),

            CommandTag::Auth => Ok(Command::Auth(ts.read()?)),
            CommandTag::SetClientName => Ok(Command::SetClientName(ts.read()?)),
            CommandTag::Exit => Ok(Command::Exit),

            CommandTag::CreatePlaybackStream => Ok(Command::CreatePlaybackStream(ts.read()?)),
            CommandTag::DeletePlaybackStream => Ok(Command::DeletePlaybackStream(ts.read_u32()?)),
            CommandTag::CreateRecordStream => Ok(Command::CreateRecordStream(ts.read()?)),
            CommandTag::DeleteRecordStream => Ok(Command::DeleteRecordStream(ts.read_u32()?)),
            CommandTag::DrainPlaybackStream => Ok(Command::DrainPlaybackStream(ts.read_u32()?)),
            CommandTag::GetPlaybackLatency => Ok(Command::GetPlaybackLatency(ts.read()?)),
            CommandTag::GetRecordLatency => Ok(Command::GetRecordLatency(ts.read()?)),

            CommandTag::CorkPlaybackStream => Ok(Command::CorkPlaybackStream(ts.read()?)),
            CommandTag::FlushPlaybackStream => Ok(Command::FlushPlaybackStream(ts.read_u32()?)),
            CommandTag::TriggerPlaybackStream => {
                Ok(Command::TriggerPlaybackStream(ts.read_u32()?))
            }
            CommandTag::PrebufPlaybackStream => Ok(Command::PrebufPlaybackStream(ts.read_u32()?)),
            CommandTag::CorkRecordStream => Ok(Command::CorkRecordStream(ts.read()?)),
            CommandTag::FlushRecordStream => Ok(Command::FlushRecordStream(ts.read_u32()?)),
            CommandTag::MoveSinkInput => Ok(Command::MoveSinkInput(ts.read()?)),
            CommandTag::MoveSourceOutput => Ok(Command::MoveSourceOutput(ts.read()?)),
            CommandTag::SetPlaybackStreamBufferAttr => Ok(Command::SetPlaybackStreamBufferAttr(
                SetStreamBufferAttrParams::read_playback(&mut ts, protocol_version)?,
            )),
            CommandTag::SetRecordStreamBufferAttr => Ok(Command::SetRecordStreamBufferAttr(
                SetStreamBufferAttrParams::read_record(&mut ts, protocol_version)?,
            )),
            CommandTag::UpdatePlaybackStreamSampleRate => {
                Ok(Command::UpdatePlaybackStreamSampleRate(ts.read()?))
            }
            CommandTag::UpdateRecordStreamSampleRate => {
                Ok(Command::UpdateRecordStreamSampleRate(ts.read()?))
            }
            CommandTag::SetPlaybackStreamName => Ok(Command::SetPlaybackStreamName(ts.read()?)),
            CommandTag::SetRecordStreamName => Ok(Command::SetRecordStreamName(ts.read()?)),

            CommandTag::CreateUploadStream => Ok(Command::CreateUploadStream(ts.read()?)),
            CommandTag::DeleteUploadStream => Ok(Command::DeleteUploadStream(ts.read_u32()?)),
            CommandTag::FinishUploadStream => Ok(Command::FinishUploadStream(ts.read_u32()?)),
            CommandTag::PlaySample => Ok(Command::PlaySample(ts.read()?)),
            CommandTag::RemoveSample => Ok(Command::RemoveSample(ts.read_string_non_null()?)),

            CommandTag::Stat => Ok(Command::Stat),
            CommandTag::LookupSink => Ok(Command::LookupSink(ts.read_string_non_null()?)),
            CommandTag::LookupSource => Ok(Command::LookupSource(ts.read_string_non_null()?)),
            CommandTag::GetServerInfo => Ok(Command::GetServerInfo),
            CommandTag::GetSinkInfo => Ok(Command::GetSinkInfo(ts.read()?)),
            CommandTag::GetSinkInfoList => Ok(Command::GetSinkInfoList),
            CommandTag::GetSourceInfo => Ok(Command::GetSourceInfo(ts.read()?)),
            CommandTag::GetSourceInfoList => Ok(Command::GetSourceInfoList),
            CommandTag::GetModuleInfo => Ok(Command::GetModuleInfo(ts.read_u32()?)),
            CommandTag::GetModuleInfoList => Ok(Command::GetModuleInfoList),
            CommandTag::GetClientInfo => Ok(Command::GetClientInfo(ts.read_u32()?)),
            CommandTag::GetClientInfoList => Ok(Command::GetClientInfoList),
            CommandTag::GetSinkInputInfo => Ok(Command::GetSinkInputInfo(ts.read_u32()?)),
            CommandTag::GetSinkInputInfoList => Ok(Command::GetSinkInputInfoList),
            CommandTag::GetSourceOutputInfo => Ok(Command::GetSourceOutputInfo(ts.read_u32()?)),
            CommandTag::GetSourceOutputInfoList => Ok(Command::GetSourceOutputInfoList),
            CommandTag::GetSampleInfo => Ok(Command::GetSampleInfo(ts.read_u32()?)),
            CommandTag::GetSampleInfoList => Ok(Command::GetSampleInfoList),
            CommandTag::Subscribe => Ok(Command::Subscribe(ts.read()?)),

            CommandTag::SetSinkVolume => Ok(Command::SetSinkVolume(ts.read()?)),
            CommandTag::SetSourceVolume => Ok(Command::SetSourceVolume(ts.read()?)),
            CommandTag::SetSinkInputVolume => Ok(Command::SetSinkInputVolume(ts.read()?)),
            CommandTag::SetSinkMute => Ok(Command::SetSinkMute(ts.read()?)),
            CommandTag::SetSourceMute => Ok(Command::SetSourceMute(ts.read()?)),
            CommandTag::SetSinkInputMute => Ok(Command::SetSinkInputMute(ts.read()?)),

            CommandTag::SetDefaultSink => Ok(Command::SetDefaultSink(ts.read_string()?)),
            CommandTag::SetDefaultSource => Ok(Command::SetDefaultSource(ts.read_string()?)),
            CommandTag::KillClient => Ok(Command::KillClient(ts.read_u32()?)),
            CommandTag::KillSinkInput => Ok(Command::KillSinkInput(ts.read_u32()?)),
            CommandTag::KillSourceOutput => Ok(Command::KillSourceOutput(ts.read_u32()?)),
            CommandTag::SuspendSink => Ok(Command::SuspendSink(ts.read()?)),
            CommandTag::SuspendSource => Ok(Command::SuspendSource(ts.read()?)),
            CommandTag::LoadModule => Ok(Command::LoadModule(ts.read()?)),
            CommandTag::UnloadModule => Ok(Command::UnloadModule(ts.read_u32()?)),

            CommandTag::UpdateClientProplist => Ok(Command::UpdateClientProplist(ts.read()?)),
            CommandTag::UpdatePlaybackStreamProplist => {
                Ok(Command::UpdatePlaybackStreamProplist(ts.read()?))
            }
            CommandTag::UpdateRecordStreamProplist => {
                Ok(Command::UpdateRecordStreamProplist(ts.read()?))
            }
            CommandTag::RemoveClientProplist => Ok(Command::RemoveClientProplist(ts.read()?)),
            CommandTag::RemovePlaybackStreamProplist => {
                Ok(Command::RemovePlaybackStreamProplist(ts.read()?))
            }
            CommandTag::RemoveRecordStreamProplist => {
                Ok(Command::RemoveRecordStreamProplist(ts.read()?))
            }

            CommandTag::Request => Ok(Command::Request(ts.read()?)),
            CommandTag::Overflow => Ok(Command::Overflow(ts.read_u32()?)),
            CommandTag::Underflow => Ok(Command::Underflow(ts.read_u32()?)),
            CommandTag::Started => Ok(Command::Started(ts.read_u32()?)),
            CommandTag::PlaybackStreamKilled => Ok(Command::PlaybackStreamKilled(ts.read_u32()?)),
            CommandTag::RecordStreamKilled => Ok(Command::RecordStreamKilled(ts.read_u32()?)),
            CommandTag::PlaybackStreamSuspended => {
                Ok(Command::PlaybackStreamSuspended(ts.read()?))
            }
            CommandTag::RecordStreamSuspended => Ok(Command::RecordStreamSuspended(ts.read()?)),
            CommandTag::PlaybackStreamMoved => Ok(Command::PlaybackStreamMoved(ts.read()?)),
            CommandTag::RecordStreamMoved => Ok(Command::RecordStreamMoved(ts.read()?)),
            CommandTag::SubscribeEvent => Ok(Command::SubscribeEvent(ts.read()?)),

            other => Ok(Command::Unsupported(other)),
        }?;

        Ok((seq, cmd))
    }

    /// Writes the command with the `(command, tag)` prefix.
    pub fn write_tag_prefixed<W: Write>(
        &self,
        seq: u32,
        w: &mut W,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        let tag = match self {
            Command::Unknown(raw) => {
                return Err(ProtocolError::Invalid(format!(
                    "cannot serialize unknown command {}",
                    raw
                )))
            }
            Command::Unsupported(tag) => return Err(ProtocolError::Unimplemented(*tag)),
            _ => self.tag(),
        };

        let mut ts = TagStructWriter::new(w, protocol_version);
        ts.write_u32(tag as u32)?;
        ts.write_u32(seq)?;
        ts.write(self)?;

        Ok(())
    }

    /// The command's numeric tag.
    pub fn tag(&self) -> CommandTag {
        match self {
            Command::Reply => CommandTag::Reply,

            Command::Auth(_) => CommandTag::Auth,
            Command::SetClientName(_) => CommandTag::SetClientName,
            Command::Exit => CommandTag::Exit,

            Command::CreatePlaybackStream(_) => CommandTag::CreatePlaybackStream,
            Command::DeletePlaybackStream(_) => CommandTag::DeletePlaybackStream,
            Command::CreateRecordStream(_) => CommandTag::CreateRecordStream,
            Command::DeleteRecordStream(_) => CommandTag::DeleteRecordStream,
            Command::DrainPlaybackStream(_) => CommandTag::DrainPlaybackStream,
            Command::GetPlaybackLatency(_) => CommandTag::GetPlaybackLatency,
            Command::GetRecordLatency(_) => CommandTag::GetRecordLatency,

            Command::CorkPlaybackStream(_) => CommandTag::CorkPlaybackStream,
            Command::FlushPlaybackStream(_) => CommandTag::FlushPlaybackStream,
            Command::TriggerPlaybackStream(_) => CommandTag::TriggerPlaybackStream,
            Command::PrebufPlaybackStream(_) => CommandTag::PrebufPlaybackStream,
            Command::CorkRecordStream(_) => CommandTag::CorkRecordStream,
            Command::FlushRecordStream(_) => CommandTag::FlushRecordStream,
            Command::MoveSinkInput(_) => CommandTag::MoveSinkInput,
            Command::MoveSourceOutput(_) => CommandTag::MoveSourceOutput,
            Command::SetPlaybackStreamBufferAttr(_) => CommandTag::SetPlaybackStreamBufferAttr,
            Command::SetRecordStreamBufferAttr(_) => CommandTag::SetRecordStreamBufferAttr,
            Command::UpdatePlaybackStreamSampleRate(_) => {
                CommandTag::UpdatePlaybackStreamSampleRate
            }
            Command::UpdateRecordStreamSampleRate(_) => CommandTag::UpdateRecordStreamSampleRate,
            Command::SetPlaybackStreamName(_) => CommandTag::SetPlaybackStreamName,
            Command::SetRecordStreamName(_) => CommandTag::SetRecordStreamName,

            Command::CreateUploadStream(_) => CommandTag::CreateUploadStream,
            Command::DeleteUploadStream(_) => CommandTag::DeleteUploadStream,
            Command::FinishUploadStream(_) => CommandTag::FinishUploadStream,
            Command::PlaySample(_) => CommandTag::PlaySample,
            Command::RemoveSample(_) => CommandTag::RemoveSample,

            Command::Stat => CommandTag::Stat,
            Command::LookupSink(_) => CommandTag::LookupSink,
            Command::LookupSource(_) => CommandTag::LookupSource,
            Command::GetServerInfo => CommandTag::GetServerInfo,
            Command::GetSinkInfo(_) => CommandTag::GetSinkInfo,
            Command::GetSinkInfoList => CommandTag::GetSinkInfoList,
            Command::GetSourceInfo(_) => CommandTag::GetSourceInfo,
            Command::GetSourceInfoList => CommandTag::GetSourceInfoList,
            Command::GetModuleInfo(_) => CommandTag::GetModuleInfo,
            Command::GetModuleInfoList => CommandTag::GetModuleInfoList,
            Command::GetClientInfo(_) => CommandTag::GetClientInfo,
            Command::GetClientInfoList => CommandTag::GetClientInfoList,
            Command::GetSinkInputInfo(_) => CommandTag::GetSinkInputInfo,
            Command::GetSinkInputInfoList => CommandTag::GetSinkInputInfoList,
            Command::GetSourceOutputInfo(_) => CommandTag::GetSourceOutputInfo,
            Command::GetSourceOutputInfoList => CommandTag::GetSourceOutputInfoList,
            Command::GetSampleInfo(_) => CommandTag::GetSampleInfo,
            Command::GetSampleInfoList => CommandTag::GetSampleInfoList,
            Command::Subscribe(_) => CommandTag::Subscribe,

            Command::SetSinkVolume(_) => CommandTag::SetSinkVolume,
            Command::SetSourceVolume(_) => CommandTag::SetSourceVolume,
            Command::SetSinkInputVolume(_) => CommandTag::SetSinkInputVolume,
            Command::SetSinkMute(_) => CommandTag::SetSinkMute,
            Command::SetSourceMute(_) => CommandTag::SetSourceMute,
            Command::SetSinkInputMute(_) => CommandTag::SetSinkInputMute,

            Command::SetDefaultSink(_) => CommandTag::SetDefaultSink,
            Command::SetDefaultSource(_) => CommandTag::SetDefaultSource,
            Command::KillClient(_) => CommandTag::KillClient,
            Command::KillSinkInput(_) => CommandTag::KillSinkInput,
            Command::KillSourceOutput(_) => CommandTag::KillSourceOutput,
            Command::SuspendSink(_) => CommandTag::SuspendSink,
            Command::SuspendSource(_) => CommandTag::SuspendSource,
            Command::LoadModule(_) => CommandTag::LoadModule,
            Command::UnloadModule(_) => CommandTag::UnloadModule,

            Command::UpdateClientProplist(_) => CommandTag::UpdateClientProplist,
            Command::UpdatePlaybackStreamProplist(_) => CommandTag::UpdatePlaybackStreamProplist,
            Command::UpdateRecordStreamProplist(_) => CommandTag::UpdateRecordStreamProplist,
            Command::RemoveClientProplist(_) => CommandTag::RemoveClientProplist,
            Command::RemovePlaybackStreamProplist(_) => CommandTag::RemovePlaybackStreamProplist,
            Command::RemoveRecordStreamProplist(_) => CommandTag::RemoveRecordStreamProplist,

            Command::Request(_) => CommandTag::Request,
            Command::Overflow(_) => CommandTag::Overflow,
            Command::Underflow(_) => CommandTag::Underflow,
            Command::Started(_) => CommandTag::Started,
            Command::PlaybackStreamKilled(_) => CommandTag::PlaybackStreamKilled,
            Command::RecordStreamKilled(_) => CommandTag::RecordStreamKilled,
            Command::PlaybackStreamSuspended(_) => CommandTag::PlaybackStreamSuspended,
            Command::RecordStreamSuspended(_) => CommandTag::RecordStreamSuspended,
            Command::PlaybackStreamMoved(_) => CommandTag::PlaybackStreamMoved,
            Command::RecordStreamMoved(_) => CommandTag::RecordStreamMoved,
            Command::SubscribeEvent(_) => CommandTag::SubscribeEvent,

            // These never appear on the wire; write_tag_prefixed rejects
            // them before asking for a tag.
            Command::Unknown(_) | Command::Unsupported(_) => CommandTag::Error,
        }
    }
}

impl TagStructWrite for Command {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        match self {
            Command::Reply
            | Command::Exit
            | Command::Stat
            | Command::GetServerInfo
            | Command::GetSinkInfoList
            | Command::GetSourceInfoList
            | Command::GetModuleInfoList
            | Command::GetClientInfoList
            | Command::GetSinkInputInfoList
            | Command::GetSourceOutputInfoList
            | Command::GetSampleInfoList => Ok(()),

            Command::Auth(p) => w.write(p),
            Command::SetClientName(p) => w.write(p),

            Command::CreatePlaybackStream(p) => w.write(p),
            Command::DeletePlaybackStream(chan) => w.write_u32(*chan),
            Command::CreateRecordStream(p) => w.write(p),
            Command::DeleteRecordStream(chan) => w.write_u32(*chan),
            Command::DrainPlaybackStream(chan) => w.write_u32(*chan),
            Command::GetPlaybackLatency(p) => w.write(p),
            Command::GetRecordLatency(p) => w.write(p),

            Command::CorkPlaybackStream(p) => w.write(p),
            Command::FlushPlaybackStream(chan) => w.write_u32(*chan),
            Command::TriggerPlaybackStream(chan) => w.write_u32(*chan),
            Command::PrebufPlaybackStream(chan) => w.write_u32(*chan),
            Command::CorkRecordStream(p) => w.write(p),
            Command::FlushRecordStream(chan) => w.write_u32(*chan),
            Command::MoveSinkInput(p) => w.write(p),
            Command::MoveSourceOutput(p) => w.write(p),
            Command::SetPlaybackStreamBufferAttr(p) => w.write(p),
            Command::SetRecordStreamBufferAttr(p) => w.write(p),
            Command::UpdatePlaybackStreamSampleRate(p) => w.write(p),
            Command::UpdateRecordStreamSampleRate(p) => w.write(p),
            Command::SetPlaybackStreamName(p) => w.write(p),
            Command::SetRecordStreamName(p) => w.write(p),

            Command::CreateUploadStream(p) => w.write(p),
            Command::DeleteUploadStream(chan) => w.write_u32(*chan),
            Command::FinishUploadStream(chan) => w.write_u32(*chan),
            Command::PlaySample(p) => w.write(p),
            Command::RemoveSample(name) => w.write_string(Some(name)),

            Command::LookupSink(name) => w.write_string(Some(name)),
            Command::LookupSource(name) => w.write_string(Some(name)),
            Command::GetSinkInfo(p) => w.write(p),
            Command::GetSourceInfo(p) => w.write(p),
            Command::GetModuleInfo(id) => w.write_u32(*id),
            Command::GetClientInfo(id) => w.write_u32(*id),
            Command::GetSinkInputInfo(id) => w.write_u32(*id),
            Command::GetSourceOutputInfo(id) => w.write_u32(*id),
            Command::GetSampleInfo(id) => w.write_u32(*id),
            Command::Subscribe(mask) => w.write(mask),

            Command::SetSinkVolume(p) => w.write(p),
            Command::SetSourceVolume(p) => w.write(p),
            Command::SetSinkInputVolume(p) => w.write(p),
            Command::SetSinkMute(p) => w.write(p),
            Command::SetSourceMute(p) => w.write(p),
            Command::SetSinkInputMute(p) => w.write(p),

            Command::SetDefaultSink(name) => w.write_string(name.as_ref()),
            Command::SetDefaultSource(name) => w.write_string(name.as_ref()),
            Command::KillClient(id) => w.write_u32(*id),
            Command::KillSinkInput(id) => w.write_u32(*id),
            Command::KillSourceOutput(id) => w.write_u32(*id),
            Command::SuspendSink(p) => w.write(p),
            Command::SuspendSource(p) => w.write(p),
            Command::LoadModule(p) => w.write(p),
            Command::UnloadModule(id) => w.write_u32(*id),

            Command::UpdateClientProplist(p) => w.write(p),
            Command::UpdatePlaybackStreamProplist(p) => w.write(p),
            Command::UpdateRecordStreamProplist(p) => w.write(p),
            Command::RemoveClientProplist(p) => w.write(p),
            Command::RemovePlaybackStreamProplist(p) => w.write(p),
            Command::RemoveRecordStreamProplist(p) => w.write(p),

            Command::Request(p) => w.write(p),
            Command::Overflow(chan) => w.write_u32(*chan),
            Command::Underflow(chan) => w.write_u32(*chan),
            Command::Started(chan) => w.write_u32(*chan),
            Command::PlaybackStreamKilled(chan) => w.write_u32(*chan),
            Command::RecordStreamKilled(chan) => w.write_u32(*chan),
            Command::PlaybackStreamSuspended(p) => w.write(p),
            Command::RecordStreamSuspended(p) => w.write(p),
            Command::PlaybackStreamMoved(p) => w.write(p),
            Command::RecordStreamMoved(p) => w.write(p),
            Command::SubscribeEvent(p) => w.write(p),

            Command::Unknown(raw) => Err(ProtocolError::Invalid(format!(
                "cannot serialize unknown command {}",
                raw
            ))),
            Command::Unsupported(tag) => Err(ProtocolError::Unimplemented(*tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;
    use crate::protocol::MAX_VERSION;

    fn roundtrip(cmd: &Command, seq: u32) -> anyhow::Result<(u32, Command)> {
        let mut buf = Vec::new();
        cmd.write_tag_prefixed(seq, &mut buf, MAX_VERSION)?;

        let mut cursor = Cursor::new(buf);
        Ok(Command::read_tag_prefixed(&mut cursor, MAX_VERSION)?)
    }

    #[test]
    fn command_roundtrip() -> anyhow::Result<()> {
        let (seq, cmd) = roundtrip(&Command::DrainPlaybackStream(3), 99)?;
        assert_eq!(seq, 99);
        assert_matches!(cmd, Command::DrainPlaybackStream(3));

        let (_, cmd) = roundtrip(&Command::GetSinkInfoList, 1)?;
        assert_matches!(cmd, Command::GetSinkInfoList);

        let (_, cmd) = roundtrip(
            &Command::Request(Request {
                channel: 0,
                length: 4096,
            }),
            u32::MAX,
        )?;
        assert_matches!(
            cmd,
            Command::Request(Request {
                channel: 0,
                length: 4096
            })
        );

        Ok(())
    }

    #[test]
    fn unknown_command_id() -> anyhow::Result<()> {
        let mut buf = Vec::new();
        {
            let mut ts = TagStructWriter::new(&mut buf, MAX_VERSION);
            ts.write_u32(0xbeef)?;
            ts.write_u32(7)?;
        }

        let (seq, cmd) = Command::read_tag_prefixed(&mut Cursor::new(buf), MAX_VERSION)?;
        assert_eq!(seq, 7);
        assert_matches!(cmd, Command::Unknown(0xbeef));

        Ok(())
    }

    #[test]
    fn obsolete_command_is_unsupported() -> anyhow::Result<()> {
        let mut buf = Vec::new();
        {
            let mut ts = TagStructWriter::new(&mut buf, MAX_VERSION);
            ts.write_u32(CommandTag::AddAutoloadObsolete as u32)?;
            ts.write_u32(8)?;
        }

        let (_, cmd) = Command::read_tag_prefixed(&mut Cursor::new(buf), MAX_VERSION)?;
        assert_matches!(cmd, Command::Unsupported(CommandTag::AddAutoloadObsolete));

        Ok(())
    }
}
