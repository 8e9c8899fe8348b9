//! End-to-end tests: a real server on a Unix socket, driven by a manually
//! stepped mainloop, with a plain blocking client on the other end.

use std::ffi::CString;
use std::io::BufReader;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use sonord::protocol::{
    self, read_ack_message, read_reply_message, write_command_message, AuthParams, BufferAttr,
    ChannelMap, ChannelVolume, Command, CreatePlaybackStreamReply, ErrorCode, LookupReply,
    PlaybackStreamParams, Props, ProtocolError, SampleFormat, SampleSpec, SeekMode,
    SetClientNameReply, MAX_VERSION,
};
use sonord::server::{Config, Server};

struct Harness {
    server: Server,
    dir: PathBuf,
    socket_path: PathBuf,
    cookie: Vec<u8>,
}

impl Harness {
    fn new(name: &str) -> anyhow::Result<Self> {
        let dir = std::env::temp_dir().join(format!("sonord-e2e-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir)?;

        let socket_path = dir.join("native");
        let cookie_path = dir.join("cookie");

        let server = Server::new(Config {
            socket_path: Some(socket_path.clone()),
            tcp_addr: None,
            cookie_path: cookie_path.clone(),
            sample_spec: spec(),
        })?;

        let cookie = std::fs::read(&cookie_path)?;

        Ok(Self {
            server,
            dir,
            socket_path,
            cookie,
        })
    }

    /// Lets the server observe and answer whatever the client just sent.
    fn pump(&mut self) -> anyhow::Result<()> {
        for _ in 0..5 {
            self.server.step(Some(Duration::from_millis(5)))?;
        }
        Ok(())
    }

    fn connect(&mut self) -> anyhow::Result<BufReader<UnixStream>> {
        let sock = UnixStream::connect(&self.socket_path)?;
        sock.set_read_timeout(Some(Duration::from_secs(5)))?;
        self.pump()?;
        Ok(BufReader::new(sock))
    }

    /// Connects, authenticates, names the client, and suspends the default
    /// device so tests control the render clock explicitly.
    fn client(&mut self) -> anyhow::Result<BufReader<UnixStream>> {
        let mut sock = self.connect()?;

        write_command_message(
            sock.get_mut(),
            0,
            &Command::Auth(AuthParams {
                version: MAX_VERSION,
                supports_shm: false,
                cookie: self.cookie.clone(),
            }),
            MAX_VERSION,
        )?;
        self.pump()?;
        let (_, _reply): (u32, protocol::AuthReply) =
            read_reply_message(&mut sock, MAX_VERSION).context("auth failed")?;

        let mut props = Props::new();
        props.set(protocol::Prop::ApplicationName, CString::new("e2e")?);
        write_command_message(
            sock.get_mut(),
            1,
            &Command::SetClientName(protocol::SetClientNameParams { props }),
            MAX_VERSION,
        )?;
        self.pump()?;
        let (_, _reply): (u32, SetClientNameReply) = read_reply_message(&mut sock, MAX_VERSION)?;

        write_command_message(
            sock.get_mut(),
            2,
            &Command::SuspendSink(protocol::SuspendParams {
                index: Some(self.server.default_device_sink()),
                name: None,
                suspend: true,
            }),
            MAX_VERSION,
        )?;
        self.pump()?;
        read_ack_message(&mut sock)?;

        Ok(sock)
    }

    fn create_playback_stream(
        &mut self,
        sock: &mut BufReader<UnixStream>,
        seq: u32,
        attr: BufferAttr,
        sync_id: u32,
    ) -> anyhow::Result<CreatePlaybackStreamReply> {
        write_command_message(
            sock.get_mut(),
            seq,
            &Command::CreatePlaybackStream(PlaybackStreamParams {
                sample_spec: spec(),
                channel_map: ChannelMap::stereo(),
                cvolume: ChannelVolume::norm(2),
                buffer_attr: attr,
                sync_id,
                ..Default::default()
            }),
            MAX_VERSION,
        )?;
        self.pump()?;

        let (_, reply) = read_reply_message::<CreatePlaybackStreamReply>(sock, MAX_VERSION)?;
        Ok(reply)
    }

    fn write_audio(
        &mut self,
        sock: &mut BufReader<UnixStream>,
        channel: u32,
        bytes: usize,
    ) -> anyhow::Result<()> {
        protocol::write_memblock(
            sock.get_mut(),
            channel,
            0,
            SeekMode::Relative,
            &vec![0u8; bytes],
        )?;
        self.pump()?;
        Ok(())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn spec() -> SampleSpec {
    SampleSpec {
        format: SampleFormat::S16Le,
        channels: 2,
        rate: 44100,
    }
}

fn small_attrs() -> BufferAttr {
    BufferAttr {
        max_length: 65536,
        target_length: 16384,
        pre_buffering: 8192,
        minimum_request_length: 1024,
        fragment_size: u32::MAX,
    }
}

fn next_command(sock: &mut BufReader<UnixStream>) -> anyhow::Result<Command> {
    let (_, cmd) = protocol::read_command_message(sock, MAX_VERSION)?;
    Ok(cmd)
}

/// Reads server-initiated commands until `pred` matches, failing on an
/// unexpected Underflow.
fn wait_for(
    sock: &mut BufReader<UnixStream>,
    allow_underflow: bool,
    mut pred: impl FnMut(&Command) -> bool,
) -> anyhow::Result<Command> {
    for _ in 0..32 {
        let cmd = next_command(sock)?;
        if pred(&cmd) {
            return Ok(cmd);
        }

        if !allow_underflow {
            anyhow::ensure!(
                !matches!(cmd, Command::Underflow(_)),
                "unexpected underflow: {:?}",
                cmd.tag()
            );
        }
    }

    anyhow::bail!("expected command never arrived")
}

/// Reads until the ack for `tag` arrives, skipping interleaved
/// server-initiated traffic.
fn wait_ack(sock: &mut BufReader<UnixStream>, tag: u32) -> anyhow::Result<()> {
    for _ in 0..32 {
        match protocol::read_command_message(sock, MAX_VERSION) {
            Ok((seq, Command::Reply)) if seq == tag => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    anyhow::bail!("ack for tag {} never arrived", tag)
}

/// Reads until the server sends an error reply, skipping interleaved
/// traffic, and returns its code.
fn wait_server_error(sock: &mut BufReader<UnixStream>) -> anyhow::Result<ErrorCode> {
    for _ in 0..32 {
        match protocol::read_command_message(sock, MAX_VERSION) {
            Ok(_) => continue,
            Err(ProtocolError::ServerError(code)) => return Ok(code),
            Err(e) => return Err(e.into()),
        }
    }

    anyhow::bail!("error reply never arrived")
}

#[test]
fn scenario_single_input_playback() -> anyhow::Result<()> {
    let mut h = Harness::new("playback")?;
    let mut sock = h.client()?;

    let reply = h.create_playback_stream(&mut sock, 10, small_attrs(), 0)?;
    assert_eq!(reply.requested_bytes, 16384);
    assert_eq!(reply.buffer_attr.max_length, 65536);
    assert_eq!(reply.buffer_attr.target_length, 16384);
    assert_eq!(reply.buffer_attr.pre_buffering, 8192);
    assert_eq!(reply.buffer_attr.minimum_request_length, 1024);

    h.write_audio(&mut sock, reply.channel, 16384)?;

    let sink = h.server.default_device_sink();
    assert_eq!(h.server.drive_sink(sink, 4096), 4096);

    // The sink consumed a quarter of the buffer; the server asks for
    // exactly that much back. No underflow along the way.
    let cmd = wait_for(&mut sock, false, |c| matches!(c, Command::Request(_)))?;
    match cmd {
        Command::Request(r) => {
            assert_eq!(r.channel, reply.channel);
            assert_eq!(r.length, 4096);
        }
        _ => unreachable!(),
    }

    let input = h.server.core().sink_inputs.get(reply.sink_input_index).unwrap();
    assert_eq!(input.queue.len(), 12288);

    Ok(())
}

#[test]
fn scenario_underrun_and_restart() -> anyhow::Result<()> {
    let mut h = Harness::new("underrun")?;
    let mut sock = h.client()?;

    let reply = h.create_playback_stream(&mut sock, 10, small_attrs(), 0)?;
    h.write_audio(&mut sock, reply.channel, 16384)?;

    let sink = h.server.default_device_sink();

    // Consume everything, then keep pulling on an empty queue.
    assert_eq!(h.server.drive_sink(sink, 16384), 16384);
    assert_eq!(h.server.drive_sink(sink, 4096), 0);
    assert_eq!(h.server.drive_sink(sink, 4096), 0);

    let cmd = wait_for(&mut sock, true, |c| matches!(c, Command::Underflow(_)))?;
    assert!(matches!(cmd, Command::Underflow(c) if c == reply.channel));

    // Exactly once: pulling again must not produce another one.
    h.server.drive_sink(sink, 4096);
    h.pump()?;

    // Refill half the prebuffer; playback must not resume yet.
    h.write_audio(&mut sock, reply.channel, 4096)?;
    assert_eq!(h.server.drive_sink(sink, 4096), 0);

    // Complete the prebuffer; playback restarts and announces itself.
    h.write_audio(&mut sock, reply.channel, 4096)?;
    assert_eq!(h.server.drive_sink(sink, 4096), 4096);

    let cmd = wait_for(&mut sock, true, |c| matches!(c, Command::Started(_)))?;
    assert!(matches!(cmd, Command::Started(c) if c == reply.channel));

    Ok(())
}

#[test]
fn scenario_drain() -> anyhow::Result<()> {
    let mut h = Harness::new("drain")?;
    let mut sock = h.client()?;

    let reply = h.create_playback_stream(&mut sock, 10, small_attrs(), 0)?;
    h.write_audio(&mut sock, reply.channel, 8192)?;

    write_command_message(
        sock.get_mut(),
        77,
        &Command::DrainPlaybackStream(reply.channel),
        MAX_VERSION,
    )?;
    h.pump()?;

    // The ack arrives only after the queue has fully played out.
    let sink = h.server.default_device_sink();
    h.server.drive_sink(sink, 8192);
    h.pump()?;

    wait_ack(&mut sock, 77)?;

    Ok(())
}

#[test]
fn scenario_drain_of_killed_stream_fails() -> anyhow::Result<()> {
    let mut h = Harness::new("drain-kill")?;
    let mut sock = h.client()?;

    let reply = h.create_playback_stream(&mut sock, 10, small_attrs(), 0)?;
    h.write_audio(&mut sock, reply.channel, 8192)?;

    write_command_message(
        sock.get_mut(),
        78,
        &Command::DrainPlaybackStream(reply.channel),
        MAX_VERSION,
    )?;
    h.pump()?;

    // The stream dies with the drain still pending; the drain tag must be
    // answered with NoEntity.
    write_command_message(
        sock.get_mut(),
        79,
        &Command::KillSinkInput(reply.sink_input_index),
        MAX_VERSION,
    )?;
    h.pump()?;

    wait_ack(&mut sock, 79)?;
    assert_eq!(wait_server_error(&mut sock)?, ErrorCode::NoEntity);

    Ok(())
}

#[test]
fn scenario_sync_group_cork_and_flush() -> anyhow::Result<()> {
    let mut h = Harness::new("sync")?;
    let mut sock = h.client()?;

    let s1 = h.create_playback_stream(&mut sock, 10, small_attrs(), 7)?;
    let s2 = h.create_playback_stream(&mut sock, 11, small_attrs(), 7)?;

    // Both members bind to the same sink.
    assert_eq!(s1.sink_index, s2.sink_index);

    h.write_audio(&mut sock, s1.channel, 16384)?;
    h.write_audio(&mut sock, s2.channel, 16384)?;

    // Corking one member corks the whole group before the next render.
    write_command_message(
        sock.get_mut(),
        20,
        &Command::CorkPlaybackStream(protocol::CorkStreamParams {
            channel: s1.channel,
            cork: true,
        }),
        MAX_VERSION,
    )?;
    h.pump()?;
    read_ack_message(&mut sock)?;

    let sink = h.server.default_device_sink();
    assert_eq!(h.server.drive_sink(sink, 4096), 0);

    for index in [s1.sink_input_index, s2.sink_input_index] {
        let input = h.server.core().sink_inputs.get(index).unwrap();
        assert_eq!(
            input.state,
            sonord::core::sink_input::StreamState::Corked
        );
    }

    // Flushing one member clears both queues and re-arms both prebuffers.
    write_command_message(
        sock.get_mut(),
        21,
        &Command::FlushPlaybackStream(s1.channel),
        MAX_VERSION,
    )?;
    h.pump()?;
    read_ack_message(&mut sock)?;

    for index in [s1.sink_input_index, s2.sink_input_index] {
        let input = h.server.core().sink_inputs.get(index).unwrap();
        assert_eq!(input.queue.len(), 0);
        assert!(input.queue.in_prebuf());
    }

    Ok(())
}

#[test]
fn scenario_move_between_sinks() -> anyhow::Result<()> {
    let mut h = Harness::new("move")?;
    let mut sock = h.client()?;

    let reply = h.create_playback_stream(&mut sock, 10, small_attrs(), 0)?;
    h.write_audio(&mut sock, reply.channel, 8192)?;

    // Bring up a second device to move to.
    write_command_message(
        sock.get_mut(),
        30,
        &Command::LoadModule(protocol::LoadModuleParams {
            name: Some(CString::new("module-null-sink")?),
            argument: Some(CString::new("sink_name=other")?),
        }),
        MAX_VERSION,
    )?;
    h.pump()?;
    let (_, _module) = read_reply_message::<protocol::LoadModuleReply>(&mut sock, MAX_VERSION)?;

    write_command_message(
        sock.get_mut(),
        31,
        &Command::LookupSink(CString::new("other")?),
        MAX_VERSION,
    )?;
    h.pump()?;
    let (_, lookup) = read_reply_message::<LookupReply>(&mut sock, MAX_VERSION)?;
    assert_ne!(lookup.index, reply.sink_index);

    let (read_before, write_before) = {
        let input = h.server.core().sink_inputs.get(reply.sink_input_index).unwrap();
        (input.queue.read_index(), input.queue.write_index())
    };

    write_command_message(
        sock.get_mut(),
        32,
        &Command::MoveSinkInput(protocol::MoveStreamParams {
            index: reply.sink_input_index,
            device_index: Some(lookup.index),
            device_name: None,
        }),
        MAX_VERSION,
    )?;
    h.pump()?;
    read_ack_message(&mut sock)?;

    // The move preserved the queue and its positions.
    let input = h.server.core().sink_inputs.get(reply.sink_input_index).unwrap();
    assert_eq!(input.sink, lookup.index);
    assert_eq!(input.queue.read_index(), read_before);
    assert_eq!(input.queue.write_index(), write_before);

    let cmd = wait_for(&mut sock, true, |c| {
        matches!(c, Command::PlaybackStreamMoved(_))
    })?;
    match cmd {
        Command::PlaybackStreamMoved(params) => {
            assert_eq!(params.channel, reply.channel);
            assert_eq!(params.sink_index, lookup.index);
        }
        _ => unreachable!(),
    }

    Ok(())
}

#[test]
fn scenario_overflow_recovery() -> anyhow::Result<()> {
    let mut h = Harness::new("overflow")?;
    let mut sock = h.client()?;

    let attrs = BufferAttr {
        max_length: 1024,
        target_length: 512,
        pre_buffering: 256,
        minimum_request_length: 128,
        fragment_size: u32::MAX,
    };
    let reply = h.create_playback_stream(&mut sock, 10, attrs, 0)?;
    assert_eq!(reply.buffer_attr.max_length, 1024);

    // One oversized write: the oldest half is dropped, the position stays
    // coherent.
    h.write_audio(&mut sock, reply.channel, 2048)?;

    let cmd = wait_for(&mut sock, true, |c| matches!(c, Command::Overflow(_)))?;
    assert!(matches!(cmd, Command::Overflow(c) if c == reply.channel));

    let input = h.server.core().sink_inputs.get(reply.sink_input_index).unwrap();
    assert_eq!(input.queue.len(), 1024);
    assert_eq!(input.queue.write_index(), 2048);
    assert_eq!(input.queue.read_index(), 1024);

    Ok(())
}

#[test]
fn record_stream_receives_monitor_audio() -> anyhow::Result<()> {
    let mut h = Harness::new("record")?;
    let mut sock = h.client()?;

    // Record from the default source (the sink's monitor).
    write_command_message(
        sock.get_mut(),
        40,
        &Command::CreateRecordStream(protocol::RecordStreamParams {
            sample_spec: spec(),
            channel_map: ChannelMap::stereo(),
            buffer_attr: BufferAttr {
                max_length: 65536,
                fragment_size: 4096,
                ..Default::default()
            },
            ..Default::default()
        }),
        MAX_VERSION,
    )?;
    h.pump()?;
    let (_, record) =
        read_reply_message::<protocol::CreateRecordStreamReply>(&mut sock, MAX_VERSION)?;
    assert_eq!(record.buffer_attr.fragment_size, 4096);

    let playback = h.create_playback_stream(&mut sock, 41, small_attrs(), 0)?;
    h.write_audio(&mut sock, playback.channel, 16384)?;

    // The client setup suspended the device (and with it the monitor);
    // resume so the monitor fans audio out again.
    let sink = h.server.default_device_sink();
    write_command_message(
        sock.get_mut(),
        42,
        &Command::SuspendSink(protocol::SuspendParams {
            index: Some(sink),
            name: None,
            suspend: false,
        }),
        MAX_VERSION,
    )?;
    h.pump()?;
    wait_ack(&mut sock, 42)?;

    h.server.drive_sink(sink, 8192);
    h.pump()?;

    // The monitor fans the mixed audio back as record fragments.
    wait_for(&mut sock, true, |c| matches!(c, Command::Request(_)))?;

    let output = h
        .server
        .core()
        .source_outputs
        .get(record.source_output_index)
        .unwrap();
    assert!(output.queue.len() > 0 || output.queue.read_index() > 0);

    Ok(())
}

#[test]
fn unauthorized_commands_are_refused() -> anyhow::Result<()> {
    let mut h = Harness::new("auth")?;
    let mut sock = h.connect()?;

    write_command_message(sock.get_mut(), 1, &Command::GetSinkInfoList, MAX_VERSION)?;
    h.pump()?;

    match read_reply_message::<protocol::SinkInfo>(&mut sock, MAX_VERSION) {
        Err(ProtocolError::ServerError(ErrorCode::AccessDenied)) => {}
        other => anyhow::bail!("expected AccessDenied, got {:?}", other.map(|_| ())),
    }

    // A bad cookie is refused too.
    write_command_message(
        sock.get_mut(),
        2,
        &Command::Auth(AuthParams {
            version: MAX_VERSION,
            supports_shm: false,
            cookie: vec![0; 256],
        }),
        MAX_VERSION,
    )?;
    h.pump()?;

    match read_reply_message::<protocol::AuthReply>(&mut sock, MAX_VERSION) {
        Err(ProtocolError::ServerError(ErrorCode::AccessDenied)) => Ok(()),
        other => anyhow::bail!("expected AccessDenied, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn old_protocol_versions_are_refused() -> anyhow::Result<()> {
    let mut h = Harness::new("version")?;
    let mut sock = h.connect()?;

    write_command_message(
        sock.get_mut(),
        1,
        &Command::Auth(AuthParams {
            version: 7,
            supports_shm: false,
            cookie: h.cookie.clone(),
        }),
        MAX_VERSION,
    )?;
    h.pump()?;

    match read_reply_message::<protocol::AuthReply>(&mut sock, MAX_VERSION) {
        Err(ProtocolError::ServerError(ErrorCode::Version)) => Ok(()),
        other => anyhow::bail!("expected Version error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn introspection_lists_entities() -> anyhow::Result<()> {
    let mut h = Harness::new("introspect")?;
    let mut sock = h.client()?;

    write_command_message(sock.get_mut(), 50, &Command::GetSinkInfoList, MAX_VERSION)?;
    h.pump()?;
    let (_, sinks) = read_reply_message::<Vec<protocol::SinkInfo>>(&mut sock, MAX_VERSION)?;
    assert_eq!(sinks.len(), 1);
    assert_eq!(sinks[0].name, CString::new("auto_null").ok());

    write_command_message(sock.get_mut(), 51, &Command::GetSourceInfoList, MAX_VERSION)?;
    h.pump()?;
    let (_, sources) = read_reply_message::<Vec<protocol::SourceInfo>>(&mut sock, MAX_VERSION)?;
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].monitor_of_sink_index, Some(sinks[0].index));

    write_command_message(sock.get_mut(), 52, &Command::Stat, MAX_VERSION)?;
    h.pump()?;
    let (_, stat) = read_reply_message::<protocol::StatInfo>(&mut sock, MAX_VERSION)?;
    assert_eq!(stat.sample_cache_bytes, 0);

    Ok(())
}
