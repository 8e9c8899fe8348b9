//! The native protocol server: listeners, connection lifecycle, event
//! pumping, and the built-in device.

pub mod authkey;
pub mod connection;
pub mod null_sink;
pub mod pdispatch;
pub mod pstream;
pub mod sockets;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mio::net::{TcpListener, UnixListener};
use mio::{Interest, Token};

use crate::core::{Core, CoreEvent};
use crate::mainloop::{Mainloop, TimerToken, WakeEvent};
use crate::protocol::{Command, Props, ProtocolError, SampleSpec, COOKIE_LENGTH};

use connection::{Connection, ServerAction};
use null_sink::NullSink;
use pstream::{PStream, PStreamItem, PStreamSocket};

const TOKEN_UNIX_LISTENER: Token = Token(0);
const TOKEN_TCP_LISTENER: Token = Token(1);
const TOKEN_CONNECTION_BASE: usize = 1024;

/// Unauthenticated connections are dropped after this long.
const AUTH_TIMEOUT: Duration = Duration::from_secs(60);

/// Hard cap on concurrent connections.
const MAX_CONNECTIONS: usize = 64;

/// Server construction parameters; the daemon fills these from its
/// environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the local listening socket.
    pub socket_path: Option<PathBuf>,
    /// Optional TCP listening address.
    pub tcp_addr: Option<SocketAddr>,
    /// Path of the authentication cookie file.
    pub cookie_path: PathBuf,
    /// Sample spec for the default device.
    pub sample_spec: SampleSpec,
}

/// The server: one mainloop, one core, N connections.
pub struct Server {
    mainloop: Mainloop,
    core: Core,
    unix_listener: Option<UnixListener>,
    tcp_listener: Option<TcpListener>,
    connections: HashMap<u32, Connection>,
    auth_timers: HashMap<TimerToken, u32>,
    devices: Vec<NullSink>,
    cookie: [u8; COOKIE_LENGTH],
    device_timer: Option<TimerToken>,
    next_connection_id: u32,
    wake_events: Vec<WakeEvent>,
}

impl Server {
    /// Builds the server: binds sockets, loads the cookie, and brings up
    /// the default null device.
    pub fn new(config: Config) -> io::Result<Self> {
        let mainloop = Mainloop::new()?;
        let mut core = Core::new(config.sample_spec);

        let cookie = authkey::load_or_generate(&config.cookie_path)?;

        let module = core.register_module("module-null-sink", "sink_name=auto_null");
        let device = NullSink::new(
            &mut core,
            "auto_null",
            "Null Output",
            config.sample_spec,
            Some(module),
        )
        .expect("fresh namereg cannot collide");
        if let Some(m) = core.modules.get_mut(module) {
            m.sinks.push(device.sink);
        }

        let mut unix_listener = match &config.socket_path {
            Some(path) => Some(sockets::bind_unix(path)?),
            None => None,
        };
        if let Some(l) = &mut unix_listener {
            mainloop.register(l, TOKEN_UNIX_LISTENER, Interest::READABLE)?;
        }

        let mut tcp_listener = match config.tcp_addr {
            Some(addr) => Some(sockets::bind_tcp(addr)?),
            None => None,
        };
        if let Some(l) = &mut tcp_listener {
            mainloop.register(l, TOKEN_TCP_LISTENER, Interest::READABLE)?;
        }

        let mut server = Self {
            mainloop,
            core,
            unix_listener,
            tcp_listener,
            connections: HashMap::new(),
            auth_timers: HashMap::new(),
            devices: vec![device],
            cookie,
            device_timer: None,
            next_connection_id: 0,
            wake_events: Vec::new(),
        };

        server.arm_device_timer();
        Ok(server)
    }

    /// The engine, for introspection and tests.
    pub fn core(&self) -> &Core {
        &self.core
    }

    /// The engine, mutable.
    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    /// Pulls `bytes` of audio through a sink as its device would, then
    /// delivers the resulting notifications. Used by the device timer and
    /// by tests that need a deterministic clock.
    pub fn drive_sink(&mut self, sink: u32, bytes: usize) -> usize {
        let pulled = self
            .devices
            .iter_mut()
            .find(|d| d.sink == sink)
            .map(|d| d.pull(&mut self.core, bytes))
            .unwrap_or(0);

        self.dispatch_core_events();
        self.flush_all();
        pulled
    }

    /// The index of the default sink's device.
    pub fn default_device_sink(&self) -> u32 {
        self.devices[0].sink
    }

    /// Whether an Exit command asked us to stop.
    pub fn quit_requested(&self) -> bool {
        self.core.quit_requested
    }

    fn arm_device_timer(&mut self) {
        let token = self.mainloop.set_timer(null_sink::TICK_INTERVAL);
        self.device_timer = Some(token);
    }

    /// Runs the loop until an Exit command arrives.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.quit_requested() {
            self.step(None)?;
        }

        info!("exiting on client request");
        Ok(())
    }

    /// One loop iteration: waits up to `max_wait` for activity, then
    /// handles every pending event.
    pub fn step(&mut self, max_wait: Option<Duration>) -> io::Result<()> {
        let mut events = std::mem::take(&mut self.wake_events);
        events.clear();
        self.mainloop.run_once(max_wait, &mut events)?;

        for event in &events {
            match event {
                WakeEvent::Io { token, readable, writable } => {
                    match *token {
                        TOKEN_UNIX_LISTENER => self.accept_unix()?,
                        TOKEN_TCP_LISTENER => self.accept_tcp()?,
                        Token(t) if t >= TOKEN_CONNECTION_BASE => {
                            let id = (t - TOKEN_CONNECTION_BASE) as u32;
                            self.connection_io(id, *readable, *writable);
                        }
                        _ => {}
                    }
                }
                WakeEvent::Timer(token) => {
                    if Some(*token) == self.device_timer {
                        self.device_tick();
                    } else if let Some(conn_id) = self.auth_timers.remove(token) {
                        self.auth_timeout(conn_id);
                    }
                }
                WakeEvent::Deferred(_) => {}
            }
        }

        self.dispatch_core_events();
        self.flush_all();

        self.wake_events = events;
        Ok(())
    }

    fn device_tick(&mut self) {
        let now = Instant::now();
        for device in &mut self.devices {
            device.tick(&mut self.core, now);
        }

        self.arm_device_timer();
    }

    fn auth_timeout(&mut self, conn_id: u32) {
        let unauthorized = self
            .connections
            .get(&conn_id)
            .map(|c| !c.authorized)
            .unwrap_or(false);

        if unauthorized {
            warn!("conn {}: authentication timed out", conn_id);
            self.kick(conn_id);
        }
    }

    fn accept_unix(&mut self) -> io::Result<()> {
        loop {
            let socket = {
                let Some(listener) = &self.unix_listener else {
                    return Ok(());
                };

                match listener.accept() {
                    Ok((socket, _)) => socket,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                }
            };

            self.accept(PStreamSocket::Unix(socket));
        }
    }

    fn accept_tcp(&mut self) -> io::Result<()> {
        loop {
            let socket = {
                let Some(listener) = &self.tcp_listener else {
                    return Ok(());
                };

                match listener.accept() {
                    Ok((socket, _)) => socket,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                }
            };

            self.accept(PStreamSocket::Tcp(socket));
        }
    }

    fn accept(&mut self, mut socket: PStreamSocket) {
        if self.connections.len() >= MAX_CONNECTIONS {
            warn!("connection limit reached, dropping new client");
            return;
        }

        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let token = Token(TOKEN_CONNECTION_BASE + id as usize);
        if let Err(e) =
            self.mainloop
                .register(&mut socket, token, Interest::READABLE | Interest::WRITABLE)
        {
            warn!("failed to register client socket: {}", e);
            return;
        }

        let mut props = Props::new();
        props.set_str(crate::protocol::Prop::ApplicationName, "");
        let client_index = self.core.create_client("native", props);

        let pstream = PStream::new(socket, self.core.pool.clone());
        let connection = Connection::new(id, pstream, client_index);
        self.connections.insert(id, connection);

        let timer = self.mainloop.set_timer(AUTH_TIMEOUT);
        self.auth_timers.insert(timer, id);

        info!("conn {}: new client connected", id);
        self.dispatch_core_events();
    }

    fn connection_io(&mut self, id: u32, readable: bool, writable: bool) {
        if writable {
            let drained = match self.connections.get_mut(&id) {
                Some(conn) => match conn.pstream.flush() {
                    Ok(drained) => drained,
                    Err(e) => {
                        debug!("conn {}: write error: {}", id, e);
                        self.kick(id);
                        return;
                    }
                },
                None => return,
            };

            if drained {
                self.pump_record(id);
            }
        }

        if readable {
            self.connection_read(id);
        }
    }

    fn connection_read(&mut self, id: u32) {
        loop {
            let items = match self.connections.get_mut(&id) {
                Some(conn) => match conn.pstream.read_some() {
                    Ok(items) => items,
                    Err(e) => {
                        warn!("conn {}: protocol error, kicking client: {}", id, e);
                        self.kick(id);
                        return;
                    }
                },
                None => return,
            };

            if items.is_empty() {
                break;
            }

            for item in items {
                if matches!(item, PStreamItem::Eof) {
                    info!("conn {}: client disconnected", id);
                    self.kick(id);
                    return;
                }

                if let Err(e) = self.handle_item(id, item) {
                    warn!("conn {}: protocol error, kicking client: {}", id, e);
                    self.kick(id);
                    return;
                }
            }

            self.dispatch_core_events();
        }
    }

    fn handle_item(&mut self, id: u32, item: PStreamItem) -> Result<(), ProtocolError> {
        let conn = self.connections.get_mut(&id).expect("caller checked");

        match item {
            PStreamItem::Packet(payload) => {
                match conn.pdispatch.dispatch(&payload)? {
                    // Auth and the client-name handshake need server state
                    // (the cookie), so they are routed before the generic
                    // handler.
                    pdispatch::Dispatched::Request {
                        seq,
                        command: Command::Auth(params),
                    } => {
                        let cookie_ok = authkey::cookie_matches(&self.cookie, &params.cookie);
                        conn.handle_auth(seq, &params, cookie_ok);
                    }
                    pdispatch::Dispatched::Request {
                        seq,
                        command: Command::SetClientName(params),
                    } => {
                        conn.handle_set_client_name(&mut self.core, seq, params);
                    }
                    pdispatch::Dispatched::Request { seq, command } => {
                        let action = conn.handle_command(&mut self.core, seq, command)?;
                        if let Some(action) = action {
                            self.perform_action(id, action);
                        }
                    }
                    pdispatch::Dispatched::Reply { .. } => {}
                    pdispatch::Dispatched::Stray(seq) => {
                        debug!("conn {}: stray reply for tag {}", id, seq);
                    }
                }

                Ok(())
            }
            PStreamItem::Memblock {
                channel,
                offset,
                seek,
                chunk,
            } => conn.handle_memblock(&mut self.core, channel, offset, seek, chunk),
            PStreamItem::ShmRelease(block) | PStreamItem::ShmRevoke(block) => {
                // SHM transfer is negotiated off, so there is nothing to
                // resolve or reuse.
                debug!("conn {}: unexpected shm message for block {}", id, block);
                Ok(())
            }
            PStreamItem::Eof => Ok(()),
        }
    }

    fn perform_action(&mut self, id: u32, action: ServerAction) {
        match action {
            ServerAction::LoadModule { seq, name, argument } => {
                self.load_module(id, seq, &name, &argument)
            }
            ServerAction::KillClient { seq, client_index } => {
                let victim = self
                    .connections
                    .iter()
                    .find(|(_, c)| c.client_index == client_index)
                    .map(|(id, _)| *id);

                match victim {
                    Some(victim) => {
                        self.kick(victim);
                    }
                    None => {
                        // A client entity with no connection is a zombie;
                        // remove it directly.
                        self.core.remove_client(client_index);
                    }
                }

                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.send_ack(seq);
                }
            }
        }
    }

    fn load_module(&mut self, id: u32, seq: u32, name: &str, argument: &str) {
        if name != "module-null-sink" {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.send_error(seq, crate::protocol::ErrorCode::ModInitFailed);
            }
            return;
        }

        let sink_name = argument
            .split_whitespace()
            .find_map(|kv| kv.strip_prefix("sink_name="))
            .unwrap_or("null")
            .to_string();

        let module = self.core.register_module(name, argument);
        let spec = self.core.default_spec;
        match NullSink::new(&mut self.core, &sink_name, "Null Output", spec, Some(module)) {
            Some(device) => {
                if let Some(m) = self.core.modules.get_mut(module) {
                    m.sinks.push(device.sink);
                }
                self.devices.push(device);

                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.send_reply(seq, &crate::protocol::LoadModuleReply { index: module });
                }
            }
            None => {
                let _ = self.core.unload_module(module);
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.send_error(seq, crate::protocol::ErrorCode::ModInitFailed);
                }
            }
        }
    }

    /// Tears down a connection: streams first, then the client entity,
    /// then the transport.
    fn kick(&mut self, id: u32) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };

        for input in conn.playback_streams() {
            self.core.sink_input_unlink(input);
        }
        for output in conn.record_streams() {
            self.core.source_output_unlink(output);
        }

        self.core.remove_client(conn.client_index);
        let _ = self.mainloop.deregister(conn.pstream.socket_mut());

        // Events addressed to the dead connection are dropped in the
        // dispatch below.
        self.dispatch_core_events();
    }

    /// Drains the core notification queue into the owning connections.
    fn dispatch_core_events(&mut self) {
        while let Some(event) = self.core.events.pop_front() {
            match event {
                CoreEvent::Stream { connection, event } => {
                    if let Some(conn) = self.connections.get_mut(&connection) {
                        conn.deliver_stream_event(&event);
                    }
                }
                CoreEvent::Subscription(event) => {
                    for conn in self.connections.values_mut() {
                        if conn.authorized {
                            conn.deliver_subscription(event);
                        }
                    }
                }
            }
        }
    }

    /// Pushes captured audio toward clients whose transport is idle.
    fn pump_record(&mut self, id: u32) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.pump_record(&mut self.core);
        }
    }

    fn flush_all(&mut self) {
        let mut dead = Vec::new();
        let mut drained = Vec::new();

        for (id, conn) in self.connections.iter_mut() {
            if !conn.pstream.is_pending() {
                continue;
            }

            match conn.pstream.flush() {
                Ok(true) => drained.push(*id),
                Ok(false) => {}
                Err(e) => {
                    debug!("conn {}: write error: {}", id, e);
                    dead.push(*id);
                }
            }
        }

        for id in dead {
            self.kick(id);
        }

        // A drained transport has room for the next record fragment.
        for id in drained {
            self.pump_record(id);
            if let Some(conn) = self.connections.get_mut(&id) {
                if conn.pstream.is_pending() {
                    let _ = conn.pstream.flush();
                }
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("connections", &self.connections.len())
            .field("devices", &self.devices.len())
            .finish()
    }
}
