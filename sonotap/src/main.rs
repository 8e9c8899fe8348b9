use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use anyhow::{bail, Context};
use bytes::BytesMut;
use chrono::Utc;
use clap::Parser;
use console::style;
use mio::net::{UnixListener, UnixStream};
use sonord::protocol::{self, Command, CommandTag, DESCRIPTOR_SIZE};

/// A tool for tracing sound-server commands. Connects to an upstream
/// server, and binds a socket for clients to connect to. All commands sent
/// in either direction are dumped to stdout.
///
/// To use it, first launch the program, binding some socket:
///
///     $ sonotap --bind /tmp/sonotap.sock
///
/// Then point a client at it:
///
///     $ SONORD_SERVER=/tmp/sonotap.sock some-client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The socket to use for the upstream connection. Defaults to fetching
    /// it from the environment.
    #[arg(long, value_name = "SOCKET")]
    upstream: Option<String>,

    /// The socket to bind as the server.
    #[arg(long, value_name = "SOCKET")]
    bind: String,
}

struct Connection {
    client_name: String,
    negotiated_version: u16,

    client: UnixStream,
    client_token: mio::Token,
    upstream: UnixStream,
    upstream_token: mio::Token,

    client_to_server: BytesMut,
    server_to_client: BytesMut,
    pending_reply: HashMap<u32, CommandTag>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Direction {
    ClientToServer,
    ServerToClient,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let upstream = args
        .upstream
        .or_else(|| {
            sonord::socket_path_from_env().map(|p| p.to_string_lossy().into_owned())
        })
        .ok_or(anyhow::anyhow!("failed to find upstream server socket"))?;

    let mut listener = UnixListener::bind(args.bind).context("failed to bind server socket")?;

    const LISTENER: mio::Token = mio::Token(0);

    // Client tokens start from 1024, upstream tokens from 2048.
    let mut next_client_token = 1024;
    let mut next_upstream_token = 2048;

    let mut connections: Vec<Connection> = Vec::new();

    let mut poll = mio::Poll::new()?;
    let mut events = mio::Events::with_capacity(1024);

    poll.registry()
        .register(&mut listener, LISTENER, mio::Interest::READABLE)?;

    loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            match event.token() {
                LISTENER => {
                    let (mut stream, addr) = listener.accept()?;
                    let token = mio::Token(next_client_token);
                    next_client_token += 1;

                    poll.registry()
                        .register(&mut stream, token, mio::Interest::READABLE)?;

                    let mut upstream = UnixStream::connect(&upstream)?;
                    let upstream_token = mio::Token(next_upstream_token);
                    next_upstream_token += 1;

                    poll.registry().register(
                        &mut upstream,
                        upstream_token,
                        mio::Interest::READABLE,
                    )?;

                    connections.push(Connection {
                        client_name: format!("{:?}", addr),
                        negotiated_version: protocol::MAX_VERSION,
                        client: stream,
                        client_token: token,
                        upstream,
                        upstream_token,
                        client_to_server: BytesMut::new(),
                        server_to_client: BytesMut::new(),
                        pending_reply: HashMap::new(),
                    });
                }
                token if event.is_read_closed() => {
                    if let Some(pos) = connections
                        .iter()
                        .position(|c| c.client_token == token || c.upstream_token == token)
                    {
                        let mut conn = connections.remove(pos);
                        let msg = if conn.client_token == token {
                            "disconnected".into()
                        } else {
                            format!("disconnected {}", style("by server").bold())
                        };

                        println!(
                            "{}: {} {}",
                            style(Utc::now().to_string()).dim(),
                            style(conn.client_name).cyan(),
                            style(msg).red(),
                        );

                        poll.registry().deregister(&mut conn.client)?;
                        poll.registry().deregister(&mut conn.upstream)?;
                    }
                }
                token => {
                    if let Some(conn) = connections
                        .iter_mut()
                        .find(|c| c.client_token == token || c.upstream_token == token)
                    {
                        let direction = if conn.client_token == token {
                            Direction::ClientToServer
                        } else {
                            Direction::ServerToClient
                        };

                        match proxy(conn, direction) {
                            Ok(()) => (),
                            Err(e) => match e.downcast_ref::<std::io::Error>() {
                                // I/O errors happen when one end hangs up;
                                // the close event cleans up.
                                Some(_) => continue,
                                _ => bail!(e),
                            },
                        }
                    }
                }
            }
        }
    }
}

fn proxy(conn: &mut Connection, direction: Direction) -> anyhow::Result<()> {
    let (src, dest, buf) = if direction == Direction::ClientToServer {
        (
            &mut conn.client,
            &mut conn.upstream,
            &mut conn.client_to_server,
        )
    } else {
        (
            &mut conn.upstream,
            &mut conn.client,
            &mut conn.server_to_client,
        )
    };

    let mut next_read = 4096;

    'read: loop {
        let off = buf.len();
        buf.resize(off + next_read, 0);

        let n = match src.read(&mut buf[off..]) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                buf.truncate(off);
                break 'read;
            }
            v => v.context("recv error")?,
        };

        buf.truncate(off + n);

        loop {
            if buf.len() < DESCRIPTOR_SIZE {
                continue 'read;
            }

            let desc =
                protocol::read_descriptor(&mut Cursor::new(&buf[..DESCRIPTOR_SIZE]))?;
            if buf.len() < (desc.length as usize + DESCRIPTOR_SIZE) {
                next_read = desc.length as usize + DESCRIPTOR_SIZE - buf.len();
                continue 'read;
            }

            let msg_bytes = buf.split_to(DESCRIPTOR_SIZE + desc.length as usize);

            if desc.channel == protocol::CONTROL_CHANNEL {
                let mut cursor = Cursor::new(&msg_bytes[..]);
                cursor.set_position(DESCRIPTOR_SIZE as u64);

                match Command::read_tag_prefixed(&mut cursor, conn.negotiated_version) {
                    Ok((seq, Command::Reply)) => {
                        let tag = conn.pending_reply.remove(&seq);
                        if let Some(CommandTag::Auth) = tag {
                            // Pick up the negotiated version so later
                            // messages parse properly.
                            let mut ts = protocol::TagStructReader::new(
                                &mut cursor,
                                conn.negotiated_version,
                            );
                            if let Ok(reply) = ts.read::<protocol::AuthReply>() {
                                conn.negotiated_version =
                                    conn.negotiated_version.min(reply.version);
                            }
                        }

                        dump(&conn.client_name, seq, &format!("REPLY to {:?}", tag), direction);
                    }
                    Ok((seq, cmd)) => {
                        if let Command::SetClientName(ref params) = cmd {
                            if let Some(name) =
                                params.props.get_str(protocol::Prop::ApplicationName)
                            {
                                conn.client_name = name.to_owned();
                            }
                        }

                        if seq != u32::MAX {
                            conn.pending_reply.insert(seq, cmd.tag());
                        }

                        dump(&conn.client_name, seq, &format!("{:?}", cmd.tag()), direction);
                    }
                    Err(protocol::ProtocolError::ServerError(code)) => {
                        dump(&conn.client_name, u32::MAX, &format!("ERROR {:?}", code), direction);
                    }
                    Err(e) => {
                        dump(&conn.client_name, u32::MAX, &format!("<unparsed: {}>", e), direction);
                    }
                }
            } else {
                dump(
                    &conn.client_name,
                    u32::MAX,
                    &format!("<write of len {} to channel {}>", desc.length, desc.channel),
                    direction,
                );
            }

            dest.write_all(&msg_bytes)?;
        }
    }

    Ok(())
}

fn dump(client_name: &str, seq: u32, message: &str, direction: Direction) {
    let arrow = match direction {
        Direction::ClientToServer => style("-->").green(),
        Direction::ServerToClient => style("<--").magenta(),
    };

    let seq = if seq == u32::MAX {
        style("[event]".to_string()).dim()
    } else {
        style(format!("[{}]", seq)).dim()
    };

    println!(
        "{}: {} {} {} {}",
        style(Utc::now().to_string()).dim(),
        style(client_name).cyan(),
        arrow,
        seq,
        message,
    );
}
