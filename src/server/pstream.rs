//! The framed duplex transport: packets and audio frames over a
//! non-blocking socket.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use mio::net::{TcpStream, UnixStream};

use crate::core::memblock::Mempool;
use crate::core::memchunk::MemChunk;
use crate::protocol::{
    encode_descriptor, Descriptor, DescriptorFlags, ProtocolError, SeekMode, ShmMarker,
    CONTROL_CHANNEL, DESCRIPTOR_SIZE, MAX_FRAME_SIZE,
};

/// The underlying connected socket.
pub enum PStreamSocket {
    /// A local stream socket.
    Unix(UnixStream),
    /// A TCP connection.
    Tcp(TcpStream),
}

impl Read for PStreamSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PStreamSocket::Unix(s) => s.read(buf),
            PStreamSocket::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for PStreamSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PStreamSocket::Unix(s) => s.write(buf),
            PStreamSocket::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PStreamSocket::Unix(s) => s.flush(),
            PStreamSocket::Tcp(s) => s.flush(),
        }
    }
}

impl mio::event::Source for PStreamSocket {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        match self {
            PStreamSocket::Unix(s) => s.register(registry, token, interests),
            PStreamSocket::Tcp(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        match self {
            PStreamSocket::Unix(s) => s.reregister(registry, token, interests),
            PStreamSocket::Tcp(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        match self {
            PStreamSocket::Unix(s) => s.deregister(registry),
            PStreamSocket::Tcp(s) => s.deregister(registry),
        }
    }
}

/// A fully received frame.
pub enum PStreamItem {
    /// A control packet; the payload is a tag-prefixed command.
    Packet(Vec<u8>),
    /// Audio data for a stream channel.
    Memblock {
        /// The stream's channel id.
        channel: u32,
        /// The seek offset.
        offset: i64,
        /// The seek mode.
        seek: SeekMode,
        /// The audio, in a freshly allocated block.
        chunk: MemChunk,
    },
    /// The peer released a shared-pool block.
    ShmRelease(u32),
    /// The peer revoked a shared-pool block.
    ShmRevoke(u32),
    /// The peer closed the connection.
    Eof,
}

enum ReadState {
    Descriptor {
        buf: [u8; DESCRIPTOR_SIZE],
        fill: usize,
    },
    Payload {
        desc: Descriptor,
        chunk: MemChunk,
        fill: usize,
    },
}

/// The framed transport over one socket.
///
/// Writes go through a FIFO of pre-encoded frames and drain opportunistically
/// and on writability; the transition to an empty queue is reported so the
/// server can pump the next record fragment.
pub struct PStream {
    socket: PStreamSocket,
    pool: Mempool,
    read: ReadState,
    send_queue: VecDeque<Vec<u8>>,
    send_offset: usize,
}

impl PStream {
    /// Wraps a connected socket. Blocks read directly into pool
    /// allocations.
    pub fn new(socket: PStreamSocket, pool: Mempool) -> Self {
        Self {
            socket,
            pool,
            read: ReadState::Descriptor {
                buf: [0; DESCRIPTOR_SIZE],
                fill: 0,
            },
            send_queue: VecDeque::new(),
            send_offset: 0,
        }
    }

    /// The underlying socket, for registration.
    pub fn socket_mut(&mut self) -> &mut PStreamSocket {
        &mut self.socket
    }

    /// Whether frames are waiting to be written.
    pub fn is_pending(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Queues a pre-encoded control packet (descriptor included).
    pub fn send_frame(&mut self, frame: Vec<u8>) {
        self.send_queue.push_back(frame);
    }

    /// Queues an audio frame for a channel.
    pub fn send_memblock(
        &mut self,
        channel: u32,
        offset: i64,
        seek: SeekMode,
        chunk: &MemChunk,
    ) {
        let mut frame = vec![0u8; DESCRIPTOR_SIZE + chunk.length];
        let desc = Descriptor {
            length: chunk.length as u32,
            channel,
            offset,
            flags: DescriptorFlags::from_bits_retain(seek as u32),
        };

        let mut header = [0u8; DESCRIPTOR_SIZE];
        encode_descriptor(&mut header, &desc);
        frame[..DESCRIPTOR_SIZE].copy_from_slice(&header);
        frame[DESCRIPTOR_SIZE..].copy_from_slice(&chunk.data());

        self.send_queue.push_back(frame);
    }

    /// Queues a shared-pool release notification.
    pub fn send_shm_release(&mut self, block_id: u32) {
        self.send_marker(block_id, DescriptorFlags::SHM_RELEASE);
    }

    /// Queues a shared-pool revoke notification.
    pub fn send_shm_revoke(&mut self, block_id: u32) {
        self.send_marker(block_id, DescriptorFlags::SHM_REVOKE);
    }

    fn send_marker(&mut self, block_id: u32, flags: DescriptorFlags) {
        let desc = Descriptor {
            length: 0,
            channel: block_id,
            offset: 0,
            flags,
        };

        let mut header = [0u8; DESCRIPTOR_SIZE];
        encode_descriptor(&mut header, &desc);
        self.send_queue.push_back(header.to_vec());
    }

    /// Writes queued frames until the socket would block. Returns true if
    /// this call drained the queue (the server uses the transition to pump
    /// the next record fragment).
    pub fn flush(&mut self) -> io::Result<bool> {
        if self.send_queue.is_empty() {
            return Ok(false);
        }

        while let Some(frame) = self.send_queue.front() {
            match self.socket.write(&frame[self.send_offset..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket closed mid-write",
                    ))
                }
                Ok(n) => {
                    self.send_offset += n;
                    if self.send_offset == frame.len() {
                        self.send_queue.pop_front();
                        self.send_offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(true)
    }

    /// Reads whatever is available, returning every completed frame.
    ///
    /// An EOF from the peer yields a final [`PStreamItem::Eof`].
    pub fn read_some(&mut self) -> Result<Vec<PStreamItem>, ProtocolError> {
        let mut items = Vec::new();

        loop {
            match &mut self.read {
                ReadState::Descriptor { buf, fill } => {
                    match self.socket.read(&mut buf[*fill..]) {
                        Ok(0) => {
                            items.push(PStreamItem::Eof);
                            return Ok(items);
                        }
                        Ok(n) => {
                            *fill += n;
                            if *fill < DESCRIPTOR_SIZE {
                                continue;
                            }

                            let desc =
                                crate::protocol::read_descriptor(&mut io::Cursor::new(&buf[..]))?;
                            if desc.length > MAX_FRAME_SIZE {
                                return Err(ProtocolError::Invalid(format!(
                                    "frame of {} bytes exceeds limit",
                                    desc.length
                                )));
                            }

                            if let Some(marker) = desc.shm_marker() {
                                items.push(match marker {
                                    ShmMarker::Release => PStreamItem::ShmRelease(desc.channel),
                                    ShmMarker::Revoke => PStreamItem::ShmRevoke(desc.channel),
                                });
                                self.read = ReadState::Descriptor {
                                    buf: [0; DESCRIPTOR_SIZE],
                                    fill: 0,
                                };
                                continue;
                            }

                            // Audio lands straight in a fresh block, packets
                            // in a plain buffer via the same chunk.
                            let block = self.pool.allocate(desc.length as usize);
                            self.read = ReadState::Payload {
                                desc,
                                chunk: MemChunk::from_block(block),
                                fill: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(items),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                ReadState::Payload { desc, chunk, fill } => {
                    let done = if chunk.length == 0 {
                        true
                    } else {
                        let mut data = chunk.block.data_mut();
                        match self.socket.read(&mut data[*fill..chunk.length]) {
                            Ok(0) => {
                                drop(data);
                                items.push(PStreamItem::Eof);
                                return Ok(items);
                            }
                            Ok(n) => {
                                *fill += n;
                                *fill == chunk.length
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(items),
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            Err(e) => return Err(e.into()),
                        }
                    };

                    if done {
                        let desc = *desc;
                        let chunk = chunk.clone();
                        self.read = ReadState::Descriptor {
                            buf: [0; DESCRIPTOR_SIZE],
                            fill: 0,
                        };

                        if desc.channel == CONTROL_CHANNEL {
                            items.push(PStreamItem::Packet(chunk.data().to_vec()));
                        } else {
                            items.push(PStreamItem::Memblock {
                                channel: desc.channel,
                                offset: desc.offset,
                                seek: desc.seek_mode()?,
                                chunk,
                            });
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::os::unix::net::UnixStream as StdUnixStream;

    use crate::protocol::{write_command_message, Command, MAX_VERSION};

    use super::*;

    fn socketpair() -> (PStream, StdUnixStream) {
        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let stream = PStream::new(
            PStreamSocket::Unix(UnixStream::from_std(a)),
            Mempool::new(),
        );
        (stream, b)
    }

    #[test]
    fn reads_interleaved_frames() -> anyhow::Result<()> {
        let (mut stream, mut peer) = socketpair();

        write_command_message(&mut peer, 1, &Command::GetSinkInfoList, MAX_VERSION)?;
        crate::protocol::write_memblock(&mut peer, 3, 0, SeekMode::Relative, &[1, 2, 3, 4])?;

        let items = stream.read_some()?;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], PStreamItem::Packet(_)));
        match &items[1] {
            PStreamItem::Memblock { channel, chunk, .. } => {
                assert_eq!(*channel, 3);
                assert_eq!(&*chunk.data(), &[1, 2, 3, 4]);
            }
            _ => panic!("expected memblock"),
        }

        Ok(())
    }

    #[test]
    fn partial_reads_resume() -> anyhow::Result<()> {
        let (mut stream, mut peer) = socketpair();

        let mut framed = Vec::new();
        crate::protocol::write_memblock(&mut framed, 0, 0, SeekMode::Relative, &[9; 64])?;

        // Deliver the frame in two pieces.
        peer.write_all(&framed[..10])?;
        assert!(stream.read_some()?.is_empty());

        peer.write_all(&framed[10..])?;
        let items = stream.read_some()?;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], PStreamItem::Memblock { .. }));

        Ok(())
    }

    #[test]
    fn shm_markers_parse() -> anyhow::Result<()> {
        let (mut stream, mut peer) = socketpair();

        let desc = Descriptor {
            length: 0,
            channel: 42,
            offset: 0,
            flags: DescriptorFlags::SHM_RELEASE,
        };
        crate::protocol::write_descriptor(&mut peer, &desc)?;

        let items = stream.read_some()?;
        assert!(matches!(items[0], PStreamItem::ShmRelease(42)));

        Ok(())
    }

    #[test]
    fn flush_reports_drain_transition() -> anyhow::Result<()> {
        let (mut stream, _peer) = socketpair();

        assert!(!stream.flush()?);

        stream.send_frame(vec![0; 16]);
        assert!(stream.is_pending());
        assert!(stream.flush()?);
        assert!(!stream.is_pending());

        Ok(())
    }

    #[test]
    fn eof_is_reported() -> anyhow::Result<()> {
        let (mut stream, peer) = socketpair();
        drop(peer);

        let items = stream.read_some()?;
        assert!(matches!(items.last(), Some(PStreamItem::Eof)));

        Ok(())
    }
}
