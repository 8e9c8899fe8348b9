//! The native wire protocol: framed descriptors, tagstruct-encoded commands,
//! and stream audio frames.
//!
//! Suitable for implementing both servers and clients.

pub mod command;

mod error;
mod serde;

use std::io::{BufRead, Cursor, Read, Seek, SeekFrom, Write};

use bitflags::bitflags;
use byteorder::NetworkEndian;
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive as _;

pub use command::*;
pub use error::*;
pub use serde::*;

/// Oldest protocol version the library will talk to. Older peers are refused
/// with [`ErrorCode::Version`].
pub const MIN_VERSION: u16 = 8;

/// Protocol version implemented by this library.
///
/// Peers negotiate down to `min(ours, theirs)`; fields added by newer versions
/// are omitted when talking to older peers.
pub const MAX_VERSION: u16 = 13;

/// The size of a message header.
pub const DESCRIPTOR_SIZE: usize = 5 * 4;

/// The channel id that marks a control packet rather than stream audio.
pub const CONTROL_CHANNEL: u32 = u32::MAX;

/// Hard cap on a single frame's payload. Oversize frames abort the connection.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Length of the authentication cookie blob.
pub const COOKIE_LENGTH: usize = 256;

bitflags! {
    /// Special message types and flags carried in the descriptor.
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DescriptorFlags: u32 {
        /// The low byte of a memblock frame holds the seek mode.
        const SEEK_MASK = 0x000000FF;

        /// The payload is a shared-pool block release notification.
        const SHM_RELEASE = 0x40000000;

        /// The payload is a shared-pool block revocation.
        const SHM_REVOKE = 0xC0000000;
    }
}

/// How a stream write positions itself relative to the queue indices.
#[repr(u32)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum SeekMode {
    /// Seek relative to the current write index.
    #[default]
    Relative = 0,
    /// Seek to an absolute byte position.
    Absolute = 1,
    /// Seek relative to the read index.
    RelativeOnRead = 2,
    /// Seek relative to the current end of buffered data.
    RelativeOnWrite = 3,
}

/// Packet descriptor / frame header.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    /// Payload length in bytes.
    pub length: u32,
    /// The channel this frame belongs to, or [`CONTROL_CHANNEL`] for a
    /// control packet.
    pub channel: u32,
    /// Signed seek offset for memblock frames.
    pub offset: i64,
    /// Seek mode and SHM markers.
    pub flags: DescriptorFlags,
}

impl Descriptor {
    /// The seek mode encoded in the low flag byte of a memblock frame.
    pub fn seek_mode(&self) -> Result<SeekMode, ProtocolError> {
        let raw = self.flags.bits() & DescriptorFlags::SEEK_MASK.bits();
        SeekMode::from_u32(raw)
            .ok_or_else(|| ProtocolError::Invalid(format!("invalid seek mode {}", raw)))
    }

    /// Whether this frame is an SHM release or revoke notification.
    pub fn shm_marker(&self) -> Option<ShmMarker> {
        let high = self.flags.bits() & DescriptorFlags::SHM_REVOKE.bits();
        if high == DescriptorFlags::SHM_REVOKE.bits() {
            Some(ShmMarker::Revoke)
        } else if high == DescriptorFlags::SHM_RELEASE.bits() {
            Some(ShmMarker::Release)
        } else {
            None
        }
    }
}

/// Shared-pool block lifecycle notifications carried as special frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMarker {
    /// The receiver is done with the block; the sender may reuse it.
    Release,
    /// The sender freed the block; the receiver must stop resolving it.
    Revoke,
}

/// Read a message header from an input stream.
pub fn read_descriptor<R: Read>(r: &mut R) -> Result<Descriptor, ProtocolError> {
    use byteorder::ReadBytesExt;

    let length = r.read_u32::<NetworkEndian>()?;
    let channel = r.read_u32::<NetworkEndian>()?;
    let offset = r.read_i64::<NetworkEndian>()?;
    let flags = r.read_u32::<NetworkEndian>()?;

    Ok(Descriptor {
        length,
        channel,
        offset,
        flags: DescriptorFlags::from_bits_truncate(flags),
    })
}

/// Write a message header to an output stream.
pub fn write_descriptor<W: Write>(w: &mut W, desc: &Descriptor) -> Result<(), ProtocolError> {
    use byteorder::WriteBytesExt;

    w.write_u32::<NetworkEndian>(desc.length)?;
    w.write_u32::<NetworkEndian>(desc.channel)?;
    w.write_i64::<NetworkEndian>(desc.offset)?;
    w.write_u32::<NetworkEndian>(desc.flags.bits())?;

    Ok(())
}

/// Encodes a message header into a fixed buffer.
pub fn encode_descriptor(buf: &mut [u8; DESCRIPTOR_SIZE], desc: &Descriptor) {
    buf[0..4].copy_from_slice(&desc.length.to_be_bytes());
    buf[4..8].copy_from_slice(&desc.channel.to_be_bytes());
    buf[8..16].copy_from_slice(&desc.offset.to_be_bytes());
    buf[16..20].copy_from_slice(&desc.flags.bits().to_be_bytes());
}

/// Reads a command message from an input stream.
pub fn read_command_message<R: BufRead>(
    r: &mut R,
    protocol_version: u16,
) -> Result<(u32, Command), ProtocolError> {
    let desc = read_descriptor(r)?;
    Command::read_tag_prefixed(&mut r.take(desc.length as u64), protocol_version)
}

/// Writes a command message to an output stream.
pub fn write_command_message<W: Write>(
    w: &mut W,
    seq: u32,
    command: &Command,
    protocol_version: u16,
) -> Result<(), ProtocolError> {
    let mut buf = Cursor::new(Vec::new());
    command.write_tag_prefixed(seq, &mut buf, protocol_version)?;

    let length = buf
        .position()
        .try_into()
        .map_err(|_| ProtocolError::Invalid("message payload greater than 4gb".to_string()))?;

    let desc = Descriptor {
        length,
        channel: CONTROL_CHANNEL,
        offset: 0,
        flags: DescriptorFlags::empty(),
    };

    write_descriptor(w, &desc)?;
    w.write_all(buf.into_inner().as_slice())?;

    Ok(())
}

/// Encodes a command message into a buffer, returning the number of bytes
/// written. Avoids the temporary allocation of [`write_command_message`].
pub fn encode_command_message<T: AsRef<[u8]>>(
    seq: u32,
    command: &Command,
    buf: T,
    protocol_version: u16,
) -> Result<usize, ProtocolError>
where
    Cursor<T>: Seek + Write,
{
    let mut cursor = Cursor::new(buf);
    cursor.seek(SeekFrom::Start(DESCRIPTOR_SIZE as u64))?;

    command.write_tag_prefixed(seq, &mut cursor, protocol_version)?;
    let length: u32 = (cursor.position() - DESCRIPTOR_SIZE as u64)
        .try_into()
        .map_err(|_| ProtocolError::Invalid("message payload greater than 4gb".to_string()))?;

    let desc = Descriptor {
        length,
        channel: CONTROL_CHANNEL,
        offset: 0,
        flags: DescriptorFlags::empty(),
    };

    cursor.set_position(0);
    write_descriptor(&mut cursor, &desc)?;

    Ok(length as usize + DESCRIPTOR_SIZE)
}

/// Reads reply data from a server.
pub fn read_reply_message<T: CommandReply>(
    r: &mut impl BufRead,
    protocol_version: u16,
) -> Result<(u32, T), ProtocolError> {
    let desc = read_descriptor(r)?;

    let mut r = r.take(desc.length as u64);
    let mut ts = TagStructReader::new(&mut r, protocol_version);
    let (cmd, seq) = (ts.read_enum()?, ts.read_u32()?);

    match cmd {
        CommandTag::Error => {
            let code = ts.read_enum()?;
            Err(ProtocolError::ServerError(code))
        }
        CommandTag::Reply => Ok((seq, T::read(&mut ts, protocol_version)?)),
        _ => Err(ProtocolError::UnexpectedCommand(cmd)),
    }
}

/// Writes reply data to a client.
pub fn write_reply_message<W: Write, R: CommandReply>(
    w: &mut W,
    seq: u32,
    reply: &R,
    protocol_version: u16,
) -> Result<(), ProtocolError> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut ts = TagStructWriter::new(&mut buf, protocol_version);
        ts.write_u32(CommandTag::Reply as u32)?;
        ts.write_u32(seq)?;
        ts.write(reply)?;
    }

    let length = buf
        .position()
        .try_into()
        .map_err(|_| ProtocolError::Invalid("message payload greater than 4gb".to_string()))?;

    let desc = Descriptor {
        length,
        channel: CONTROL_CHANNEL,
        offset: 0,
        flags: DescriptorFlags::empty(),
    };

    write_descriptor(w, &desc)?;
    w.write_all(buf.into_inner().as_slice())?;

    Ok(())
}

/// Reads an ack (an empty reply), returning its tag.
pub fn read_ack_message(r: &mut impl BufRead) -> Result<u32, ProtocolError> {
    let desc = read_descriptor(r)?;
    let mut r = r.take(desc.length as u64);

    // Protocol version doesn't matter for this.
    let mut ts = TagStructReader::new(&mut r, MAX_VERSION);
    let (cmd, seq) = (ts.read_enum()?, ts.read_u32()?);

    match cmd {
        CommandTag::Error => {
            let code = ts.read_enum()?;
            Err(ProtocolError::ServerError(code))
        }
        CommandTag::Reply => Ok(seq),
        _ => Err(ProtocolError::UnexpectedCommand(cmd)),
    }
}

/// Write an ack (an empty reply) to a client.
pub fn write_ack_message<W: Write>(w: &mut W, seq: u32) -> Result<(), ProtocolError> {
    let desc = Descriptor {
        length: 10, // Two tagged u32s.
        channel: CONTROL_CHANNEL,
        offset: 0,
        flags: DescriptorFlags::empty(),
    };

    write_descriptor(w, &desc)?;

    let mut ts = TagStructWriter::new(w, MAX_VERSION);
    ts.write_u32(CommandTag::Reply as u32)?;
    ts.write_u32(seq)?;

    Ok(())
}

/// Write an error reply to a client.
pub fn write_error<W: Write>(w: &mut W, seq: u32, code: ErrorCode) -> Result<(), ProtocolError> {
    let desc = Descriptor {
        length: 15, // Three tagged u32s.
        channel: CONTROL_CHANNEL,
        offset: 0,
        flags: DescriptorFlags::empty(),
    };

    write_descriptor(w, &desc)?;

    let mut ts = TagStructWriter::new(w, MAX_VERSION);
    ts.write_u32(CommandTag::Error as u32)?;
    ts.write_u32(seq)?;
    ts.write_u32(code as u32)?;

    Ok(())
}

/// Writes a stream audio frame.
pub fn write_memblock<W: Write>(
    w: &mut W,
    channel: u32,
    offset: i64,
    seek: SeekMode,
    data: &[u8],
) -> Result<(), ProtocolError> {
    let desc = Descriptor {
        length: data.len() as u32,
        channel,
        offset,
        flags: DescriptorFlags::from_bits_retain(seek as u32),
    };

    write_descriptor(w, &desc)?;
    w.write_all(data)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn descriptor_roundtrip() -> anyhow::Result<()> {
        let desc = Descriptor {
            length: 512,
            channel: 3,
            offset: -4096,
            flags: DescriptorFlags::from_bits_retain(SeekMode::RelativeOnRead as u32),
        };

        let mut buf = Vec::new();
        write_descriptor(&mut buf, &desc)?;
        assert_eq!(buf.len(), DESCRIPTOR_SIZE);

        let desc2 = read_descriptor(&mut Cursor::new(&buf))?;
        assert_eq!(desc2.length, desc.length);
        assert_eq!(desc2.channel, desc.channel);
        assert_eq!(desc2.offset, desc.offset);
        assert_eq!(desc2.seek_mode()?, SeekMode::RelativeOnRead);
        assert_eq!(desc2.shm_marker(), None);

        Ok(())
    }

    #[test]
    fn shm_markers() {
        let desc = Descriptor {
            length: 0,
            channel: 0,
            offset: 0,
            flags: DescriptorFlags::SHM_RELEASE,
        };
        assert_eq!(desc.shm_marker(), Some(ShmMarker::Release));

        let desc = Descriptor {
            flags: DescriptorFlags::SHM_REVOKE,
            ..desc
        };
        assert_eq!(desc.shm_marker(), Some(ShmMarker::Revoke));
    }

    #[test]
    fn error_message() -> anyhow::Result<()> {
        let mut buf = Vec::new();
        write_error(&mut buf, 42, ErrorCode::NoEntity)?;

        let mut cursor = Cursor::new(&buf);
        match read_ack_message(&mut cursor) {
            Err(ProtocolError::ServerError(ErrorCode::NoEntity)) => Ok(()),
            other => anyhow::bail!("unexpected result: {:?}", other),
        }
    }
}
