//! Packet dispatch: decodes tag-prefixed commands, matches replies to
//! outstanding requests, and expires requests whose deadline passed.

use std::collections::HashMap;
use std::io::Cursor;
use std::time::{Duration, Instant};

use crate::protocol::{Command, CommandTag, ErrorCode, ProtocolError};

/// What became of one inbound packet.
#[derive(Debug)]
pub enum Dispatched {
    /// A request from the peer for the caller to act on.
    Request {
        /// The peer's sequence tag, echoed in the reply.
        seq: u32,
        /// The decoded command.
        command: Command,
    },
    /// A reply matching an outstanding request. The payload (everything
    /// after the `(command, seq)` prefix) is handed back raw.
    Reply {
        /// The context stored when the request was registered.
        context: u64,
        /// The reply payload, or the error the peer sent instead.
        result: Result<Vec<u8>, ErrorCode>,
    },
    /// A reply tag nobody was waiting for; the connection is confused.
    Stray(u32),
}

struct Pending {
    context: u64,
    deadline: Option<Instant>,
}

/// The dispatch table for one connection.
pub struct Pdispatch {
    protocol_version: u16,
    pending: HashMap<u32, Pending>,
}

impl Pdispatch {
    /// Creates a dispatcher speaking the given protocol version.
    pub fn new(protocol_version: u16) -> Self {
        Self {
            protocol_version,
            pending: HashMap::new(),
        }
    }

    /// Updates the version used to decode subsequent packets (after
    /// negotiation).
    pub fn set_protocol_version(&mut self, version: u16) {
        self.protocol_version = version;
    }

    /// The negotiated version.
    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    /// Registers an outstanding reply-expected tag with an optional
    /// deadline and a caller context value.
    pub fn expect_reply(&mut self, seq: u32, context: u64, timeout: Option<Duration>) {
        self.pending.insert(
            seq,
            Pending {
                context,
                deadline: timeout.map(|t| Instant::now() + t),
            },
        );
    }

    /// Whether any reply-expected tags are outstanding.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Routes one inbound packet.
    pub fn dispatch(&mut self, payload: &[u8]) -> Result<Dispatched, ProtocolError> {
        let mut cursor = Cursor::new(payload);

        // Peek at the command id to route replies by tag before the full
        // command parse.
        let mut ts =
            crate::protocol::TagStructReader::new(&mut cursor, self.protocol_version);
        let raw: u32 = ts.read_u32()?;
        let seq = ts.read_u32()?;

        if raw == CommandTag::Reply as u32 || raw == CommandTag::Error as u32 {
            let result = if raw == CommandTag::Error as u32 {
                Err(ts.read_enum()?)
            } else {
                let consumed = cursor.position() as usize;
                Ok(payload[consumed..].to_vec())
            };

            return match self.pending.remove(&seq) {
                Some(pending) => Ok(Dispatched::Reply {
                    context: pending.context,
                    result,
                }),
                None => Ok(Dispatched::Stray(seq)),
            };
        }

        let mut cursor = Cursor::new(payload);
        let (seq, command) =
            Command::read_tag_prefixed(&mut cursor, self.protocol_version)?;

        Ok(Dispatched::Request { seq, command })
    }

    /// Collects expired entries; each is delivered exactly once, as if the
    /// peer had answered with a synthetic [`CommandTag::Timeout`].
    pub fn take_expired(&mut self, now: Instant) -> Vec<(u32, u64)> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
            .map(|(seq, _)| *seq)
            .collect();

        expired
            .into_iter()
            .map(|seq| {
                let pending = self.pending.remove(&seq).unwrap();
                (seq, pending.context)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::protocol::{write_command_message, write_error, Command, MAX_VERSION};

    use super::*;

    fn packet(cmd: &Command, seq: u32) -> Vec<u8> {
        let mut framed = Vec::new();
        write_command_message(&mut framed, seq, cmd, MAX_VERSION).unwrap();
        framed[crate::protocol::DESCRIPTOR_SIZE..].to_vec()
    }

    #[test]
    fn requests_pass_through() -> anyhow::Result<()> {
        let mut pd = Pdispatch::new(MAX_VERSION);

        let dispatched = pd.dispatch(&packet(&Command::Stat, 9))?;
        assert_matches!(
            dispatched,
            Dispatched::Request {
                seq: 9,
                command: Command::Stat
            }
        );

        Ok(())
    }

    #[test]
    fn replies_match_by_tag() -> anyhow::Result<()> {
        let mut pd = Pdispatch::new(MAX_VERSION);
        pd.expect_reply(4, 0xfeed, None);

        let dispatched = pd.dispatch(&packet(&Command::Reply, 4))?;
        assert_matches!(
            dispatched,
            Dispatched::Reply {
                context: 0xfeed,
                result: Ok(_)
            }
        );
        assert!(!pd.has_pending());

        Ok(())
    }

    #[test]
    fn errors_match_by_tag() -> anyhow::Result<()> {
        let mut pd = Pdispatch::new(MAX_VERSION);
        pd.expect_reply(5, 1, None);

        let mut framed = Vec::new();
        write_error(&mut framed, 5, ErrorCode::NoEntity)?;
        let payload = framed[crate::protocol::DESCRIPTOR_SIZE..].to_vec();

        let dispatched = pd.dispatch(&payload)?;
        assert_matches!(
            dispatched,
            Dispatched::Reply {
                result: Err(ErrorCode::NoEntity),
                ..
            }
        );

        Ok(())
    }

    #[test]
    fn stray_replies_are_flagged() -> anyhow::Result<()> {
        let mut pd = Pdispatch::new(MAX_VERSION);
        let dispatched = pd.dispatch(&packet(&Command::Reply, 77))?;
        assert_matches!(dispatched, Dispatched::Stray(77));
        Ok(())
    }

    #[test]
    fn deadlines_expire() {
        let mut pd = Pdispatch::new(MAX_VERSION);
        pd.expect_reply(1, 10, Some(Duration::from_millis(1)));
        pd.expect_reply(2, 20, None);

        let expired = pd.take_expired(Instant::now() + Duration::from_millis(5));
        assert_eq!(expired, vec![(1, 10)]);
        assert!(pd.has_pending());

        // Delivered exactly once.
        assert!(pd
            .take_expired(Instant::now() + Duration::from_secs(1))
            .is_empty());
    }
}
