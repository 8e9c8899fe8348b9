//! Playback streams.

use crate::protocol::{ChannelMap, ChannelVolume, Props, SampleSpec};

use super::memblock::Mempool;
use super::memblockq::{MemBlockQ, NotReadable};
use super::memchunk::MemChunk;
use super::resampler::Resampler;

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created but not yet visible to mixing.
    Init,
    /// Participating in its device's data path.
    Running,
    /// Paused; skipped by mixing, buffered audio retained.
    Corked,
    /// Being torn down.
    Unlinked,
}

/// Identifies the protocol-level owner of a stream, for routing
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOwner {
    /// The owning connection.
    pub connection: u32,
    /// The stream's channel id on that connection.
    pub channel: u32,
}

/// A playback stream attached to exactly one sink.
///
/// Owns the stream's buffered audio and, when the stream's native format
/// differs from the sink's, the resampler that converts between them. The
/// sink pulls audio through [`peek`](Self::peek) and
/// [`drop_bytes`](Self::drop_bytes) during mixing.
pub struct SinkInput {
    /// The stream's stable index.
    pub index: u32,
    /// The stream's name.
    pub name: String,
    /// The sink this input plays into.
    pub sink: u32,
    /// The owning client entity, if any.
    pub client: Option<u32>,
    /// The owning module, for device-internal streams.
    pub owner_module: Option<u32>,
    /// The stream's native sample spec.
    pub sample_spec: SampleSpec,
    /// The stream's native channel map.
    pub channel_map: ChannelMap,
    /// Per-channel software volume.
    pub cvolume: ChannelVolume,
    /// Whether the stream is muted.
    pub muted: bool,
    /// Lifecycle state.
    pub state: StreamState,
    /// The buffered audio, in the stream's native spec.
    pub queue: MemBlockQ,
    /// Sync group id; control operations fan out over streams sharing one.
    pub syncid: u32,
    /// The stream may not be moved to another sink.
    pub no_move: bool,
    /// The stream may change its sample rate at runtime.
    pub variable_rate: bool,
    /// Whether audio flowed at the last pull; drives the underflow/started
    /// edge notifications.
    pub playing: bool,
    /// Pending drain request tag, acknowledged once everything has played.
    pub drain_tag: Option<u32>,
    /// Kill the stream when its queue runs dry (sample cache playback).
    pub kill_when_drained: bool,
    /// The protocol owner, for notifications. `None` for internal streams.
    pub owner: Option<StreamOwner>,
    /// Additional metadata.
    pub props: Props,
    /// Request credit already granted to the client but not yet consumed.
    pub requested_bytes: usize,

    resampler: Option<Resampler>,
    resampled: Option<MemChunk>,
}

impl SinkInput {
    /// Wires up the conversion path. Passing `None` removes it.
    pub fn set_resampler(&mut self, resampler: Option<Resampler>) {
        self.resampler = resampler;
        self.resampled = None;
    }

    /// Whether a resampler is interposed between the queue and the sink.
    pub fn has_resampler(&self) -> bool {
        self.resampler.is_some()
    }

    /// The negotiated resample method, if any.
    pub fn resample_method(&self) -> Option<&'static str> {
        self.resampler.as_ref().map(|r| r.method().name())
    }

    /// Creates the stream skeleton; orchestration fills in device wiring.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: u32,
        name: String,
        sink: u32,
        sample_spec: SampleSpec,
        channel_map: ChannelMap,
        cvolume: ChannelVolume,
        queue: MemBlockQ,
        syncid: u32,
    ) -> Self {
        Self {
            index,
            name,
            sink,
            client: None,
            owner_module: None,
            sample_spec,
            channel_map,
            cvolume,
            muted: false,
            state: StreamState::Init,
            queue,
            syncid,
            no_move: false,
            variable_rate: false,
            playing: false,
            drain_tag: None,
            kill_when_drained: false,
            owner: None,
            props: Props::new(),
            requested_bytes: 0,
            resampler: None,
            resampled: None,
        }
    }

    /// Returns the next chunk of audio in the *sink's* sample spec, at most
    /// `limit` bytes of upstream data per conversion.
    ///
    /// Corked and initializing streams never produce audio.
    pub fn peek(&mut self, limit: usize, pool: &Mempool) -> Result<MemChunk, NotReadable> {
        if self.state != StreamState::Running {
            return Err(NotReadable::Empty);
        }

        match &mut self.resampler {
            None => self.queue.peek(),
            Some(_) => {
                if self.resampled.is_none() {
                    let want = self.resampler.as_ref().unwrap().request(limit);
                    let mut chunk = self.queue.peek()?;
                    chunk.truncate(want.max(self.queue.base()));

                    // The upstream bytes are consumed now; drop accounting
                    // below happens in the sink's domain.
                    let consumed = chunk.length;
                    let converted = self.resampler.as_mut().unwrap().run(&chunk, pool);
                    self.queue
                        .drop_bytes(consumed)
                        .expect("peek returned an unaligned chunk");

                    if converted.is_empty() {
                        return Err(NotReadable::Empty);
                    }

                    self.resampled = Some(converted);
                }

                Ok(self.resampled.clone().unwrap())
            }
        }
    }

    /// Consumes `n` bytes of the stream, where `n` is in sink-domain bytes
    /// previously returned by [`peek`](Self::peek).
    pub fn drop_bytes(&mut self, n: usize) {
        match &mut self.resampled {
            Some(chunk) => {
                let n = n.min(chunk.length);
                chunk.consume(n);
                if chunk.is_empty() {
                    self.resampled = None;
                }
            }
            None => {
                let n = n.min(self.queue.len());
                let n = n - n % self.queue.base();
                if n > 0 {
                    self.queue
                        .drop_bytes(n)
                        .expect("drop length aligned to base");
                }
            }
        }
    }

    /// Whether any audio is pending, including already-converted bytes.
    pub fn has_pending(&self) -> bool {
        self.resampled.is_some() || !self.queue.is_empty()
    }

    /// Buffered bytes in the stream's native spec.
    pub fn buffered_bytes(&self) -> usize {
        self.queue.len()
            + self
                .resampled
                .as_ref()
                .map(|c| c.length)
                .unwrap_or(0)
    }

    /// The stream's queue latency, in microseconds.
    pub fn latency_usec(&self) -> u64 {
        self.sample_spec.bytes_to_usec(self.queue.len())
    }

    /// Discards converted-but-unplayed audio, e.g. on flush or move.
    pub fn discard_converted(&mut self) {
        self.resampled = None;
        if let Some(r) = &mut self.resampler {
            r.reset();
        }
    }

    /// Applies a rate change for variable-rate streams.
    pub fn update_rate(&mut self, rate: u32) {
        self.sample_spec.rate = rate;
        if let Some(r) = &mut self.resampler {
            r.set_input_rate(rate);
        }
        self.resampled = None;
    }
}

impl std::fmt::Debug for SinkInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkInput")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("sink", &self.sink)
            .field("state", &self.state)
            .field("buffered", &self.queue.len())
            .finish()
    }
}
