//! Record streams.

use crate::protocol::{ChannelMap, Props, SampleSpec};

use super::memblock::Mempool;
use super::memblockq::MemBlockQ;
use super::memchunk::MemChunk;
use super::resampler::Resampler;
use super::sink_input::{StreamOwner, StreamState};

/// A capture stream attached to exactly one source.
///
/// Mirrors [`super::sink_input::SinkInput`] with the direction reversed: the
/// source pushes chunks in, and the protocol layer drains the queue one
/// fragment at a time.
pub struct SourceOutput {
    /// The stream's stable index.
    pub index: u32,
    /// The stream's name.
    pub name: String,
    /// The source this output captures from.
    pub source: u32,
    /// The owning client entity, if any.
    pub client: Option<u32>,
    /// The owning module, for device-internal streams.
    pub owner_module: Option<u32>,
    /// The stream's native sample spec.
    pub sample_spec: SampleSpec,
    /// The stream's native channel map.
    pub channel_map: ChannelMap,
    /// Lifecycle state.
    pub state: StreamState,
    /// Captured audio waiting to be shipped, in the stream's native spec.
    pub queue: MemBlockQ,
    /// The unit captured audio is shipped in, in bytes.
    pub fragment_size: usize,
    /// Capture the pre-mix signal of this sink input instead of the
    /// source's mixed signal. Streams bound this way cannot be moved.
    pub direct_on_input: Option<u32>,
    /// The stream may not be moved to another source.
    pub no_move: bool,
    /// The protocol owner, for notifications. `None` for internal streams.
    pub owner: Option<StreamOwner>,
    /// Additional metadata.
    pub props: Props,

    resampler: Option<Resampler>,
}

impl SourceOutput {
    /// Creates the stream skeleton; orchestration fills in device wiring.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: u32,
        name: String,
        source: u32,
        sample_spec: SampleSpec,
        channel_map: ChannelMap,
        queue: MemBlockQ,
        fragment_size: usize,
    ) -> Self {
        Self {
            index,
            name,
            source,
            client: None,
            owner_module: None,
            sample_spec,
            channel_map,
            state: StreamState::Init,
            queue,
            fragment_size,
            direct_on_input: None,
            no_move: false,
            owner: None,
            props: Props::new(),
            resampler: None,
        }
    }

    /// Wires up the conversion path. Passing `None` removes it.
    pub fn set_resampler(&mut self, resampler: Option<Resampler>) {
        self.resampler = resampler;
    }

    /// The negotiated resample method, if any.
    pub fn resample_method(&self) -> Option<&'static str> {
        self.resampler.as_ref().map(|r| r.method().name())
    }

    /// Accepts a chunk from the source, converting it into the stream's
    /// native spec. Returns the number of oldest bytes dropped on overflow.
    pub fn push(&mut self, chunk: &MemChunk, pool: &Mempool) -> usize {
        if self.state != StreamState::Running {
            return 0;
        }

        let converted;
        let chunk = match &mut self.resampler {
            Some(r) => {
                converted = r.run(chunk, pool);
                if converted.is_empty() {
                    return 0;
                }
                &converted
            }
            None => chunk,
        };

        self.queue.push_align(chunk, pool).unwrap_or(0)
    }

    /// The stream's queue latency, in microseconds.
    pub fn latency_usec(&self) -> u64 {
        self.sample_spec.bytes_to_usec(self.queue.len())
    }
}

impl std::fmt::Debug for SourceOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceOutput")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("source", &self.source)
            .field("state", &self.state)
            .field("buffered", &self.queue.len())
            .finish()
    }
}
