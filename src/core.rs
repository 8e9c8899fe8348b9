//! The audio engine: entities, mixing, and the notification queue.
//!
//! Everything here runs on the main loop thread; entities reference each
//! other by stable index and are only mutated between poll iterations.

pub mod idxset;
pub mod memblock;
pub mod memblockq;
pub mod memchunk;
pub mod mix;
pub mod namereg;
pub mod resampler;
pub mod sample;
pub mod scache;
pub mod sink;
pub mod sink_input;
pub mod source;
pub mod source_output;

use std::collections::VecDeque;

use log::{debug, info, warn};

use crate::protocol::{
    ChannelMap, ChannelVolume, Props, SampleSpec, SeekMode, StatInfo,
    SubscriptionEvent, SubscriptionEventFacility, SubscriptionEventType,
};

use idxset::IdxSet;
use memblock::Mempool;
use memblockq::MemBlockQ;
use memchunk::MemChunk;
use mix::MixInput;
use namereg::{NameKind, NameReg};
use resampler::{ResampleMethod, Resampler};
use sample::{silence_chunk, silence_memory};
use scache::SampleCache;
use sink::{DeviceState, Sink, MAX_MIX_CHANNELS};
use sink_input::{SinkInput, StreamOwner, StreamState};
use source::Source;
use source_output::SourceOutput;

/// A connected client, as an introspectable entity.
#[derive(Debug)]
pub struct ClientEntry {
    /// The client's stable index.
    pub index: u32,
    /// The protocol the client arrived over.
    pub driver: &'static str,
    /// Client metadata; `application.name` doubles as the display name.
    pub props: Props,
}

/// A loaded module. Modules own devices; unloading one tears its devices
/// down.
#[derive(Debug)]
pub struct ModuleEntry {
    /// The module's stable index.
    pub index: u32,
    /// The module implementation name.
    pub name: String,
    /// The argument string it was loaded with.
    pub argument: String,
    /// Sinks created by this module.
    pub sinks: Vec<u32>,
    /// Sources created by this module.
    pub sources: Vec<u32>,
}

/// Per-stream notifications addressed to a protocol connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The server wants `bytes` more of playback data.
    Request { channel: u32, bytes: u32 },
    /// A write overflowed the stream buffer.
    Overflow { channel: u32 },
    /// The stream ran dry while playing.
    Underflow { channel: u32 },
    /// Audio started (or resumed) flowing.
    Started { channel: u32 },
    /// The playback stream was killed by the server.
    PlaybackKilled { channel: u32 },
    /// The record stream was killed by the server.
    RecordKilled { channel: u32 },
    /// A pending drain completed.
    DrainDone { tag: u32 },
    /// A pending drain can never complete (the stream went away).
    DrainFailed { tag: u32 },
    /// The stream's device was suspended or resumed.
    Suspended {
        channel: u32,
        playback: bool,
        suspended: bool,
    },
    /// The stream was moved to another device.
    Moved {
        channel: u32,
        playback: bool,
        device_index: u32,
        device_name: String,
        device_suspended: bool,
    },
}

/// An engine notification, drained by the server after every dispatch or
/// render.
#[derive(Debug)]
pub enum CoreEvent {
    /// An entity changed; fanned out to subscribed connections.
    Subscription(SubscriptionEvent),
    /// A per-stream notification for one connection.
    Stream {
        /// The connection that owns the stream.
        connection: u32,
        /// What happened.
        event: StreamEvent,
    },
}

/// Errors from entity orchestration, mapped onto wire error codes by the
/// protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// The addressed entity does not exist.
    NoEntity,
    /// An argument failed validation.
    Invalid,
    /// The entity may not be operated on this way.
    NotSupported,
    /// A name is already taken.
    Exist,
}

/// The engine: owns every entity and the notification queue.
pub struct Core {
    /// The block factory backing all audio allocations.
    pub pool: Mempool,
    /// All sinks.
    pub sinks: IdxSet<Sink>,
    /// All sources, including sink monitors.
    pub sources: IdxSet<Source>,
    /// All playback streams.
    pub sink_inputs: IdxSet<SinkInput>,
    /// All record streams.
    pub source_outputs: IdxSet<SourceOutput>,
    /// All connected clients.
    pub clients: IdxSet<ClientEntry>,
    /// All loaded modules.
    pub modules: IdxSet<ModuleEntry>,
    /// The name registry.
    pub namereg: NameReg,
    /// The sample cache.
    pub scache: SampleCache,
    /// The default sample spec for new devices.
    pub default_spec: SampleSpec,
    /// Pending notifications.
    pub events: VecDeque<CoreEvent>,
    /// Set by the Exit command; the server shuts down when it sees this.
    pub quit_requested: bool,

    default_sink_name: Option<String>,
    default_source_name: Option<String>,
}

impl Core {
    /// Creates an empty engine.
    pub fn new(default_spec: SampleSpec) -> Self {
        Self {
            pool: Mempool::new(),
            sinks: IdxSet::new(),
            sources: IdxSet::new(),
            sink_inputs: IdxSet::new(),
            source_outputs: IdxSet::new(),
            clients: IdxSet::new(),
            modules: IdxSet::new(),
            namereg: NameReg::new(),
            scache: SampleCache::new(),
            default_spec,
            events: VecDeque::new(),
            quit_requested: false,
            default_sink_name: None,
            default_source_name: None,
        }
    }

    fn subscription(&mut self, facility: SubscriptionEventFacility, ty: SubscriptionEventType, index: u32) {
        self.events
            .push_back(CoreEvent::Subscription(SubscriptionEvent {
                facility,
                event_type: ty,
                index: Some(index),
            }));
    }

    fn stream_event(&mut self, owner: Option<StreamOwner>, event: StreamEvent) {
        if let Some(owner) = owner {
            self.events.push_back(CoreEvent::Stream {
                connection: owner.connection,
                event,
            });
        }
    }

    /// The memory statistics for the `Stat` command.
    pub fn stat(&self) -> StatInfo {
        let snap = self.pool.snapshot();
        StatInfo {
            n_allocated: snap.n_allocated as u32,
            allocated_bytes: snap.allocated_bytes as u32,
            n_accumulated: snap.n_accumulated as u32,
            accumulated_bytes: snap.accumulated_bytes as u32,
            sample_cache_bytes: self.scache.total_bytes() as u32,
        }
    }

    // === Devices ===

    /// Creates a sink plus its monitor source. Returns the sink index, or
    /// `None` when `fail` is set and the name is taken.
    pub fn create_sink(
        &mut self,
        name: &str,
        description: &str,
        spec: SampleSpec,
        channel_map: ChannelMap,
        driver: &'static str,
        owner_module: Option<u32>,
        fail: bool,
    ) -> Option<u32> {
        let sink_index = self.sinks.put_with(|index| Sink {
            index,
            name: String::new(),
            description: description.to_string(),
            sample_spec: spec,
            channel_map,
            cvolume: ChannelVolume::norm(spec.channels as usize),
            muted: false,
            state: DeviceState::Running,
            monitor_source: idxset::INVALID_INDEX,
            inputs: Vec::new(),
            owner_module,
            driver_latency_usec: 0,
            driver,
            props: Props::new(),
        });

        let name = match self.namereg.register(NameKind::Sink, name, sink_index, fail) {
            Some(name) => name,
            None => {
                self.sinks.remove(sink_index);
                return None;
            }
        };

        let monitor_name = format!("{}.monitor", name);
        let monitor = self.create_source_inner(
            &monitor_name,
            &format!("Monitor of {}", description),
            spec,
            channel_map,
            driver,
            owner_module,
            Some(sink_index),
        );

        {
            let sink = self.sinks.get_mut(sink_index).unwrap();
            sink.name = name.clone();
            sink.monitor_source = monitor;
        }

        if self.default_sink_name.is_none() {
            self.default_sink_name = Some(name.clone());
        }

        info!("sink: created {} \"{}\" with sample spec {}", sink_index, name, spec);
        self.subscription(
            SubscriptionEventFacility::Sink,
            SubscriptionEventType::New,
            sink_index,
        );

        Some(sink_index)
    }

    fn create_source_inner(
        &mut self,
        name: &str,
        description: &str,
        spec: SampleSpec,
        channel_map: ChannelMap,
        driver: &'static str,
        owner_module: Option<u32>,
        monitor_of: Option<u32>,
    ) -> u32 {
        let index = self.sources.put_with(|index| Source {
            index,
            name: String::new(),
            description: description.to_string(),
            sample_spec: spec,
            channel_map,
            cvolume: ChannelVolume::norm(spec.channels as usize),
            muted: false,
            state: DeviceState::Running,
            monitor_of,
            outputs: Vec::new(),
            owner_module,
            driver_latency_usec: 0,
            driver,
            props: Props::new(),
        });

        // A collision here only appends a suffix; device modules own their
        // monitor names.
        let name = self
            .namereg
            .register(NameKind::Source, name, index, false)
            .unwrap();
        self.sources.get_mut(index).unwrap().name = name.clone();

        if self.default_source_name.is_none() {
            self.default_source_name = Some(name.clone());
        }

        info!("source: created {} \"{}\"", index, name);
        self.subscription(
            SubscriptionEventFacility::Source,
            SubscriptionEventType::New,
            index,
        );

        index
    }

    /// Creates a standalone capture source.
    pub fn create_source(
        &mut self,
        name: &str,
        description: &str,
        spec: SampleSpec,
        channel_map: ChannelMap,
        driver: &'static str,
        owner_module: Option<u32>,
    ) -> u32 {
        self.create_source_inner(name, description, spec, channel_map, driver, owner_module, None)
    }

    /// Tears down a sink: kills its inputs, removes its monitor.
    pub fn remove_sink(&mut self, index: u32) {
        let Some(sink) = self.sinks.get_mut(index) else {
            return;
        };
        sink.state = DeviceState::Unlinked;

        for input in sink.inputs.clone() {
            self.sink_input_kill(input);
        }

        let sink = self.sinks.remove(index).unwrap();
        self.remove_source(sink.monitor_source);
        self.namereg.unregister(NameKind::Sink, &sink.name);
        if self.default_sink_name.as_deref() == Some(&sink.name) {
            self.default_sink_name = self
                .sinks
                .first_index()
                .and_then(|i| self.sinks.get(i))
                .map(|s| s.name.clone());
        }

        info!("sink: freed {} \"{}\"", index, sink.name);
        self.subscription(
            SubscriptionEventFacility::Sink,
            SubscriptionEventType::Removed,
            index,
        );
    }

    /// Tears down a source, killing its outputs.
    pub fn remove_source(&mut self, index: u32) {
        let Some(source) = self.sources.get_mut(index) else {
            return;
        };
        source.state = DeviceState::Unlinked;

        for output in source.outputs.clone() {
            self.source_output_kill(output);
        }

        let source = self.sources.remove(index).unwrap();
        self.namereg.unregister(NameKind::Source, &source.name);
        if self.default_source_name.as_deref() == Some(&source.name) {
            self.default_source_name = self
                .sources
                .first_index()
                .and_then(|i| self.sources.get(i))
                .map(|s| s.name.clone());
        }

        info!("source: freed {} \"{}\"", index, source.name);
        self.subscription(
            SubscriptionEventFacility::Source,
            SubscriptionEventType::Removed,
            index,
        );
    }

    /// The current default sink.
    pub fn default_sink(&self) -> Option<u32> {
        let name = self.default_sink_name.as_deref()?;
        self.namereg.get(NameKind::Sink, name)
    }

    /// The current default source.
    pub fn default_source(&self) -> Option<u32> {
        let name = self.default_source_name.as_deref()?;
        self.namereg.get(NameKind::Source, name)
    }

    /// The default sink's name, for introspection.
    pub fn default_sink_name(&self) -> Option<&str> {
        self.default_sink_name.as_deref()
    }

    /// The default source's name, for introspection.
    pub fn default_source_name(&self) -> Option<&str> {
        self.default_source_name.as_deref()
    }

    /// Replaces the default sink.
    pub fn set_default_sink(&mut self, name: Option<&str>) -> Result<(), CoreError> {
        if let Some(name) = name {
            if self.namereg.get(NameKind::Sink, name).is_none() {
                return Err(CoreError::NoEntity);
            }
            self.default_sink_name = Some(name.to_string());
        } else {
            self.default_sink_name = None;
        }

        Ok(())
    }

    /// Replaces the default source.
    pub fn set_default_source(&mut self, name: Option<&str>) -> Result<(), CoreError> {
        if let Some(name) = name {
            if self.namereg.get(NameKind::Source, name).is_none() {
                return Err(CoreError::NoEntity);
            }
            self.default_source_name = Some(name.to_string());
        } else {
            self.default_source_name = None;
        }

        Ok(())
    }

    /// Resolves a sink reference: explicit index, name, or the default.
    pub fn resolve_sink(&self, index: Option<u32>, name: Option<&str>) -> Option<u32> {
        match (index, name) {
            (Some(index), _) => self.sinks.contains(index).then_some(index),
            (None, Some(name)) => self.namereg.get(NameKind::Sink, name),
            (None, None) => self.default_sink(),
        }
    }

    /// Resolves a source reference: explicit index, name, or the default.
    ///
    /// With neither an index nor a name, falls back to the default source,
    /// or the default sink's monitor.
    pub fn resolve_source(&self, index: Option<u32>, name: Option<&str>) -> Option<u32> {
        match (index, name) {
            (Some(index), _) => self.sources.contains(index).then_some(index),
            (None, Some(name)) => self.namereg.get(NameKind::Source, name),
            (None, None) => self.default_source().or_else(|| {
                self.default_sink()
                    .and_then(|s| self.sinks.get(s))
                    .map(|s| s.monitor_source)
            }),
        }
    }

    /// Suspends or resumes a sink, notifying owners of attached streams.
    pub fn sink_suspend(&mut self, index: u32, suspend: bool) -> Result<(), CoreError> {
        let sink = self.sinks.get_mut(index).ok_or(CoreError::NoEntity)?;
        let new_state = if suspend {
            DeviceState::Suspended
        } else {
            DeviceState::Running
        };

        if sink.state == new_state {
            return Ok(());
        }

        sink.state = new_state;
        let inputs = sink.inputs.clone();
        let monitor = sink.monitor_source;

        for input in inputs {
            if let Some(input) = self.sink_inputs.get(input) {
                let owner = input.owner;
                if let Some(owner) = owner {
                    self.stream_event(
                        Some(owner),
                        StreamEvent::Suspended {
                            channel: owner.channel,
                            playback: true,
                            suspended: suspend,
                        },
                    );
                }
            }
        }

        if let Some(source) = self.sources.get_mut(monitor) {
            source.state = if suspend {
                DeviceState::Suspended
            } else {
                DeviceState::Running
            };
        }
        self.notify_source_outputs_suspended(monitor, suspend);

        self.subscription(
            SubscriptionEventFacility::Sink,
            SubscriptionEventType::Changed,
            index,
        );

        Ok(())
    }

    /// Suspends or resumes a standalone source.
    pub fn source_suspend(&mut self, index: u32, suspend: bool) -> Result<(), CoreError> {
        let source = self.sources.get_mut(index).ok_or(CoreError::NoEntity)?;
        if source.monitor_of.is_some() {
            // Monitors follow their sink.
            return Err(CoreError::NotSupported);
        }

        source.state = if suspend {
            DeviceState::Suspended
        } else {
            DeviceState::Running
        };

        self.notify_source_outputs_suspended(index, suspend);
        self.subscription(
            SubscriptionEventFacility::Source,
            SubscriptionEventType::Changed,
            index,
        );

        Ok(())
    }

    fn notify_source_outputs_suspended(&mut self, source: u32, suspend: bool) {
        let outputs = match self.sources.get(source) {
            Some(s) => s.outputs.clone(),
            None => return,
        };

        for output in outputs {
            if let Some(output) = self.source_outputs.get(output) {
                let owner = output.owner;
                if let Some(owner) = owner {
                    self.stream_event(
                        Some(owner),
                        StreamEvent::Suspended {
                            channel: owner.channel,
                            playback: false,
                            suspended: suspend,
                        },
                    );
                }
            }
        }
    }

    /// A sink's total latency: driver latency plus queued audio.
    pub fn sink_latency_usec(&self, index: u32) -> u64 {
        let Some(sink) = self.sinks.get(index) else {
            return 0;
        };

        let queued: u64 = sink
            .inputs
            .iter()
            .filter_map(|&i| self.sink_inputs.get(i))
            .map(|i| i.latency_usec())
            .sum();

        sink.driver_latency_usec + queued
    }

    /// A source's latency as reported by its driver (or its sink's, for
    /// monitors).
    pub fn source_latency_usec(&self, index: u32) -> u64 {
        let Some(source) = self.sources.get(index) else {
            return 0;
        };

        match source.monitor_of {
            Some(sink) => self
                .sinks
                .get(sink)
                .map(|s| s.driver_latency_usec)
                .unwrap_or(0),
            None => source.driver_latency_usec,
        }
    }

    // === Rendering ===

    /// Collects the mixable inputs of a sink, handling the underflow and
    /// started edges.
    fn collect_mix_inputs(
        &mut self,
        sink_index: u32,
        limit: usize,
    ) -> Vec<(u32, MixInput)> {
        let (inputs, sink_channels) = match self.sinks.get(sink_index) {
            Some(sink) => (sink.inputs.clone(), sink.sample_spec.channels as usize),
            None => return Vec::new(),
        };

        let pool = self.pool.clone();
        let mut collected = Vec::new();
        let mut events = Vec::new();

        for index in inputs {
            if collected.len() >= MAX_MIX_CHANNELS {
                break;
            }

            let Some(input) = self.sink_inputs.get_mut(index) else {
                continue;
            };

            if input.state != StreamState::Running {
                continue;
            }

            match input.peek(limit, &pool) {
                Ok(chunk) => {
                    if !input.playing {
                        input.playing = true;
                        if let Some(owner) = input.owner {
                            events.push((owner, StreamEvent::Started { channel: owner.channel }));
                        }
                    }

                    let volume = if input.muted {
                        ChannelVolume::muted(sink_channels)
                    } else {
                        input.cvolume
                    };

                    collected.push((index, MixInput { chunk, volume }));
                }
                Err(_) => {
                    if input.playing {
                        input.playing = false;
                        if let Some(owner) = input.owner {
                            events.push((
                                owner,
                                StreamEvent::Underflow { channel: owner.channel },
                            ));
                        }
                    }
                }
            }
        }

        for (owner, event) in events {
            self.stream_event(Some(owner), event);
        }

        collected
    }

    /// Post-mix accounting: advance each contributor, refill credit, settle
    /// drains, reap drained sample-cache streams.
    fn inputs_drop(&mut self, contributors: &[(u32, MixInput)], consumed: usize) {
        for (index, _) in contributors {
            if let Some(input) = self.sink_inputs.get_mut(*index) {
                input.drop_bytes(consumed);
            }

            self.sink_input_post_pull(*index);
        }
    }

    fn sink_input_post_pull(&mut self, index: u32) {
        let Some(input) = self.sink_inputs.get_mut(index) else {
            return;
        };

        let drained = !input.has_pending();
        if drained {
            if let Some(tag) = input.drain_tag.take() {
                let owner = input.owner;
                self.stream_event(owner, StreamEvent::DrainDone { tag });
            }

            if self.sink_inputs.get(index).map(|i| i.kill_when_drained) == Some(true) {
                debug!("sample playback {} finished", index);
                self.sink_input_kill(index);
                return;
            }
        }

        self.request_bytes(index);
    }

    /// Grants the stream more write credit if its deficit crossed the
    /// minimum request size.
    pub fn request_bytes(&mut self, index: u32) {
        let Some(input) = self.sink_inputs.get_mut(index) else {
            return;
        };

        let missing = input.queue.missing();
        if missing == 0 || missing <= input.requested_bytes {
            return;
        }

        let grant = missing - input.requested_bytes;
        if grant < input.queue.minreq() {
            return;
        }

        input.requested_bytes += grant;
        let owner = input.owner;
        if let Some(owner) = owner {
            self.stream_event(
                Some(owner),
                StreamEvent::Request {
                    channel: owner.channel,
                    bytes: grant as u32,
                },
            );
        }
    }

    /// Renders up to `length` bytes of mixed audio from a sink.
    ///
    /// Returns `None` if no input had data. With a single unity-volume
    /// contributor the input chunk is returned as-is, zero-copy.
    pub fn sink_render(&mut self, sink_index: u32, length: usize) -> Option<MemChunk> {
        let contributors = self.collect_mix_inputs(sink_index, length);
        if contributors.is_empty() {
            return None;
        }

        let sink = self.sinks.get(sink_index)?;
        let spec = sink.sample_spec;
        let master = if sink.muted {
            ChannelVolume::muted(spec.channels as usize)
        } else {
            sink.cvolume
        };
        let monitor = sink.monitor_source;

        let result;
        let consumed;

        if contributors.len() == 1
            && master.is_norm()
            && contributors[0].1.volume.is_norm()
        {
            let mut chunk = contributors[0].1.chunk.clone();
            chunk.truncate(length);
            consumed = chunk.length;
            result = chunk;
        } else if contributors.len() == 1 {
            let mut chunk = contributors[0].1.chunk.clone();
            chunk.truncate(length);
            consumed = chunk.length;

            let volume = contributors[0].1.volume;
            let mut scaled = mix::scaled_copy(&chunk, &spec, &volume, &self.pool);
            mix::volume_memchunk(&mut scaled, &spec, &master);
            result = scaled;
        } else {
            let block = self.pool.allocate(length);
            let written = {
                let mut out = block.data_mut();
                mix::mix(
                    &contributors.iter().map(|(_, m)| clone_mix_input(m)).collect::<Vec<_>>(),
                    &mut out,
                    &spec,
                    &master,
                )
            };

            if written == 0 {
                return None;
            }

            consumed = written;
            result = MemChunk {
                block,
                index: 0,
                length: written,
            };
        }

        self.feed_direct_taps(&contributors, consumed);
        self.inputs_drop(&contributors, consumed);
        self.source_post(monitor, &result);

        Some(result)
    }

    /// Renders into a caller-supplied writable chunk without allocating.
    /// Returns the number of bytes written, or `None` if no input had data.
    pub fn sink_render_into(&mut self, sink_index: u32, target: &mut MemChunk) -> Option<usize> {
        let contributors = self.collect_mix_inputs(sink_index, target.length);
        if contributors.is_empty() {
            return None;
        }

        let sink = self.sinks.get(sink_index)?;
        let spec = sink.sample_spec;
        let master = if sink.muted {
            ChannelVolume::muted(spec.channels as usize)
        } else {
            sink.cvolume
        };
        let monitor = sink.monitor_source;

        let written = {
            let (start, limit) = (target.index, target.length);
            let mut data = target.block.data_mut();
            mix::mix(
                &contributors.iter().map(|(_, m)| clone_mix_input(m)).collect::<Vec<_>>(),
                &mut data[start..start + limit],
                &spec,
                &master,
            )
        };

        if written == 0 {
            return None;
        }

        self.feed_direct_taps(&contributors, written);
        self.inputs_drop(&contributors, written);

        // The device owns the target buffer and will overwrite it on the
        // next cycle; the monitor gets a private copy of the bytes.
        let pool = self.pool.clone();
        let mut rendered = target.clone();
        rendered.truncate(written);
        rendered.make_writable(&pool);
        self.source_post(monitor, &rendered);

        Some(written)
    }

    /// Renders into the whole target, padding with silence where the inputs
    /// ran dry.
    pub fn sink_render_into_full(&mut self, sink_index: u32, target: &mut MemChunk) {
        let spec = match self.sinks.get(sink_index) {
            Some(s) => s.sample_spec,
            None => return,
        };

        let (orig_index, orig_length) = (target.index, target.length);
        let mut done = 0;
        while done < orig_length {
            target.index = orig_index + done;
            target.length = orig_length - done;

            match self.sink_render_into(sink_index, target) {
                Some(n) => done += n,
                None => break,
            }
        }

        target.index = orig_index;
        target.length = orig_length;

        if done < orig_length {
            let start = orig_index + done;
            let end = orig_index + orig_length;
            silence_memory(&mut target.block.data_mut()[start..end], &spec);
        }
    }

    /// Feeds the pre-mix signal of contributing inputs to any record
    /// streams bound directly to them.
    fn feed_direct_taps(&mut self, contributors: &[(u32, MixInput)], consumed: usize) {
        let taps: Vec<(u32, u32)> = self
            .source_outputs
            .iter()
            .filter_map(|(oi, o)| o.direct_on_input.map(|ii| (oi, ii)))
            .collect();
        if taps.is_empty() {
            return;
        }

        let pool = self.pool.clone();
        for (output_index, input_index) in taps {
            if let Some((_, mix_input)) = contributors.iter().find(|(i, _)| *i == input_index) {
                let mut chunk = mix_input.chunk.clone();
                chunk.truncate(consumed);
                if let Some(output) = self.source_outputs.get_mut(output_index) {
                    output.push(&chunk, &pool);
                }
            }
        }
    }

    /// Fans a captured (or monitored) chunk out to every output of a
    /// source.
    pub fn source_post(&mut self, source_index: u32, chunk: &MemChunk) {
        let outputs = match self.sources.get(source_index) {
            Some(source) if source.state == DeviceState::Running => source.outputs.clone(),
            _ => return,
        };

        let pool = self.pool.clone();
        let mut overflowed = Vec::new();
        for index in outputs {
            let Some(output) = self.source_outputs.get_mut(index) else {
                continue;
            };

            if output.direct_on_input.is_some() {
                // Tapped streams get their audio from the pre-mix path.
                continue;
            }

            if output.push(chunk, &pool) > 0 {
                overflowed.push(output.owner);
            }
        }

        for owner in overflowed.into_iter().flatten() {
            self.stream_event(
                Some(owner),
                StreamEvent::Overflow { channel: owner.channel },
            );
        }
    }

    // === Sink inputs ===

    /// Creates a playback stream attached to `sink`. The queue must carry
    /// the stream's native spec.
    #[allow(clippy::too_many_arguments)]
    pub fn create_sink_input(
        &mut self,
        name: &str,
        sink: u32,
        sample_spec: SampleSpec,
        channel_map: ChannelMap,
        cvolume: ChannelVolume,
        muted: bool,
        queue: MemBlockQ,
        syncid: u32,
        props: Props,
    ) -> Result<u32, CoreError> {
        if !sample_spec.is_valid() {
            return Err(CoreError::Invalid);
        }

        let sink_spec = self.sinks.get(sink).ok_or(CoreError::NoEntity)?.sample_spec;

        let index = self.sink_inputs.put_with(|index| {
            let mut input = SinkInput::new(
                index,
                name.to_string(),
                sink,
                sample_spec,
                channel_map,
                cvolume,
                queue,
                syncid,
            );
            input.muted = muted;
            input.props = props;
            input
        });

        if sample_spec != sink_spec {
            let resampler = Resampler::new(&sample_spec, &sink_spec, ResampleMethod::Trivial);
            self.sink_inputs
                .get_mut(index)
                .unwrap()
                .set_resampler(Some(resampler));
        }

        Ok(index)
    }

    /// Makes a created stream visible to mixing and to subscribers.
    pub fn sink_input_put(&mut self, index: u32, start_corked: bool) {
        let Some(input) = self.sink_inputs.get_mut(index) else {
            return;
        };

        input.state = if start_corked {
            StreamState::Corked
        } else {
            StreamState::Running
        };

        let sink = input.sink;
        if let Some(sink) = self.sinks.get_mut(sink) {
            sink.inputs.push(index);
        }

        debug!("sink input {} put (corked={})", index, start_corked);
        self.subscription(
            SubscriptionEventFacility::SinkInput,
            SubscriptionEventType::New,
            index,
        );
    }

    /// Kills a playback stream: notifies the owner, settles a pending
    /// drain with failure, detaches and frees.
    pub fn sink_input_kill(&mut self, index: u32) {
        let Some(input) = self.sink_inputs.get_mut(index) else {
            return;
        };
        input.state = StreamState::Unlinked;

        let owner = input.owner;
        let drain_tag = input.drain_tag.take();
        let sink = input.sink;

        if let Some(tag) = drain_tag {
            self.stream_event(owner, StreamEvent::DrainFailed { tag });
        }
        if let Some(owner) = owner {
            self.stream_event(
                Some(owner),
                StreamEvent::PlaybackKilled { channel: owner.channel },
            );
        }

        if let Some(sink) = self.sinks.get_mut(sink) {
            sink.detach_input(index);
        }

        // Record streams tapping this input lose their feed.
        let taps: Vec<u32> = self
            .source_outputs
            .iter()
            .filter(|(_, o)| o.direct_on_input == Some(index))
            .map(|(i, _)| i)
            .collect();
        for tap in taps {
            self.source_output_kill(tap);
        }

        self.sink_inputs.remove(index);
        self.subscription(
            SubscriptionEventFacility::SinkInput,
            SubscriptionEventType::Removed,
            index,
        );
    }

    /// Removes a stream at the owner's request, without a kill
    /// notification.
    pub fn sink_input_unlink(&mut self, index: u32) {
        let Some(input) = self.sink_inputs.get_mut(index) else {
            return;
        };
        input.state = StreamState::Unlinked;
        input.owner = None;

        let drain_tag = input.drain_tag.take();
        let sink = input.sink;
        if drain_tag.is_some() {
            // The drain can no longer be answered; the caller already tore
            // down the stream.
            debug!("sink input {} unlinked with drain pending", index);
        }

        if let Some(sink) = self.sinks.get_mut(sink) {
            sink.detach_input(index);
        }

        let taps: Vec<u32> = self
            .source_outputs
            .iter()
            .filter(|(_, o)| o.direct_on_input == Some(index))
            .map(|(i, _)| i)
            .collect();
        for tap in taps {
            self.source_output_kill(tap);
        }

        self.sink_inputs.remove(index);
        self.subscription(
            SubscriptionEventFacility::SinkInput,
            SubscriptionEventType::Removed,
            index,
        );
    }

    /// All members of a stream's sync group (including itself), scoped to
    /// the owning connection.
    pub fn sync_group(&self, index: u32) -> Vec<u32> {
        let Some(input) = self.sink_inputs.get(index) else {
            return Vec::new();
        };

        let (Some(owner), syncid) = (input.owner, input.syncid) else {
            return vec![index];
        };

        self.sink_inputs
            .iter()
            .filter(|(_, i)| {
                i.syncid == syncid
                    && i.owner.map(|o| o.connection) == Some(owner.connection)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Finds an existing playback stream sharing a sync id on this
    /// connection, used to bind new members to the group's sink and phase.
    pub fn sync_group_master(&self, connection: u32, syncid: u32) -> Option<u32> {
        self.sink_inputs
            .find(|i| i.syncid == syncid && i.owner.map(|o| o.connection) == Some(connection))
            .map(|(i, _)| i)
    }

    /// Corks or uncorks a stream and its whole sync group atomically.
    pub fn sink_input_cork(&mut self, index: u32, cork: bool) -> Result<(), CoreError> {
        if !self.sink_inputs.contains(index) {
            return Err(CoreError::NoEntity);
        }

        for member in self.sync_group(index) {
            let Some(input) = self.sink_inputs.get_mut(member) else {
                continue;
            };

            let new_state = if cork {
                StreamState::Corked
            } else {
                StreamState::Running
            };

            if input.state == new_state {
                continue;
            }

            input.state = new_state;
            if cork {
                // Re-arm the prebuffer so resumption does not immediately
                // starve.
                input.queue.prebuf_force();
                input.playing = false;
            }

            self.subscription(
                SubscriptionEventFacility::SinkInput,
                SubscriptionEventType::Changed,
                member,
            );
        }

        Ok(())
    }

    /// Discards a stream's buffered audio (and its sync group's), re-arming
    /// prebuffering.
    pub fn sink_input_flush(&mut self, index: u32) -> Result<(), CoreError> {
        if !self.sink_inputs.contains(index) {
            return Err(CoreError::NoEntity);
        }

        for member in self.sync_group(index) {
            if let Some(input) = self.sink_inputs.get_mut(member) {
                input.queue.flush_write();
                input.discard_converted();
            }

            self.request_bytes(member);
        }

        Ok(())
    }

    /// Disables prebuffering so buffered audio plays immediately.
    pub fn sink_input_trigger(&mut self, index: u32) -> Result<(), CoreError> {
        if !self.sink_inputs.contains(index) {
            return Err(CoreError::NoEntity);
        }

        for member in self.sync_group(index) {
            if let Some(input) = self.sink_inputs.get_mut(member) {
                input.queue.prebuf_disable();
            }
        }

        Ok(())
    }

    /// Re-arms prebuffering.
    pub fn sink_input_prebuf_force(&mut self, index: u32) -> Result<(), CoreError> {
        if !self.sink_inputs.contains(index) {
            return Err(CoreError::NoEntity);
        }

        for member in self.sync_group(index) {
            if let Some(input) = self.sink_inputs.get_mut(member) {
                input.queue.prebuf_force();
            }
        }

        Ok(())
    }

    /// Requests a drain notification. Returns true if the stream is
    /// already drained, in which case no event will be posted.
    pub fn sink_input_drain(&mut self, index: u32, tag: u32) -> Result<bool, CoreError> {
        let input = self.sink_inputs.get_mut(index).ok_or(CoreError::NoEntity)?;

        // Let the queue run out without waiting for the prebuffer.
        input.queue.prebuf_disable();

        if !input.has_pending() {
            return Ok(true);
        }

        input.drain_tag = Some(tag);
        Ok(false)
    }

    /// Accepts a stream write from the wire: applies the seek, pushes the
    /// audio, and reports overflow to the owner.
    pub fn sink_input_write(
        &mut self,
        index: u32,
        offset: i64,
        seek: SeekMode,
        chunk: &MemChunk,
    ) -> Result<(), CoreError> {
        let pool = self.pool.clone();
        let input = self.sink_inputs.get_mut(index).ok_or(CoreError::NoEntity)?;

        if offset != 0 || seek != SeekMode::Relative {
            input.queue.seek(offset, seek);
        }

        input.requested_bytes = input.requested_bytes.saturating_sub(chunk.length);

        let dropped = input
            .queue
            .push_align(chunk, &pool)
            .map_err(|_| CoreError::Invalid)?;

        if dropped > 0 {
            let owner = input.owner;
            self.stream_event(owner, StreamEvent::Overflow {
                channel: owner.map(|o| o.channel).unwrap_or(0),
            });
        }

        Ok(())
    }

    /// Moves a playback stream to a different sink, preserving its queue
    /// and read/write indices.
    pub fn move_sink_input(&mut self, index: u32, new_sink: u32) -> Result<(), CoreError> {
        let new_spec = self
            .sinks
            .get(new_sink)
            .ok_or(CoreError::NoEntity)?
            .sample_spec;

        let input = self.sink_inputs.get_mut(index).ok_or(CoreError::NoEntity)?;
        if input.no_move {
            return Err(CoreError::NotSupported);
        }

        let old_sink = input.sink;
        if old_sink == new_sink {
            return Ok(());
        }

        input.sink = new_sink;
        input.discard_converted();
        if input.sample_spec != new_spec {
            input.set_resampler(Some(Resampler::new(
                &input.sample_spec,
                &new_spec,
                ResampleMethod::Trivial,
            )));
        } else {
            input.set_resampler(None);
        }

        // Replay the prebuffer on the new device.
        input.queue.prebuf_force();
        input.playing = false;
        let owner = input.owner;

        if let Some(sink) = self.sinks.get_mut(old_sink) {
            sink.detach_input(index);
        }
        let (name, suspended) = {
            let sink = self.sinks.get_mut(new_sink).unwrap();
            sink.inputs.push(index);
            (sink.name.clone(), sink.state == DeviceState::Suspended)
        };

        if let Some(owner) = owner {
            self.stream_event(
                Some(owner),
                StreamEvent::Moved {
                    channel: owner.channel,
                    playback: true,
                    device_index: new_sink,
                    device_name: name,
                    device_suspended: suspended,
                },
            );
        }

        self.subscription(
            SubscriptionEventFacility::SinkInput,
            SubscriptionEventType::Changed,
            index,
        );

        Ok(())
    }

    /// Plays a cached sample as a short-lived stream on the given sink.
    pub fn play_sample(
        &mut self,
        name: &str,
        sink: u32,
        volume: ChannelVolume,
        props: Props,
    ) -> Result<u32, CoreError> {
        let sample = self.scache.get_by_name(name).ok_or(CoreError::NoEntity)?;
        let (spec, map, chunk) = (sample.sample_spec, sample.channel_map, sample.chunk.clone());

        let mut queue = MemBlockQ::new(
            0,
            chunk.length.max(spec.frame_size()),
            chunk.length.max(spec.frame_size()),
            spec.frame_size(),
            0,
            spec.frame_size(),
            0,
            None,
        );
        queue.push(&chunk).map_err(|_| CoreError::Invalid)?;

        let index = self.create_sink_input(
            name,
            sink,
            spec,
            map,
            volume,
            false,
            queue,
            u32::MAX,
            props,
        )?;

        if let Some(input) = self.sink_inputs.get_mut(index) {
            input.kill_when_drained = true;
        }

        self.sink_input_put(index, false);
        info!("playing sample \"{}\" on sink {}", name, sink);

        Ok(index)
    }

    // === Source outputs ===

    /// Creates a record stream attached to `source`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_source_output(
        &mut self,
        name: &str,
        source: u32,
        sample_spec: SampleSpec,
        channel_map: ChannelMap,
        queue: MemBlockQ,
        fragment_size: usize,
        props: Props,
    ) -> Result<u32, CoreError> {
        if !sample_spec.is_valid() {
            return Err(CoreError::Invalid);
        }

        let source_spec = self
            .sources
            .get(source)
            .ok_or(CoreError::NoEntity)?
            .sample_spec;

        let index = self.source_outputs.put_with(|index| {
            let mut output = SourceOutput::new(
                index,
                name.to_string(),
                source,
                sample_spec,
                channel_map,
                queue,
                fragment_size,
            );
            output.props = props;
            output
        });

        if sample_spec != source_spec {
            let resampler = Resampler::new(&source_spec, &sample_spec, ResampleMethod::Trivial);
            self.source_outputs
                .get_mut(index)
                .unwrap()
                .set_resampler(Some(resampler));
        }

        Ok(index)
    }

    /// Makes a record stream visible to the capture path.
    pub fn source_output_put(&mut self, index: u32, start_corked: bool) {
        let Some(output) = self.source_outputs.get_mut(index) else {
            return;
        };

        output.state = if start_corked {
            StreamState::Corked
        } else {
            StreamState::Running
        };

        let source = output.source;
        if let Some(source) = self.sources.get_mut(source) {
            source.outputs.push(index);
        }

        self.subscription(
            SubscriptionEventFacility::SourceOutput,
            SubscriptionEventType::New,
            index,
        );
    }

    /// Kills a record stream, notifying the owner.
    pub fn source_output_kill(&mut self, index: u32) {
        let Some(output) = self.source_outputs.get_mut(index) else {
            return;
        };
        output.state = StreamState::Unlinked;

        let owner = output.owner;
        let source = output.source;

        if let Some(owner) = owner {
            self.stream_event(
                Some(owner),
                StreamEvent::RecordKilled { channel: owner.channel },
            );
        }

        if let Some(source) = self.sources.get_mut(source) {
            source.detach_output(index);
        }

        self.source_outputs.remove(index);
        self.subscription(
            SubscriptionEventFacility::SourceOutput,
            SubscriptionEventType::Removed,
            index,
        );
    }

    /// Removes a record stream at the owner's request.
    pub fn source_output_unlink(&mut self, index: u32) {
        let Some(output) = self.source_outputs.get_mut(index) else {
            return;
        };
        output.state = StreamState::Unlinked;
        output.owner = None;

        let source = output.source;
        if let Some(source) = self.sources.get_mut(source) {
            source.detach_output(index);
        }

        self.source_outputs.remove(index);
        self.subscription(
            SubscriptionEventFacility::SourceOutput,
            SubscriptionEventType::Removed,
            index,
        );
    }

    /// Corks or uncorks a record stream.
    pub fn source_output_cork(&mut self, index: u32, cork: bool) -> Result<(), CoreError> {
        let output = self
            .source_outputs
            .get_mut(index)
            .ok_or(CoreError::NoEntity)?;

        output.state = if cork {
            StreamState::Corked
        } else {
            StreamState::Running
        };

        self.subscription(
            SubscriptionEventFacility::SourceOutput,
            SubscriptionEventType::Changed,
            index,
        );

        Ok(())
    }

    /// Moves a record stream to a different source.
    pub fn move_source_output(&mut self, index: u32, new_source: u32) -> Result<(), CoreError> {
        let new_spec = self
            .sources
            .get(new_source)
            .ok_or(CoreError::NoEntity)?
            .sample_spec;

        let output = self
            .source_outputs
            .get_mut(index)
            .ok_or(CoreError::NoEntity)?;

        if output.no_move || output.direct_on_input.is_some() {
            return Err(CoreError::NotSupported);
        }

        let old_source = output.source;
        if old_source == new_source {
            return Ok(());
        }

        output.source = new_source;
        if output.sample_spec != new_spec {
            output.set_resampler(Some(Resampler::new(
                &new_spec,
                &output.sample_spec,
                ResampleMethod::Trivial,
            )));
        } else {
            output.set_resampler(None);
        }
        let owner = output.owner;

        if let Some(source) = self.sources.get_mut(old_source) {
            source.detach_output(index);
        }
        let (name, suspended) = {
            let source = self.sources.get_mut(new_source).unwrap();
            source.outputs.push(index);
            (source.name.clone(), source.state == DeviceState::Suspended)
        };

        if let Some(owner) = owner {
            self.stream_event(
                Some(owner),
                StreamEvent::Moved {
                    channel: owner.channel,
                    playback: false,
                    device_index: new_source,
                    device_name: name,
                    device_suspended: suspended,
                },
            );
        }

        self.subscription(
            SubscriptionEventFacility::SourceOutput,
            SubscriptionEventType::Changed,
            index,
        );

        Ok(())
    }

    // === Clients and modules ===

    /// Registers a client entity.
    pub fn create_client(&mut self, driver: &'static str, props: Props) -> u32 {
        let index = self.clients.put_with(|index| ClientEntry {
            index,
            driver,
            props,
        });

        self.subscription(
            SubscriptionEventFacility::Client,
            SubscriptionEventType::New,
            index,
        );
        index
    }

    /// Removes a client entity.
    pub fn remove_client(&mut self, index: u32) {
        if self.clients.remove(index).is_some() {
            self.subscription(
                SubscriptionEventFacility::Client,
                SubscriptionEventType::Removed,
                index,
            );
        }
    }

    /// Registers a loaded module.
    pub fn register_module(&mut self, name: &str, argument: &str) -> u32 {
        let index = self.modules.put_with(|index| ModuleEntry {
            index,
            name: name.to_string(),
            argument: argument.to_string(),
            sinks: Vec::new(),
            sources: Vec::new(),
        });

        self.subscription(
            SubscriptionEventFacility::Module,
            SubscriptionEventType::New,
            index,
        );
        index
    }

    /// Unloads a module, tearing down the devices it owns.
    pub fn unload_module(&mut self, index: u32) -> Result<(), CoreError> {
        let module = self.modules.remove(index).ok_or(CoreError::NoEntity)?;

        for sink in module.sinks {
            self.remove_sink(sink);
        }
        for source in module.sources {
            // Monitor sources were already removed with their sinks.
            if self.sources.contains(source) {
                self.remove_source(source);
            }
        }

        warn!("module {} \"{}\" unloaded", index, module.name);
        self.subscription(
            SubscriptionEventFacility::Module,
            SubscriptionEventType::Removed,
            index,
        );

        Ok(())
    }

    /// Builds a silence chunk suitable as a queue backfill for a spec.
    pub fn make_silence(&self, spec: &SampleSpec, length: usize) -> MemChunk {
        silence_chunk(&self.pool, spec, length)
    }

    // === Volume, mute, metadata ===

    /// Sets a sink's master volume.
    pub fn sink_set_volume(&mut self, index: u32, cvolume: ChannelVolume) -> Result<(), CoreError> {
        let sink = self.sinks.get_mut(index).ok_or(CoreError::NoEntity)?;
        sink.cvolume = cvolume;
        self.subscription(
            SubscriptionEventFacility::Sink,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Mutes or unmutes a sink.
    pub fn sink_set_mute(&mut self, index: u32, muted: bool) -> Result<(), CoreError> {
        let sink = self.sinks.get_mut(index).ok_or(CoreError::NoEntity)?;
        sink.muted = muted;
        self.subscription(
            SubscriptionEventFacility::Sink,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Sets a source's capture volume.
    pub fn source_set_volume(
        &mut self,
        index: u32,
        cvolume: ChannelVolume,
    ) -> Result<(), CoreError> {
        let source = self.sources.get_mut(index).ok_or(CoreError::NoEntity)?;
        source.cvolume = cvolume;
        self.subscription(
            SubscriptionEventFacility::Source,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Mutes or unmutes a source.
    pub fn source_set_mute(&mut self, index: u32, muted: bool) -> Result<(), CoreError> {
        let source = self.sources.get_mut(index).ok_or(CoreError::NoEntity)?;
        source.muted = muted;
        self.subscription(
            SubscriptionEventFacility::Source,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Sets a playback stream's volume.
    pub fn sink_input_set_volume(
        &mut self,
        index: u32,
        cvolume: ChannelVolume,
    ) -> Result<(), CoreError> {
        let input = self.sink_inputs.get_mut(index).ok_or(CoreError::NoEntity)?;
        input.cvolume = cvolume;
        self.subscription(
            SubscriptionEventFacility::SinkInput,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Mutes or unmutes a playback stream.
    pub fn sink_input_set_mute(&mut self, index: u32, muted: bool) -> Result<(), CoreError> {
        let input = self.sink_inputs.get_mut(index).ok_or(CoreError::NoEntity)?;
        input.muted = muted;
        self.subscription(
            SubscriptionEventFacility::SinkInput,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Renames a playback stream.
    pub fn sink_input_set_name(&mut self, index: u32, name: &str) -> Result<(), CoreError> {
        let input = self.sink_inputs.get_mut(index).ok_or(CoreError::NoEntity)?;
        input.name = name.to_string();
        self.subscription(
            SubscriptionEventFacility::SinkInput,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Applies a rate change to a variable-rate playback stream.
    pub fn sink_input_set_rate(&mut self, index: u32, rate: u32) -> Result<(), CoreError> {
        let input = self.sink_inputs.get_mut(index).ok_or(CoreError::NoEntity)?;
        if !input.variable_rate {
            return Err(CoreError::NotSupported);
        }

        let mut spec = input.sample_spec;
        spec.rate = rate;
        if !spec.is_valid() {
            return Err(CoreError::Invalid);
        }

        // A same-spec stream suddenly needs conversion once its rate
        // diverges from the sink's.
        let sink_spec = self
            .sinks
            .get(input.sink)
            .map(|s| s.sample_spec)
            .ok_or(CoreError::NoEntity)?;

        input.update_rate(rate);
        if input.sample_spec != sink_spec && !input.has_resampler() {
            input.set_resampler(Some(Resampler::new(
                &input.sample_spec,
                &sink_spec,
                ResampleMethod::Trivial,
            )));
        }

        self.subscription(
            SubscriptionEventFacility::SinkInput,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Mutates a playback stream's property list.
    pub fn sink_input_update_props(
        &mut self,
        index: u32,
        f: impl FnOnce(&mut Props),
    ) -> Result<(), CoreError> {
        let input = self.sink_inputs.get_mut(index).ok_or(CoreError::NoEntity)?;
        f(&mut input.props);
        self.subscription(
            SubscriptionEventFacility::SinkInput,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Renames a record stream.
    pub fn source_output_set_name(&mut self, index: u32, name: &str) -> Result<(), CoreError> {
        let output = self
            .source_outputs
            .get_mut(index)
            .ok_or(CoreError::NoEntity)?;
        output.name = name.to_string();
        self.subscription(
            SubscriptionEventFacility::SourceOutput,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Applies a rate change to a record stream.
    pub fn source_output_set_rate(&mut self, index: u32, rate: u32) -> Result<(), CoreError> {
        let output = self
            .source_outputs
            .get_mut(index)
            .ok_or(CoreError::NoEntity)?;

        let mut spec = output.sample_spec;
        spec.rate = rate;
        if !spec.is_valid() {
            return Err(CoreError::Invalid);
        }

        let source_spec = self
            .sources
            .get(output.source)
            .map(|s| s.sample_spec)
            .ok_or(CoreError::NoEntity)?;

        output.sample_spec = spec;
        if spec != source_spec {
            output.set_resampler(Some(Resampler::new(
                &source_spec,
                &spec,
                ResampleMethod::Trivial,
            )));
        } else {
            output.set_resampler(None);
        }

        self.subscription(
            SubscriptionEventFacility::SourceOutput,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Mutates a record stream's property list.
    pub fn source_output_update_props(
        &mut self,
        index: u32,
        f: impl FnOnce(&mut Props),
    ) -> Result<(), CoreError> {
        let output = self
            .source_outputs
            .get_mut(index)
            .ok_or(CoreError::NoEntity)?;
        f(&mut output.props);
        self.subscription(
            SubscriptionEventFacility::SourceOutput,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    /// Mutates a client's property list.
    pub fn client_update_props(
        &mut self,
        index: u32,
        f: impl FnOnce(&mut Props),
    ) -> Result<(), CoreError> {
        let client = self.clients.get_mut(index).ok_or(CoreError::NoEntity)?;
        f(&mut client.props);
        self.subscription(
            SubscriptionEventFacility::Client,
            SubscriptionEventType::Changed,
            index,
        );
        Ok(())
    }

    // === Sample cache ===

    /// Stores (or replaces) a named sample, posting the matching cache
    /// event.
    #[allow(clippy::too_many_arguments)]
    pub fn scache_add(
        &mut self,
        name: &str,
        spec: SampleSpec,
        channel_map: ChannelMap,
        cvolume: ChannelVolume,
        chunk: MemChunk,
        props: Props,
    ) -> u32 {
        let replaced = self.scache.remove_by_name(name);
        if let Some(old) = replaced {
            self.subscription(
                SubscriptionEventFacility::SampleCache,
                SubscriptionEventType::Removed,
                old,
            );
        }

        let index = self
            .scache
            .add(name.to_string(), spec, channel_map, cvolume, chunk, props);
        info!("sample cache: stored \"{}\" as {}", name, index);
        self.subscription(
            SubscriptionEventFacility::SampleCache,
            SubscriptionEventType::New,
            index,
        );

        index
    }

    /// Removes a named sample.
    pub fn scache_remove(&mut self, name: &str) -> Result<u32, CoreError> {
        let index = self.scache.remove_by_name(name).ok_or(CoreError::NoEntity)?;
        self.subscription(
            SubscriptionEventFacility::SampleCache,
            SubscriptionEventType::Removed,
            index,
        );
        Ok(index)
    }
}

fn clone_mix_input(m: &MixInput) -> MixInput {
    MixInput {
        chunk: m.chunk.clone(),
        volume: m.volume,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::protocol::{SampleFormat, Volume};

    use super::*;

    fn spec() -> SampleSpec {
        SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        }
    }

    fn test_core() -> (Core, u32) {
        let mut core = Core::new(spec());
        let sink = core
            .create_sink(
                "output",
                "Test Output",
                spec(),
                ChannelMap::stereo(),
                "test",
                None,
                true,
            )
            .unwrap();
        core.events.clear();
        (core, sink)
    }

    fn queue_with(core: &Core, data: &[u8], prebuf: usize) -> MemBlockQ {
        let mut q = MemBlockQ::new(0, 65536, 16384, spec().frame_size(), prebuf, 1024, 0, None);
        if !data.is_empty() {
            let chunk = MemChunk::from_block(core.pool.adopt(data.to_vec()));
            q.push(&chunk).unwrap();
        }
        q
    }

    fn attach_input(core: &mut Core, sink: u32, data: &[u8], owner: Option<StreamOwner>) -> u32 {
        let queue = queue_with(core, data, 0);
        let input = core
            .create_sink_input(
                "input",
                sink,
                spec(),
                ChannelMap::stereo(),
                ChannelVolume::norm(2),
                false,
                queue,
                u32::MAX,
                Props::new(),
            )
            .unwrap();
        core.sink_inputs.get_mut(input).unwrap().owner = owner;
        core.sink_input_put(input, false);
        core.events.clear();
        input
    }

    fn drain_stream_events(core: &mut Core) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = core.events.pop_front() {
            if let CoreEvent::Stream { event, .. } = event {
                out.push(event);
            }
        }
        out
    }

    #[test]
    fn render_single_input_is_zero_copy() {
        let (mut core, sink) = test_core();
        let input = attach_input(&mut core, sink, &[1; 8192], None);

        let chunk = core.sink_render(sink, 4096).unwrap();
        assert_eq!(chunk.length, 4096);
        assert_eq!(&*chunk.data(), &[1u8; 4096][..]);

        // Invariant: the contributing queue advanced by exactly the
        // rendered amount.
        let entry = core.sink_inputs.get(input).unwrap();
        assert_eq!(entry.queue.read_index(), 4096);
    }

    #[test]
    fn render_with_no_input_returns_none() {
        let (mut core, sink) = test_core();
        assert!(core.sink_render(sink, 4096).is_none());
    }

    #[test]
    fn render_mixes_multiple_inputs() {
        let (mut core, sink) = test_core();

        // Two identical streams at 1000 per sample sum to 2000.
        let mut bytes = Vec::new();
        for _ in 0..1024 {
            bytes.extend_from_slice(&1000i16.to_le_bytes());
        }

        let a = attach_input(&mut core, sink, &bytes, None);
        let b = attach_input(&mut core, sink, &bytes, None);

        let chunk = core.sink_render(sink, 256).unwrap();
        let data = chunk.data();
        let sample = i16::from_le_bytes([data[0], data[1]]);
        assert_eq!(sample, 2000);

        // Both contributors advanced in lockstep.
        for input in [a, b] {
            assert_eq!(core.sink_inputs.get(input).unwrap().queue.read_index(), 256);
        }
    }

    #[test]
    fn render_into_full_pads_with_silence() {
        let (mut core, sink) = test_core();
        attach_input(&mut core, sink, &[3; 512], None);

        let block = core.pool.allocate(2048);
        let mut target = MemChunk::from_block(block);
        core.sink_render_into_full(sink, &mut target);

        let data = target.data();
        assert_eq!(&data[..512], &[3u8; 512][..]);
        assert_eq!(&data[512..], &[0u8; 1536][..]);
    }

    #[test]
    fn monitor_receives_rendered_audio() {
        let (mut core, sink) = test_core();
        attach_input(&mut core, sink, &[5; 4096], None);

        let monitor = core.sinks.get(sink).unwrap().monitor_source;
        let queue = MemBlockQ::new(0, 65536, 65536, spec().frame_size(), 0, 4, 0, None);
        let output = core
            .create_source_output(
                "rec",
                monitor,
                spec(),
                ChannelMap::stereo(),
                queue,
                1024,
                Props::new(),
            )
            .unwrap();
        core.source_output_put(output, false);

        core.sink_render(sink, 2048).unwrap();

        let entry = core.source_outputs.get_mut(output).unwrap();
        assert_eq!(entry.queue.len(), 2048);
        assert_eq!(&*entry.queue.peek().unwrap().data(), &[5u8; 2048][..]);
    }

    #[test]
    fn underflow_and_started_fire_once_per_edge() {
        let (mut core, sink) = test_core();
        let owner = StreamOwner {
            connection: 1,
            channel: 0,
        };
        let input = attach_input(&mut core, sink, &[0; 2048], Some(owner));

        core.sink_render(sink, 2048).unwrap();
        assert_matches!(
            drain_stream_events(&mut core).first(),
            Some(StreamEvent::Started { channel: 0 })
        );

        // The queue is dry now; exactly one underflow.
        assert!(core.sink_render(sink, 2048).is_none());
        let events = drain_stream_events(&mut core);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, StreamEvent::Underflow { .. }))
                .count(),
            1
        );

        assert!(core.sink_render(sink, 2048).is_none());
        assert!(drain_stream_events(&mut core)
            .iter()
            .all(|e| !matches!(e, StreamEvent::Underflow { .. })));

        let _ = input;
    }

    #[test]
    fn request_credit_batches_by_minreq() {
        let (mut core, sink) = test_core();
        let owner = StreamOwner {
            connection: 1,
            channel: 0,
        };
        attach_input(&mut core, sink, &[0; 16384], Some(owner));

        // A deficit below minreq grants nothing.
        core.sink_render(sink, 512).unwrap();
        let events = drain_stream_events(&mut core);
        assert!(events
            .iter()
            .all(|e| !matches!(e, StreamEvent::Request { .. })));

        // Crossing minreq grants the whole deficit at once.
        core.sink_render(sink, 1536).unwrap();
        let events = drain_stream_events(&mut core);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Request { bytes: 2048, .. })));
    }

    #[test]
    fn drain_acknowledges_after_playout() {
        let (mut core, sink) = test_core();
        let owner = StreamOwner {
            connection: 1,
            channel: 0,
        };
        let input = attach_input(&mut core, sink, &[0; 4096], Some(owner));

        assert_eq!(core.sink_input_drain(input, 42), Ok(false));
        core.sink_render(sink, 4096).unwrap();

        let events = drain_stream_events(&mut core);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::DrainDone { tag: 42 })));
    }

    #[test]
    fn sync_group_corks_atomically() {
        let (mut core, sink) = test_core();
        let a = attach_input(
            &mut core,
            sink,
            &[0; 4096],
            Some(StreamOwner {
                connection: 1,
                channel: 0,
            }),
        );
        let b = attach_input(
            &mut core,
            sink,
            &[0; 4096],
            Some(StreamOwner {
                connection: 1,
                channel: 1,
            }),
        );

        for input in [a, b] {
            core.sink_inputs.get_mut(input).unwrap().syncid = 7;
        }

        core.sink_input_cork(a, true).unwrap();
        for input in [a, b] {
            assert_eq!(
                core.sink_inputs.get(input).unwrap().state,
                StreamState::Corked
            );
        }

        assert!(core.sink_render(sink, 1024).is_none());
    }

    #[test]
    fn move_preserves_queue_positions() {
        let (mut core, sink) = test_core();
        let other = core
            .create_sink(
                "second",
                "Second Output",
                spec(),
                ChannelMap::stereo(),
                "test",
                None,
                true,
            )
            .unwrap();

        let input = attach_input(&mut core, sink, &[0; 8192], None);
        core.sink_render(sink, 2048).unwrap();

        let before = {
            let entry = core.sink_inputs.get(input).unwrap();
            (entry.queue.read_index(), entry.queue.write_index())
        };

        core.move_sink_input(input, other).unwrap();

        let entry = core.sink_inputs.get(input).unwrap();
        assert_eq!(entry.sink, other);
        assert_eq!((entry.queue.read_index(), entry.queue.write_index()), before);
        assert!(core.sinks.get(other).unwrap().inputs.contains(&input));
        assert!(!core.sinks.get(sink).unwrap().inputs.contains(&input));
    }

    #[test]
    fn resampled_input_renders_in_sink_rate() {
        let (mut core, sink) = test_core();

        // A 22050 Hz stream into a 44100 Hz sink produces twice the frames.
        let stream_spec = SampleSpec {
            rate: 22050,
            ..spec()
        };
        let mut queue = MemBlockQ::new(0, 65536, 16384, stream_spec.frame_size(), 0, 4, 0, None);
        let chunk = MemChunk::from_block(core.pool.adopt(vec![1; 1024]));
        queue.push(&chunk).unwrap();

        let input = core
            .create_sink_input(
                "slow",
                sink,
                stream_spec,
                ChannelMap::stereo(),
                ChannelVolume::norm(2),
                false,
                queue,
                u32::MAX,
                Props::new(),
            )
            .unwrap();
        core.sink_input_put(input, false);

        let mut total = 0;
        while let Some(chunk) = core.sink_render(sink, 4096) {
            total += chunk.length;
        }

        assert_eq!(total, 2048);
    }

    #[test]
    fn play_sample_spawns_and_reaps_a_stream() {
        let (mut core, sink) = test_core();

        let chunk = MemChunk::from_block(core.pool.adopt(vec![0; 2048]));
        core.scache_add(
            "bell",
            spec(),
            ChannelMap::stereo(),
            ChannelVolume::norm(2),
            chunk,
            Props::new(),
        );

        let input = core
            .play_sample("bell", sink, ChannelVolume::norm(2), Props::new())
            .unwrap();
        assert!(core.sink_inputs.contains(input));

        // Playing the sample out reaps the stream.
        while core.sink_render(sink, 4096).is_some() {}
        assert!(!core.sink_inputs.contains(input));

        assert_matches!(
            core.play_sample("missing", sink, ChannelVolume::norm(2), Props::new()),
            Err(CoreError::NoEntity)
        );
    }

    #[test]
    fn muted_input_contributes_silence() {
        let (mut core, sink) = test_core();

        let mut bytes = Vec::new();
        for _ in 0..512 {
            bytes.extend_from_slice(&1000i16.to_le_bytes());
        }

        let input = attach_input(&mut core, sink, &bytes, None);
        core.sink_input_set_mute(input, true).unwrap();

        let chunk = core.sink_render(sink, 256).unwrap();
        assert!(chunk.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn master_volume_scales_the_mix() {
        let (mut core, sink) = test_core();

        let mut bytes = Vec::new();
        for _ in 0..512 {
            bytes.extend_from_slice(&1000i16.to_le_bytes());
        }
        attach_input(&mut core, sink, &bytes, None);

        let mut half = ChannelVolume::empty();
        half.push(Volume::from_u32_clamped(0x8000));
        half.push(Volume::from_u32_clamped(0x8000));
        core.sink_set_volume(sink, half).unwrap();

        let chunk = core.sink_render(sink, 64).unwrap();
        let data = chunk.data();
        assert_eq!(i16::from_le_bytes([data[0], data[1]]), 500);
    }
}
