//! Output devices.

use crate::protocol::{ChannelMap, ChannelVolume, Props, SampleSpec};

/// Devices move between these states; unlinked devices are mid-teardown and
/// no longer render or post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Actively exchanging audio with its driver.
    Running,
    /// The driver stopped hardware I/O; attached streams keep buffering.
    Suspended,
    /// Being torn down.
    Unlinked,
}

/// The most inputs one render pass will mix.
pub const MAX_MIX_CHANNELS: usize = 32;

/// An output endpoint: consumes mixed audio from its attached sink inputs
/// and mirrors every rendered chunk to its monitor source.
#[derive(Debug)]
pub struct Sink {
    /// The sink's stable index.
    pub index: u32,
    /// The sink's registered (unique) name.
    pub name: String,
    /// Human readable description.
    pub description: String,
    /// The native sample spec audio is rendered in.
    pub sample_spec: SampleSpec,
    /// The native channel map.
    pub channel_map: ChannelMap,
    /// Master volume, applied after per-stream volumes.
    pub cvolume: ChannelVolume,
    /// Whether the sink is muted.
    pub muted: bool,
    /// The device's lifecycle state.
    pub state: DeviceState,
    /// Index of the monitor source that receives every rendered chunk.
    pub monitor_source: u32,
    /// Attached sink inputs, in attachment order.
    pub inputs: Vec<u32>,
    /// The module that created the sink, if any.
    pub owner_module: Option<u32>,
    /// Latency currently reported by the device driver, in microseconds.
    pub driver_latency_usec: u64,
    /// The driver backing this sink.
    pub driver: &'static str,
    /// Additional metadata.
    pub props: Props,
}

impl Sink {
    /// Detaches an input from the sink's mix set.
    pub fn detach_input(&mut self, input: u32) {
        self.inputs.retain(|&i| i != input);
    }
}
