//! Capture devices.

use crate::protocol::{ChannelMap, ChannelVolume, Props, SampleSpec};

use super::sink::DeviceState;

/// A capture endpoint: fans every posted chunk out to its attached source
/// outputs. A source is either backed by a real capture driver or is the
/// monitor of a sink, in which case its posts come from the sink's render
/// path.
#[derive(Debug)]
pub struct Source {
    /// The source's stable index.
    pub index: u32,
    /// The source's registered (unique) name.
    pub name: String,
    /// Human readable description.
    pub description: String,
    /// The native sample spec audio is posted in.
    pub sample_spec: SampleSpec,
    /// The native channel map.
    pub channel_map: ChannelMap,
    /// Capture volume.
    pub cvolume: ChannelVolume,
    /// Whether the source is muted.
    pub muted: bool,
    /// The device's lifecycle state.
    pub state: DeviceState,
    /// The sink this source mirrors, if it is a monitor.
    pub monitor_of: Option<u32>,
    /// Attached source outputs, in attachment order.
    pub outputs: Vec<u32>,
    /// The module that created the source, if any.
    pub owner_module: Option<u32>,
    /// Latency currently reported by the device driver, in microseconds.
    pub driver_latency_usec: u64,
    /// The driver backing this source.
    pub driver: &'static str,
    /// Additional metadata.
    pub props: Props,
}

impl Source {
    /// Detaches an output from the fan-out set.
    pub fn detach_output(&mut self, output: u32) {
        self.outputs.retain(|&o| o != output);
    }
}
