//! The built-in null output device: a timer-driven sink that renders on a
//! fixed cadence and discards the audio.
//!
//! It stands in for real device glue, which is just another producer /
//! consumer of rendered chunks. Latency is modeled as one timer interval's
//! worth of device buffer.

use std::time::{Duration, Instant};

use crate::core::sink::DeviceState;
use crate::core::Core;
use crate::protocol::{ChannelMap, Prop, SampleSpec};

/// The render cadence.
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// The driver name reported for null devices.
pub const DRIVER: &str = "null-sink";

/// The clock state for one null sink.
#[derive(Debug)]
pub struct NullSink {
    /// The sink this driver feeds.
    pub sink: u32,
    last_tick: Instant,
}

impl NullSink {
    /// Creates the device: a sink plus monitor in the core, clocked by the
    /// caller's timer.
    pub fn new(
        core: &mut Core,
        name: &str,
        description: &str,
        spec: SampleSpec,
        owner_module: Option<u32>,
    ) -> Option<Self> {
        let channel_map = ChannelMap::default_for(spec.channels);
        let sink = core.create_sink(name, description, spec, channel_map, DRIVER, owner_module, false)?;

        if let Some(s) = core.sinks.get_mut(sink) {
            s.driver_latency_usec = TICK_INTERVAL.as_micros() as u64;
            s.props.set_str(Prop::DeviceClass, "abstract");
            s.props.set_str(Prop::DeviceDescription, description);
        }

        Some(Self {
            sink,
            last_tick: Instant::now(),
        })
    }

    /// Renders the audio that "played" since the last tick and throws it
    /// away. Returns the number of bytes pulled.
    pub fn tick(&mut self, core: &mut Core, now: Instant) -> usize {
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;

        let spec = match core.sinks.get(self.sink) {
            Some(sink) if sink.state == DeviceState::Running => sink.sample_spec,
            _ => return 0,
        };

        let bytes = spec.usec_to_bytes(elapsed.as_micros() as u64);
        if bytes == 0 {
            return 0;
        }

        self.pull(core, bytes)
    }

    /// Pulls exactly `bytes` of mixed audio out of the sink, discarding it.
    pub fn pull(&mut self, core: &mut Core, bytes: usize) -> usize {
        let mut pulled = 0;
        while pulled < bytes {
            match core.sink_render(self.sink, bytes - pulled) {
                Some(chunk) => pulled += chunk.length,
                None => break,
            }
        }

        pulled
    }
}

#[cfg(test)]
mod tests {
    use crate::core::memblockq::MemBlockQ;
    use crate::protocol::{ChannelVolume, Props, SampleFormat};

    use super::*;

    fn spec() -> SampleSpec {
        SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        }
    }

    #[test]
    fn renders_and_discards() -> anyhow::Result<()> {
        let mut core = Core::new(spec());
        let mut dev = NullSink::new(&mut core, "null", "Null Output", spec(), None).unwrap();

        let queue = {
            let mut q = MemBlockQ::new(0, 65536, 16384, spec().frame_size(), 0, 1024, 0, None);
            let chunk =
                crate::core::sample::silence_chunk(&core.pool, &spec(), 8192);
            q.push(&chunk).unwrap();
            q
        };

        let input = core
            .create_sink_input(
                "test",
                dev.sink,
                spec(),
                ChannelMap::stereo(),
                ChannelVolume::norm(2),
                false,
                queue,
                0,
                Props::new(),
            )
            .unwrap();
        core.sink_input_put(input, false);

        assert_eq!(dev.pull(&mut core, 4096), 4096);
        assert_eq!(core.sink_inputs.get(input).unwrap().queue.len(), 4096);

        // Draining past the buffered audio stops at what is available.
        assert_eq!(dev.pull(&mut core, 8192), 4096);

        Ok(())
    }
}
