//! Event subscriptions.

use bitflags::bitflags;
use enum_primitive_derive::Primitive;

use crate::protocol::{serde::*, ProtocolError};

bitflags! {
    /// A mask of event facilities to subscribe to.
    #[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SubscriptionMask: u32 {
        /// Sink events.
        const SINK = 0x0001;

        /// Source events.
        const SOURCE = 0x0002;

        /// Sink input events.
        const SINK_INPUT = 0x0004;

        /// Source output events.
        const SOURCE_OUTPUT = 0x0008;

        /// Module events.
        const MODULE = 0x0010;

        /// Client events.
        const CLIENT = 0x0020;

        /// Sample cache events.
        const SAMPLE_CACHE = 0x0040;

        /// Server events.
        const SERVER = 0x0080;

        /// All events.
        const ALL = 0x00ff;
    }
}

impl TagStructRead for SubscriptionMask {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        Ok(Self::from_bits_truncate(ts.read_u32()?))
    }
}

impl TagStructWrite for SubscriptionMask {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.bits())?;
        Ok(())
    }
}

/// The source of a subscription event.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum SubscriptionEventFacility {
    Sink = 0,
    Source = 1,
    SinkInput = 2,
    SourceOutput = 3,
    Module = 4,
    Client = 5,
    SampleCache = 6,
    Server = 7,
}

impl SubscriptionEventFacility {
    /// The mask bit corresponding to this facility.
    pub fn mask(&self) -> SubscriptionMask {
        SubscriptionMask::from_bits_truncate(1 << (*self as u32))
    }
}

/// The kind of change an event describes.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum SubscriptionEventType {
    New = 0x00,
    Changed = 0x10,
    Removed = 0x20,
}

const FACILITY_MASK: u32 = 0x0F;
const EVENT_TYPE_MASK: u32 = 0x30;

/// An entity change notification from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionEvent {
    /// What kind of object the event refers to.
    pub facility: SubscriptionEventFacility,
    /// What happened to it.
    pub event_type: SubscriptionEventType,
    /// The index of the object.
    pub index: Option<u32>,
}

impl TagStructRead for SubscriptionEvent {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        use num_traits::FromPrimitive as _;

        let raw = ts.read_u32()?;
        let facility = SubscriptionEventFacility::from_u32(raw & FACILITY_MASK)
            .ok_or_else(|| ProtocolError::Invalid(format!("invalid event facility: {}", raw)))?;
        let event_type = SubscriptionEventType::from_u32(raw & EVENT_TYPE_MASK)
            .ok_or_else(|| ProtocolError::Invalid(format!("invalid event type: {}", raw)))?;
        let index = ts.read_index()?;

        Ok(Self {
            facility,
            event_type,
            index,
        })
    }
}

impl TagStructWrite for SubscriptionEvent {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        let raw = (self.facility as u32) | (self.event_type as u32);
        w.write_u32(raw)?;
        w.write_index(self.index)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{test_util::test_serde_version, MAX_VERSION};

    #[test]
    fn subscription_mask_serde() -> anyhow::Result<()> {
        let mask = SubscriptionMask::SINK | SubscriptionMask::SOURCE;
        test_serde_version(&mask, MAX_VERSION)
    }

    #[test]
    fn subscription_event_serde() -> anyhow::Result<()> {
        let event = SubscriptionEvent {
            facility: SubscriptionEventFacility::SinkInput,
            event_type: SubscriptionEventType::Changed,
            index: Some(1),
        };
        test_serde_version(&event, MAX_VERSION)
    }

    #[test]
    fn facility_masks() {
        assert_eq!(
            SubscriptionEventFacility::Sink.mask(),
            SubscriptionMask::SINK
        );
        assert_eq!(
            SubscriptionEventFacility::Server.mask(),
            SubscriptionMask::SERVER
        );
    }
}
