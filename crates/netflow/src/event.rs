//! Output event model (spec §3 `Event`, §6 event type codes).

use crate::{IpKey, Proto, Timestamp};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Stable wire codes for each event type (spec §6).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr, strum::Display,
)]
#[repr(u8)]
pub enum EventType {
    PortScan = 1,
    PortScanHorizontal = 2,
    PortScanVertical = 3,
    BruteForce = 10,
    Dos = 11,
    DnsAmplification = 12,
    SynFlood = 13,
    BlacklistIp = 20,
    BlacklistUrl = 21,
    BlacklistDns = 22,
}

/// A structured alert emitted to the output transport and the daily log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub time_first: Timestamp,
    pub time_last: Timestamp,
    pub src_addrs: Vec<IpKey>,
    pub dst_addrs: Vec<IpKey>,
    pub src_ports: Vec<u16>,
    pub dst_ports: Vec<u16>,
    pub protocols: Vec<Proto>,
    pub scale: u32,
    pub note: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event has neither a source nor a destination address")]
    NoAddress,
    #[error("time_first ({time_first:?}) > time_last ({time_last:?})")]
    TimeOrder {
        time_first: Timestamp,
        time_last: Timestamp,
    },
    #[error("event scale must be > 0")]
    NonPositiveScale,
}

impl Event {
    pub fn new(event_type: EventType, time_first: Timestamp, time_last: Timestamp) -> Self {
        Self {
            event_type,
            time_first,
            time_last,
            src_addrs: Vec::new(),
            dst_addrs: Vec::new(),
            src_ports: Vec::new(),
            dst_ports: Vec::new(),
            protocols: Vec::new(),
            scale: 0,
            note: String::new(),
        }
    }

    pub fn with_src_addr(mut self, addr: IpKey) -> Self {
        self.src_addrs.push(addr);
        self
    }

    pub fn with_dst_addr(mut self, addr: IpKey) -> Self {
        self.dst_addrs.push(addr);
        self
    }

    pub fn with_src_port(mut self, port: u16) -> Self {
        self.src_ports.push(port);
        self
    }

    pub fn with_dst_port(mut self, port: u16) -> Self {
        self.dst_ports.push(port);
        self
    }

    pub fn with_proto(mut self, proto: Proto) -> Self {
        self.protocols.push(proto);
        self
    }

    pub fn with_scale(mut self, scale: u32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        let mut note = note.into();
        note.truncate(200);
        self.note = note;
        self
    }

    /// Validates the invariants spec §3/§8 place on every emitted event.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.src_addrs.is_empty() && self.dst_addrs.is_empty() {
            return Err(EventError::NoAddress);
        }
        if self.time_first > self.time_last {
            return Err(EventError::TimeOrder {
                time_first: self.time_first,
                time_last: self.time_last,
            });
        }
        if self.scale == 0 {
            return Err(EventError::NonPositiveScale);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_an_address() {
        let evt = Event::new(EventType::Dos, Timestamp::from_secs(1), Timestamp::from_secs(2))
            .with_scale(5);
        assert!(matches!(evt.validate(), Err(EventError::NoAddress)));
        let evt = evt.with_dst_addr(IpKey::from_v4([1, 2, 3, 4]));
        assert!(evt.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_scale() {
        let evt = Event::new(EventType::Dos, Timestamp::from_secs(1), Timestamp::from_secs(2))
            .with_dst_addr(IpKey::from_v4([1, 2, 3, 4]));
        assert!(matches!(evt.validate(), Err(EventError::NonPositiveScale)));
    }

    #[test]
    fn note_is_truncated_to_200_chars() {
        let long = "x".repeat(500);
        let evt = Event::new(EventType::Dos, Timestamp::from_secs(1), Timestamp::from_secs(1))
            .with_note(long);
        assert_eq!(evt.note.len(), 200);
    }
}
