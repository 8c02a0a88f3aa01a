//! Typed flow record and event model shared by every detector.
//!
//! This crate owns the data this core reads and writes: the decoded
//! [`FlowRecord`] coming from the upstream flow exporter, the 128-bit
//! [`IpKey`] used to index per-host state, and the [`Event`] records this
//! core emits. It does not aggregate or detect anything; see the `engine`
//! crate for that.

#![deny(unused_import_braces, unused_qualifications)]

pub mod decode;
pub mod event;
pub mod ip;
pub mod time;

pub use event::{Event, EventType};
pub use ip::IpKey;
pub use time::Timestamp;

use serde::{Deserialize, Serialize};

/// Bitfield carried on every flow record (`DIR_BIT_FIELD` in the upstream
/// transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Direction {
    /// 0x8
    Request,
    /// 0x4
    Response,
    /// 0x2
    SingleFlow,
    /// 0x1 / unset
    NotRecognized,
}

impl Direction {
    pub fn from_bits(bits: u8) -> Self {
        if bits & 0x8 != 0 {
            Direction::Request
        } else if bits & 0x4 != 0 {
            Direction::Response
        } else if bits & 0x2 != 0 {
            Direction::SingleFlow
        } else {
            Direction::NotRecognized
        }
    }
}

/// TCP flag union across a flow, as a bitfield (`FIN,SYN,RST,PSH,ACK,URG`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

/// L4 protocol code (IANA protocol numbers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Proto(pub u8);

impl Proto {
    pub const TCP: Self = Self(6);
    pub const UDP: Self = Self(17);
}

/// A single decoded flow record, as produced by the upstream exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRecord {
    pub src_ip: IpKey,
    pub dst_ip: IpKey,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: Proto,
    pub packets: u32,
    pub bytes: u64,
    pub tcp_flags: TcpFlags,
    pub time_first: Timestamp,
    pub time_last: Timestamp,
    pub direction: Direction,
    pub link_bit_field: u64,
}

/// Errors surfaced while validating a decoded [`FlowRecord`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("time_last ({time_last}) < time_first ({time_first})")]
    TimeOrder { time_first: u32, time_last: u32 },
}

impl FlowRecord {
    /// Validates the invariant `time_last >= time_first`.
    ///
    /// Callers must drop the record with a warning on error rather than
    /// propagate it further (spec §3, §7).
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.time_last.secs < self.time_first.secs {
            return Err(FlowError::TimeOrder {
                time_first: self.time_first.secs,
                time_last: self.time_last.secs,
            });
        }
        Ok(())
    }

    /// Upstream fragment-reassembly artifact: UDP flows with both ports
    /// zero carry no useful information and are silently skipped.
    pub fn is_fragment_artifact(&self) -> bool {
        self.proto == Proto::UDP && self.src_port == 0 && self.dst_port == 0
    }

    /// Flow duration in seconds, per the `d = time_last - time_first + 1`
    /// convention used by the rolling interval accumulator.
    pub fn duration_secs(&self) -> u32 {
        self.time_last.secs - self.time_first.secs + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(time_first: u32, time_last: u32) -> FlowRecord {
        FlowRecord {
            src_ip: IpKey::from_v4([10, 0, 0, 1]),
            dst_ip: IpKey::from_v4([10, 0, 0, 2]),
            src_port: 1234,
            dst_port: 80,
            proto: Proto::TCP,
            packets: 1,
            bytes: 100,
            tcp_flags: TcpFlags(TcpFlags::SYN),
            time_first: Timestamp::from_secs(time_first),
            time_last: Timestamp::from_secs(time_last),
            direction: Direction::NotRecognized,
            link_bit_field: 0,
        }
    }

    #[test]
    fn validate_rejects_time_order_violation() {
        assert!(flow(100, 99).validate().is_err());
        assert!(flow(100, 100).validate().is_ok());
        assert!(flow(100, 101).validate().is_ok());
    }

    #[test]
    fn fragment_artifact_detected_only_for_udp_zero_ports() {
        let mut f = flow(1, 1);
        f.proto = Proto::UDP;
        f.src_port = 0;
        f.dst_port = 0;
        assert!(f.is_fragment_artifact());
        f.proto = Proto::TCP;
        assert!(!f.is_fragment_artifact());
    }

    #[test]
    fn duration_secs_counts_inclusive() {
        assert_eq!(flow(10, 10).duration_secs(), 1);
        assert_eq!(flow(10, 12).duration_secs(), 3);
    }
}
