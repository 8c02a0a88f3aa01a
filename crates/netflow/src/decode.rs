//! Decoder from the upstream transport's fixed-layout flow frame to
//! [`FlowRecord`].
//!
//! The wire format itself (IPC framing) is an external collaborator; this
//! module only defines the fixed-part layout this core expects once a
//! frame's bytes have been handed to it, and the two failure modes named
//! in spec §4.C1: frames shorter than the fixed part are rejected, and a
//! lone 1-byte payload is the clean end-of-stream marker.

use crate::{Direction, FlowRecord, IpKey, Proto, TcpFlags, Timestamp};
use std::io::{self, Read};

/// `SRC_IP DST_IP SRC_PORT DST_PORT PROTOCOL PACKETS BYTES TIME_FIRST
/// TIME_LAST TCP_FLAGS DIR_BIT_FIELD LINK_BIT_FIELD`
pub const FIXED_PART_SIZE: usize = 16 + 16 + 2 + 2 + 1 + 4 + 8 + 8 + 8 + 1 + 1 + 8;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame too short: expected at least {expected} bytes, got {got}")]
    TooShort { expected: usize, got: usize },
    #[error("I/O error reading frame: {0}")]
    Io(#[from] io::Error),
}

/// Result of reading one frame from the input transport.
#[derive(Debug)]
pub enum Frame {
    Record(FlowRecord),
    /// The transport sent its 1-byte end-of-stream marker; ingest should
    /// terminate cleanly.
    EndOfStream,
}

/// Decode a single frame from an in-memory byte slice (spec §4.C1 contract).
pub fn decode_frame(buf: &[u8]) -> Result<Frame, DecodeError> {
    if buf.len() == 1 {
        return Ok(Frame::EndOfStream);
    }
    if buf.len() < FIXED_PART_SIZE {
        return Err(DecodeError::TooShort {
            expected: FIXED_PART_SIZE,
            got: buf.len(),
        });
    }

    let mut off = 0;
    let mut take = |n: usize| {
        let s = &buf[off..off + n];
        off += n;
        s
    };

    let src_ip = IpKey(take(16).try_into().unwrap());
    let dst_ip = IpKey(take(16).try_into().unwrap());
    let src_port = u16::from_be_bytes(take(2).try_into().unwrap());
    let dst_port = u16::from_be_bytes(take(2).try_into().unwrap());
    let proto = Proto(take(1)[0]);
    let packets = u32::from_be_bytes(take(4).try_into().unwrap());
    let bytes = u64::from_be_bytes(take(8).try_into().unwrap());
    let time_first = Timestamp::from_packed(u64::from_be_bytes(take(8).try_into().unwrap()));
    let time_last = Timestamp::from_packed(u64::from_be_bytes(take(8).try_into().unwrap()));
    let tcp_flags = TcpFlags(take(1)[0]);
    let dir_bits = take(1)[0];
    let link_bit_field = u64::from_be_bytes(take(8).try_into().unwrap());

    Ok(Frame::Record(FlowRecord {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        proto,
        packets,
        bytes,
        tcp_flags,
        time_first,
        time_last,
        direction: Direction::from_bits(dir_bits),
        link_bit_field,
    }))
}

/// Encode a flow record back into the wire layout, used by tests and by
/// the offline replay tool to build synthetic input streams.
pub fn encode_frame(rec: &FlowRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FIXED_PART_SIZE);
    buf.extend_from_slice(&rec.src_ip.0);
    buf.extend_from_slice(&rec.dst_ip.0);
    buf.extend_from_slice(&rec.src_port.to_be_bytes());
    buf.extend_from_slice(&rec.dst_port.to_be_bytes());
    buf.push(rec.proto.0);
    buf.extend_from_slice(&rec.packets.to_be_bytes());
    buf.extend_from_slice(&rec.bytes.to_be_bytes());
    buf.extend_from_slice(&rec.time_first.to_packed().to_be_bytes());
    buf.extend_from_slice(&rec.time_last.to_packed().to_be_bytes());
    buf.push(rec.tcp_flags.0);
    buf.push(match rec.direction {
        Direction::Request => 0x8,
        Direction::Response => 0x4,
        Direction::SingleFlow => 0x2,
        Direction::NotRecognized => 0x1,
    });
    buf.extend_from_slice(&rec.link_bit_field.to_be_bytes());
    buf
}

/// Pulls consecutive fixed-size frames out of a byte stream (used by the
/// offline replay tool to read flow capture files).
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn next_frame(&mut self) -> Result<Frame, DecodeError> {
        let mut buf = vec![0u8; FIXED_PART_SIZE];
        let mut read = 0;
        while read < FIXED_PART_SIZE {
            let n = self.inner.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        decode_frame(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FlowRecord {
        FlowRecord {
            src_ip: IpKey::from_v4([10, 0, 0, 1]),
            dst_ip: IpKey::from_v4([192, 168, 1, 1]),
            src_port: 4444,
            dst_port: 22,
            proto: Proto::TCP,
            packets: 3,
            bytes: 900,
            tcp_flags: TcpFlags(TcpFlags::SYN | TcpFlags::ACK),
            time_first: Timestamp::from_secs(1000),
            time_last: Timestamp::from_secs(1002),
            direction: Direction::Request,
            link_bit_field: 0x1,
        }
    }

    #[test]
    fn roundtrips_through_wire_format() {
        let rec = sample();
        let buf = encode_frame(&rec);
        match decode_frame(&buf).unwrap() {
            Frame::Record(decoded) => assert_eq!(decoded, rec),
            Frame::EndOfStream => panic!("expected a record"),
        }
    }

    #[test]
    fn single_byte_payload_is_end_of_stream() {
        assert!(matches!(decode_frame(&[0u8]).unwrap(), Frame::EndOfStream));
    }

    #[test]
    fn short_frame_is_rejected() {
        let err = decode_frame(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, DecodeError::TooShort { .. }));
    }

    #[test]
    fn frame_reader_reads_multiple_records() {
        let rec = sample();
        let mut bytes = encode_frame(&rec);
        bytes.extend(encode_frame(&rec));
        bytes.push(0);
        let mut reader = FrameReader::new(io::Cursor::new(bytes));
        assert!(matches!(reader.next_frame().unwrap(), Frame::Record(_)));
        assert!(matches!(reader.next_frame().unwrap(), Frame::Record(_)));
        assert!(matches!(reader.next_frame().unwrap(), Frame::EndOfStream));
    }
}
