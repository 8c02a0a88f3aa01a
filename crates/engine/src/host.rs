//! Per-host counter aggregation (C5), grounded on
//! `hoststatsnemea/src/hoststats.h`'s `hosts_record_t` and the subprofile
//! record shapes in `subprofiles.h`.

use netflow::{Direction, FlowRecord, Proto, TcpFlags, Timestamp};

/// TCP flag tallies: count of flows (not packets) that carried the flag.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlagCounters {
    pub syn: u32,
    pub ack: u32,
    pub fin: u32,
    pub rst: u32,
    pub psh: u32,
    pub urg: u32,
}

impl FlagCounters {
    fn record(&mut self, flags: TcpFlags) {
        if flags.has(TcpFlags::SYN) {
            self.syn = self.syn.saturating_add(1);
        }
        if flags.has(TcpFlags::ACK) {
            self.ack = self.ack.saturating_add(1);
        }
        if flags.has(TcpFlags::FIN) {
            self.fin = self.fin.saturating_add(1);
        }
        if flags.has(TcpFlags::RST) {
            self.rst = self.rst.saturating_add(1);
        }
        if flags.has(TcpFlags::PSH) {
            self.psh = self.psh.saturating_add(1);
        }
        if flags.has(TcpFlags::URG) {
            self.urg = self.urg.saturating_add(1);
        }
    }
}

/// Flow/packet/byte/flag tally for one role (all, request-only or
/// response-only flows) in one direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoleCounters {
    pub flows: u32,
    pub packets: u32,
    pub bytes: u64,
    pub flags: FlagCounters,
}

impl RoleCounters {
    fn record(&mut self, packets: u32, bytes: u64, flags: TcpFlags) {
        self.flows = self.flows.saturating_add(1);
        self.packets = self.packets.saturating_add(packets);
        self.bytes = self.bytes.saturating_add(bytes);
        self.flags.record(flags);
    }
}

/// Everything counted for one direction (inbound or outbound) of a host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirectionCounters {
    pub all: RoleCounters,
    pub req: RoleCounters,
    pub rsp: RoleCounters,
    pub uniqueips: u32,
    pub req_uniqueips: u32,
    pub linkbitfield: u64,
}

impl DirectionCounters {
    fn record(&mut self, packets: u32, bytes: u64, flags: TcpFlags, dir: Direction, link: u64) {
        self.all.record(packets, bytes, flags);
        match dir {
            Direction::Request => self.req.record(packets, bytes, flags),
            Direction::Response => self.rsp.record(packets, bytes, flags),
            Direction::SingleFlow | Direction::NotRecognized => {}
        }
        self.linkbitfield |= link;
    }
}

/// SSH sub-profile, present only once a host has exchanged at least one
/// TCP/22 flow (`subprofiles.h`'s `ssh_data_t`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SshProfile {
    pub out_req_packets: u32,
    pub out_rsp_packets: u32,
    pub out_req_syn_cnt: u32,
    pub out_rsp_syn_cnt: u32,
    pub out_all_uniqueips: u32,
    pub in_req_packets: u32,
    pub in_rsp_packets: u32,
    pub in_req_syn_cnt: u32,
    pub in_rsp_syn_cnt: u32,
    pub in_all_uniqueips: u32,
}

/// DNS sub-profile (`subprofiles.h`'s `dns_data_t`); "overlimit" flows are
/// responses of at least 1000 bytes, the amplification signal R5 looks for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DnsProfile {
    pub in_rsp_overlimit_cnt: u32,
    pub out_rsp_overlimit_cnt: u32,
}

pub const DNS_BYTES_OVERLIMIT: u64 = 1000;

/// The per-IP aggregate maintained by the engine (spec §3 `HostRecord`).
#[derive(Debug, Default, Clone)]
pub struct HostRecord {
    pub inbound: DirectionCounters,
    pub outbound: DirectionCounters,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub ssh: Option<SshProfile>,
    pub dns: Option<DnsProfile>,
}

/// Whether an SSH/DNS sub-profile filter matches this flow (spec §4.C5 step 4).
pub fn matches_ssh(r: &FlowRecord) -> bool {
    r.proto == Proto::TCP && (r.src_port == 22 || r.dst_port == 22)
}

pub fn matches_dns(r: &FlowRecord) -> bool {
    (r.proto == Proto::TCP || r.proto == Proto::UDP) && (r.src_port == 53 || r.dst_port == 53)
}

/// Derive direction from ports when `port_flowdir` is configured: the
/// lower-numbered, sub-10000 port is the responder (spec §4.C5 step 1).
pub fn derive_direction_from_ports(src_port: u16, dst_port: u16) -> Direction {
    if src_port == dst_port {
        return Direction::NotRecognized;
    }
    let (lo, responder_is_src) = if src_port < dst_port {
        (src_port, true)
    } else {
        (dst_port, false)
    };
    if lo >= 10000 {
        return Direction::NotRecognized;
    }
    if responder_is_src {
        Direction::Response
    } else {
        Direction::Request
    }
}

impl HostRecord {
    fn touch(&mut self, time_first: Timestamp, time_last: Timestamp) {
        let is_first_flow = self.first_seen == Timestamp::default() && self.last_seen == Timestamp::default();
        if is_first_flow || time_first < self.first_seen {
            self.first_seen = time_first;
        }
        if time_last > self.last_seen {
            self.last_seen = time_last;
        }
    }

    /// Update this record as the *source* endpoint of flow `r`.
    /// `all_is_new` reports an all-bloom-pair miss on this (src,dst) edge
    /// and drives `uniqueips`; `req_is_new` reports a request-only-bloom
    /// miss and drives `req_uniqueips`, independently (spec §4.C5 step 2:
    /// the two counters are each driven by their own bloom pair's miss,
    /// not by either pair missing).
    pub fn update_as_source(&mut self, r: &FlowRecord, dir: Direction, all_is_new: bool, req_is_new: bool) {
        self.touch(r.time_first, r.time_last);
        self.outbound
            .record(r.packets, r.bytes, r.tcp_flags, dir, r.link_bit_field);
        if all_is_new {
            self.outbound.uniqueips = self.outbound.uniqueips.saturating_add(1);
        }
        if req_is_new {
            self.outbound.req_uniqueips = self.outbound.req_uniqueips.saturating_add(1);
        }
    }

    /// Update this record as the *destination* endpoint of flow `r`. See
    /// [`update_as_source`](Self::update_as_source) for `all_is_new`/`req_is_new`.
    pub fn update_as_destination(&mut self, r: &FlowRecord, dir: Direction, all_is_new: bool, req_is_new: bool) {
        self.touch(r.time_first, r.time_last);
        self.inbound
            .record(r.packets, r.bytes, r.tcp_flags, dir, r.link_bit_field);
        if all_is_new {
            self.inbound.uniqueips = self.inbound.uniqueips.saturating_add(1);
        }
        if req_is_new {
            self.inbound.req_uniqueips = self.inbound.req_uniqueips.saturating_add(1);
        }
    }

    pub fn update_ssh_as_source(&mut self, r: &FlowRecord, dir: Direction, peer_is_new: bool) {
        let ssh = self.ssh.get_or_insert_with(SshProfile::default);
        if peer_is_new {
            ssh.out_all_uniqueips = ssh.out_all_uniqueips.saturating_add(1);
        }
        match dir {
            Direction::Request => {
                ssh.out_req_packets = ssh.out_req_packets.saturating_add(r.packets);
                if r.tcp_flags.has(TcpFlags::SYN) {
                    ssh.out_req_syn_cnt = ssh.out_req_syn_cnt.saturating_add(1);
                }
            }
            Direction::Response => {
                ssh.out_rsp_packets = ssh.out_rsp_packets.saturating_add(r.packets);
                if r.tcp_flags.has(TcpFlags::SYN) {
                    ssh.out_rsp_syn_cnt = ssh.out_rsp_syn_cnt.saturating_add(1);
                }
            }
            _ => {}
        }
    }

    pub fn update_ssh_as_destination(&mut self, r: &FlowRecord, dir: Direction, peer_is_new: bool) {
        let ssh = self.ssh.get_or_insert_with(SshProfile::default);
        if peer_is_new {
            ssh.in_all_uniqueips = ssh.in_all_uniqueips.saturating_add(1);
        }
        match dir {
            Direction::Request => {
                ssh.in_req_packets = ssh.in_req_packets.saturating_add(r.packets);
                if r.tcp_flags.has(TcpFlags::SYN) {
                    ssh.in_req_syn_cnt = ssh.in_req_syn_cnt.saturating_add(1);
                }
            }
            Direction::Response => {
                ssh.in_rsp_packets = ssh.in_rsp_packets.saturating_add(r.packets);
                if r.tcp_flags.has(TcpFlags::SYN) {
                    ssh.in_rsp_syn_cnt = ssh.in_rsp_syn_cnt.saturating_add(1);
                }
            }
            _ => {}
        }
    }

    pub fn update_dns_as_source(&mut self, r: &FlowRecord, dir: Direction) {
        let dns = self.dns.get_or_insert_with(DnsProfile::default);
        if dir == Direction::Response && r.bytes >= DNS_BYTES_OVERLIMIT {
            dns.out_rsp_overlimit_cnt = dns.out_rsp_overlimit_cnt.saturating_add(1);
        }
    }

    pub fn update_dns_as_destination(&mut self, r: &FlowRecord, dir: Direction) {
        let dns = self.dns.get_or_insert_with(DnsProfile::default);
        if dir == Direction::Response && r.bytes >= DNS_BYTES_OVERLIMIT {
            dns.in_rsp_overlimit_cnt = dns.in_rsp_overlimit_cnt.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netflow::{IpKey, Proto};

    fn syn_flow(src: [u8; 4], dst: [u8; 4], dport: u16) -> FlowRecord {
        FlowRecord {
            src_ip: IpKey::from_v4(src),
            dst_ip: IpKey::from_v4(dst),
            src_port: 40000,
            dst_port: dport,
            proto: Proto::TCP,
            packets: 1,
            bytes: 60,
            tcp_flags: TcpFlags(TcpFlags::SYN),
            time_first: Timestamp::from_secs(100),
            time_last: Timestamp::from_secs(100),
            direction: Direction::Request,
            link_bit_field: 1,
        }
    }

    #[test]
    fn source_update_counts_flow_and_unique_peer() {
        let mut rec = HostRecord::default();
        let flow = syn_flow([10, 0, 0, 1], [10, 0, 0, 2], 22);
        rec.update_as_source(&flow, Direction::Request, true, true);
        assert_eq!(rec.outbound.all.flows, 1);
        assert_eq!(rec.outbound.req.flows, 1);
        assert_eq!(rec.outbound.all.flags.syn, 1);
        assert_eq!(rec.outbound.uniqueips, 1);
        assert_eq!(rec.outbound.req_uniqueips, 1);
    }

    #[test]
    fn repeated_peer_does_not_bump_uniqueips() {
        let mut rec = HostRecord::default();
        let flow = syn_flow([10, 0, 0, 1], [10, 0, 0, 2], 22);
        rec.update_as_source(&flow, Direction::Request, true, true);
        rec.update_as_source(&flow, Direction::Request, false, false);
        assert_eq!(rec.outbound.all.flows, 2);
        assert_eq!(rec.outbound.uniqueips, 1);
    }

    #[test]
    fn all_bloom_hit_with_request_bloom_miss_only_bumps_req_uniqueips() {
        let mut rec = HostRecord::default();
        let flow = syn_flow([10, 0, 0, 1], [10, 0, 0, 2], 22);
        rec.update_as_source(&flow, Direction::Request, false, true);
        assert_eq!(rec.outbound.uniqueips, 0, "all-bloom reported a hit, uniqueips must not bump");
        assert_eq!(rec.outbound.req_uniqueips, 1, "request-bloom reported a miss, req_uniqueips must bump");
    }

    #[test]
    fn derive_direction_from_ports_picks_low_responder() {
        assert_eq!(derive_direction_from_ports(40000, 22), Direction::Request);
        assert_eq!(derive_direction_from_ports(22, 40000), Direction::Response);
        assert_eq!(derive_direction_from_ports(40000, 40001), Direction::NotRecognized);
        assert_eq!(
            derive_direction_from_ports(20000, 30000),
            Direction::NotRecognized
        );
    }

    #[test]
    fn ssh_and_dns_filters_match_expected_ports() {
        let ssh_flow = syn_flow([10, 0, 0, 1], [10, 0, 0, 2], 22);
        assert!(matches_ssh(&ssh_flow));
        assert!(!matches_dns(&ssh_flow));
        let dns_flow = syn_flow([10, 0, 0, 1], [10, 0, 0, 2], 53);
        assert!(matches_dns(&dns_flow));
    }

    #[test]
    fn dns_overlimit_counts_big_responses_only() {
        let mut rec = HostRecord::default();
        let mut big = syn_flow([10, 0, 0, 1], [10, 0, 0, 2], 53);
        big.bytes = 2000;
        rec.update_dns_as_source(&big, Direction::Response);
        assert_eq!(rec.dns.unwrap().out_rsp_overlimit_cnt, 1);

        let mut small = syn_flow([10, 0, 0, 1], [10, 0, 0, 2], 53);
        small.bytes = 100;
        let mut rec2 = HostRecord::default();
        rec2.update_dns_as_source(&small, Direction::Response);
        assert_eq!(rec2.dns.unwrap().out_rsp_overlimit_cnt, 0);
    }
}
