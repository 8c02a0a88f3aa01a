//! Threshold rule engine (C7): R1-R6 over a [`HostRecord`] snapshot,
//! grounded on `hoststatsnemea/src/detectionrules.cpp`'s
//! `check_new_rules`/`check_new_rules_ssh`/`check_new_rules_dns`. R7
//! (horizontal per-source-port address scan) is a separate compact
//! detector, see [`crate::haddrscan`].

use crate::config::Config;
use crate::host::HostRecord;
use netflow::{Event, EventType, IpKey, Proto};

fn est(primary: u64, all: u64, req: u64, rsp: u64, ratio: f64) -> u64 {
    primary + ((all.saturating_sub(req + rsp)) as f64 * ratio) as u64
}

/// R1: horizontal SYN scan, attacker side.
pub fn check_syn_scan(cfg: &Config, key: IpKey, rec: &HostRecord) -> Option<Event> {
    let out = &rec.outbound;
    let inb = &rec.inbound;
    let est_req_syn = est(
        out.req.flags.syn as u64,
        out.all.flags.syn as u64,
        out.req.flags.syn as u64,
        out.rsp.flags.syn as u64,
        cfg.dos_req_rsp_est_ratio,
    );
    let est_req_ack = est(
        out.req.flags.ack as u64,
        out.all.flags.ack as u64,
        out.req.flags.ack as u64,
        out.rsp.flags.ack as u64,
        cfg.dos_req_rsp_est_ratio,
    );
    let est_in_rsp_ack = est(
        inb.rsp.flags.ack as u64,
        inb.all.flags.ack as u64,
        inb.req.flags.ack as u64,
        inb.rsp.flags.ack as u64,
        cfg.dos_rsp_req_est_ratio,
    );

    if est_req_syn > cfg.syn_scan_threshold
        && est_req_syn > cfg.syn_scan_syn_to_ack_ratio * est_req_ack
        && est_req_syn > cfg.syn_scan_request_to_response_ratio * est_in_rsp_ack
        && out.req_uniqueips >= cfg.syn_scan_ips
        && out.req.flags.syn as u64 > out.all.flows as u64 / 2
        && out.req.flags.syn as u64 > 10 * inb.all.flags.syn as u64
    {
        let scale = out.all.flags.syn.saturating_sub(out.all.flags.ack);
        if scale == 0 {
            return None;
        }
        return Some(
            Event::new(EventType::PortScanHorizontal, rec.first_seen, rec.last_seen)
                .with_src_addr(key)
                .with_proto(Proto::TCP)
                .with_scale(scale)
                .with_note("horizontal SYN scan"),
        );
    }
    None
}

/// R2: DoS victim.
pub fn check_dos_victim(cfg: &Config, key: IpKey, rec: &HostRecord) -> Option<Event> {
    let inb = &rec.inbound;
    let out = &rec.outbound;

    let tcp_victim = inb.all.flags.syn as u64 > cfg.dos_victim_connections_synflood
        && inb.all.flags.syn as u64 > 2 * inb.all.flags.ack as u64
        && (inb.all.packets as u64) < cfg.dos_victim_packet_ratio * inb.all.flows as u64;

    let est_in_req_flows = est(
        inb.req.flows as u64,
        inb.all.flows as u64,
        inb.req.flows as u64,
        inb.rsp.flows as u64,
        cfg.dos_req_rsp_est_ratio,
    );
    let est_in_req_packets = est(
        inb.req.packets as u64,
        inb.all.packets as u64,
        inb.req.packets as u64,
        inb.rsp.packets as u64,
        cfg.dos_req_rsp_est_ratio,
    );
    let est_out_rsp_flows = est(
        out.rsp.flows as u64,
        out.all.flows as u64,
        out.req.flows as u64,
        out.rsp.flows as u64,
        cfg.dos_rsp_req_est_ratio,
    );

    let other_victim = est_in_req_flows > cfg.dos_victim_connections_others
        && est_in_req_packets < cfg.dos_victim_packet_ratio * est_in_req_flows
        && est_out_rsp_flows < est_in_req_flows / 2;

    if !tcp_victim && !other_victim {
        return None;
    }

    let mut note = format!(
        "in: {} flows, {} packets; out: {} flows, {} packets; approx. {} source addresses",
        inb.all.flows, inb.all.packets, out.all.flows, out.all.packets, inb.uniqueips
    );
    if tcp_victim {
        note.push_str("; SYN flood");
    }
    if (inb.all.flows as u64) < 2 * inb.uniqueips as u64 {
        note.push_str(" (probably spoofed)");
    }

    let scale = inb.all.flows;
    if scale == 0 {
        return None;
    }
    let mut evt = Event::new(EventType::Dos, rec.first_seen, rec.last_seen)
        .with_dst_addr(key)
        .with_scale(scale)
        .with_note(&note);
    if tcp_victim {
        evt = evt.with_proto(Proto::TCP);
    }
    Some(evt)
}

/// R3: DoS attacker, symmetric to R2.
pub fn check_dos_attacker(cfg: &Config, key: IpKey, rec: &HostRecord) -> Option<Event> {
    let out = &rec.outbound;
    let inb = &rec.inbound;
    let uniq = out.uniqueips.max(1) as u64;

    let tcp_attacker = out.all.flows as u64 >= cfg.dos_attacker_connections_synflood * uniq
        && (out.all.packets as u64) < cfg.dos_attacker_packet_ratio * out.all.flows as u64
        && out.all.flags.syn as u64 > 2 * out.all.flags.ack as u64;

    let est_out_req_flows = est(
        out.req.flows as u64,
        out.all.flows as u64,
        out.req.flows as u64,
        out.rsp.flows as u64,
        cfg.dos_req_rsp_est_ratio,
    );
    let est_out_req_packets = est(
        out.req.packets as u64,
        out.all.packets as u64,
        out.req.packets as u64,
        out.rsp.packets as u64,
        cfg.dos_req_rsp_est_ratio,
    );
    let est_in_rsp_flows = est(
        inb.rsp.flows as u64,
        inb.all.flows as u64,
        inb.req.flows as u64,
        inb.rsp.flows as u64,
        cfg.dos_rsp_req_est_ratio,
    );

    let other_attacker = est_out_req_flows >= cfg.dos_attacker_connections_others * uniq
        && est_out_req_packets < cfg.dos_attacker_packet_ratio * est_out_req_flows
        && est_in_rsp_flows < est_out_req_flows / 2;

    if !tcp_attacker && !other_attacker {
        return None;
    }

    let mut note = format!(
        "out: {} flows, {} packets; in: {} flows, {} packets; approx. {} destination addresses",
        out.all.flows, out.all.packets, inb.all.flows, inb.all.packets, out.uniqueips
    );
    if tcp_attacker {
        note.push_str("; SYN flood");
    }

    let scale = out.all.flows;
    if scale == 0 {
        return None;
    }
    let mut evt = Event::new(EventType::Dos, rec.first_seen, rec.last_seen)
        .with_src_addr(key)
        .with_scale(scale)
        .with_note(&note);
    if tcp_attacker {
        evt = evt.with_proto(Proto::TCP);
    }
    Some(evt)
}

/// R4: SSH brute-force, both directions. Requires the SSH sub-profile.
pub fn check_ssh_bruteforce(cfg: &Config, key: IpKey, rec: &HostRecord) -> Vec<Event> {
    let mut events = Vec::new();
    let Some(ssh) = rec.ssh else {
        return events;
    };
    let data_threshold = cfg.bruteforce_data_threshold();

    let victim = (ssh.out_rsp_packets as u64 >= cfg.bruteforce_data_min_packet_ratio * ssh.out_rsp_syn_cnt as u64
        && ssh.out_rsp_packets as u64 <= cfg.bruteforce_data_max_packet_ratio * ssh.out_rsp_syn_cnt as u64
        && ssh.out_rsp_syn_cnt as u64 > data_threshold)
        && (ssh.in_req_packets as u64 >= cfg.bruteforce_req_min_packet_ratio * ssh.in_req_syn_cnt as u64
            && ssh.in_req_packets as u64 <= cfg.bruteforce_req_max_packet_ratio * ssh.in_req_syn_cnt as u64
            && ssh.in_req_syn_cnt as u64 > cfg.bruteforce_req_threshold)
        && (ssh.in_req_syn_cnt as u64 > cfg.bruteforce_server_ratio * ssh.out_req_syn_cnt as u64)
        && (ssh.out_rsp_syn_cnt as u64 > cfg.bruteforce_ips_ratio * ssh.out_all_uniqueips as u64);

    if victim {
        events.push(
            Event::new(EventType::BruteForce, rec.first_seen, rec.last_seen)
                .with_proto(Proto::TCP)
                .with_dst_port(22)
                .with_dst_addr(key)
                .with_scale(ssh.in_req_syn_cnt.max(1))
                .with_note("victim"),
        );
    }

    let req_ok = ssh.out_req_packets as u64 > cfg.bruteforce_req_min_packet_ratio * ssh.out_req_syn_cnt as u64
        && (ssh.out_req_packets as u64) < cfg.bruteforce_req_max_packet_ratio * ssh.out_req_syn_cnt as u64
        && ssh.out_req_syn_cnt as u64 > cfg.bruteforce_req_threshold;
    let rsp_ok = ssh.in_rsp_packets as u64 > cfg.bruteforce_data_min_packet_ratio * ssh.in_rsp_syn_cnt as u64
        && (ssh.in_rsp_packets as u64) < cfg.bruteforce_data_max_packet_ratio * ssh.in_rsp_syn_cnt as u64
        && ssh.in_rsp_syn_cnt as u64 > data_threshold;
    let not_server = (ssh.in_req_syn_cnt as u64) < cfg.bruteforce_server_ratio * ssh.out_req_syn_cnt as u64;

    if req_ok && rsp_ok && not_server {
        let few_ips = ssh.out_req_syn_cnt as u64 > cfg.bruteforce_ips_ratio * ssh.out_all_uniqueips as u64
            && ssh.out_all_uniqueips < cfg.bruteforce_ips;
        let many_ips = ssh.out_req_syn_cnt as u64 > (cfg.bruteforce_ips_ratio * ssh.out_all_uniqueips as u64) / 2
            && ssh.out_all_uniqueips >= cfg.bruteforce_ips;
        if few_ips || many_ips {
            events.push(
                Event::new(EventType::BruteForce, rec.first_seen, rec.last_seen)
                    .with_proto(Proto::TCP)
                    .with_src_port(22)
                    .with_src_addr(key)
                    .with_scale(ssh.out_req_syn_cnt.max(1))
                    .with_note("attacker"),
            );
        }
    }

    events
}

/// R5: DNS amplification. Requires the DNS sub-profile.
pub fn check_dns_amplification(cfg: &Config, key: IpKey, rec: &HostRecord) -> Vec<Event> {
    let mut events = Vec::new();
    let Some(dns) = rec.dns else {
        return events;
    };

    if dns.out_rsp_overlimit_cnt as u64 > cfg.dns_amplif_threshold {
        events.push(
            Event::new(EventType::DnsAmplification, rec.first_seen, rec.last_seen)
                .with_src_port(53)
                .with_src_addr(key)
                .with_scale(dns.out_rsp_overlimit_cnt)
                .with_note("DNS amplification - misused server"),
        );
    }
    if dns.in_rsp_overlimit_cnt as u64 > cfg.dns_amplif_threshold {
        events.push(
            Event::new(EventType::DnsAmplification, rec.first_seen, rec.last_seen)
                .with_dst_port(53)
                .with_dst_addr(key)
                .with_scale(dns.in_rsp_overlimit_cnt)
                .with_note("DNS amplification - victim"),
        );
    }
    events
}

/// Runs every enabled rule over one host record, returning all events it
/// fires (spec: "rules are independent; multiple rules may fire on one
/// record").
pub fn evaluate(cfg: &Config, key: IpKey, rec: &HostRecord) -> Vec<Event> {
    let mut events = Vec::new();
    if cfg.rules_generic {
        events.extend(check_syn_scan(cfg, key, rec));
        events.extend(check_dos_victim(cfg, key, rec));
        events.extend(check_dos_attacker(cfg, key, rec));
    }
    if cfg.rules_ssh {
        events.extend(check_ssh_bruteforce(cfg, key, rec));
    }
    if cfg.rules_dns {
        events.extend(check_dns_amplification(cfg, key, rec));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DirectionCounters, FlagCounters, RoleCounters, SshProfile};
    use netflow::Timestamp;

    fn counters(flows: u32, packets: u32, syn: u32, ack: u32) -> RoleCounters {
        RoleCounters {
            flows,
            packets,
            bytes: 0,
            flags: FlagCounters { syn, ack, fin: 0, rst: 0, psh: 0, urg: 0 },
        }
    }

    #[test]
    fn syn_scan_strict_threshold_boundary() {
        let cfg = Config::default();
        let key = IpKey::from_v4([10, 0, 0, 1]);
        let mut rec = HostRecord {
            first_seen: Timestamp::from_secs(1),
            last_seen: Timestamp::from_secs(2),
            outbound: DirectionCounters {
                all: counters(410, 410, 200, 0),
                req: counters(200, 200, 200, 0),
                rsp: counters(0, 0, 0, 0),
                uniqueips: 200,
                req_uniqueips: 200,
                linkbitfield: 0,
            },
            ..Default::default()
        };

        assert!(check_syn_scan(&cfg, key, &rec).is_none(), "exactly threshold must not fire");

        rec.outbound.all.flags.syn = 201;
        rec.outbound.req.flags.syn = 201;
        rec.outbound.all.flows = 380;
        assert!(check_syn_scan(&cfg, key, &rec).is_some(), "threshold+1 with other predicates holding should fire");
    }

    #[test]
    fn ssh_bruteforce_victim_fires_on_documented_shape() {
        let cfg = Config::default();
        let key = IpKey::from_v4([10, 0, 0, 5]);
        let rec = HostRecord {
            first_seen: Timestamp::from_secs(1),
            last_seen: Timestamp::from_secs(2),
            ssh: Some(SshProfile {
                out_req_packets: 0,
                out_rsp_packets: 400,
                out_req_syn_cnt: 10,
                out_rsp_syn_cnt: 40,
                out_all_uniqueips: 1,
                in_req_packets: 600,
                in_rsp_packets: 0,
                in_req_syn_cnt: 61,
                in_rsp_syn_cnt: 0,
                in_all_uniqueips: 1,
            }),
            ..Default::default()
        };
        let events = check_ssh_bruteforce(&cfg, key, &rec);
        assert!(events.iter().any(|e| e.note == "victim"));
    }

    #[test]
    fn dns_amplification_fires_past_threshold_only() {
        let cfg = Config::default();
        let key = IpKey::from_v4([198, 51, 100, 5]);
        let rec = HostRecord {
            dns: Some(crate::host::DnsProfile { in_rsp_overlimit_cnt: 0, out_rsp_overlimit_cnt: 10_001 }),
            ..Default::default()
        };
        let events = check_dns_amplification(&cfg, key, &rec);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].note, "DNS amplification - misused server");
    }
}
