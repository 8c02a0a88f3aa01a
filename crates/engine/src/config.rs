//! Engine configuration: every tunable in spec §6's configuration table,
//! loaded as a populated struct (the XML/INI loader upstream used is out
//! of scope here — the engine only ever sees a `Config` value).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub table_size: u32,
    pub det_start_time: u32,
    pub timeout_active: u32,
    pub timeout_inactive: u32,

    pub rules_generic: bool,
    pub rules_ssh: bool,
    pub rules_dns: bool,
    pub port_flowdir: bool,

    pub syn_scan_threshold: u64,
    pub syn_scan_syn_to_ack_ratio: u64,
    pub syn_scan_request_to_response_ratio: u64,
    pub syn_scan_ips: u32,

    pub dos_victim_connections_synflood: u64,
    pub dos_victim_connections_others: u64,
    pub dos_victim_packet_ratio: u64,
    pub dos_attacker_connections_synflood: u64,
    pub dos_attacker_connections_others: u64,
    pub dos_attacker_packet_ratio: u64,
    pub dos_req_rsp_est_ratio: f64,
    pub dos_rsp_req_est_ratio: f64,

    pub bruteforce_req_threshold: u64,
    pub bruteforce_req_min_packet_ratio: u64,
    pub bruteforce_req_max_packet_ratio: u64,
    pub bruteforce_data_min_packet_ratio: u64,
    pub bruteforce_data_max_packet_ratio: u64,
    pub bruteforce_ips: u32,
    pub bruteforce_ips_ratio: u64,
    pub bruteforce_server_ratio: u64,

    pub dns_amplif_threshold: u64,

    pub ddos_interval: u32,
    pub ddos_max_flow_len: u32,
    pub ddos_max_flow_delay: u32,
    pub ddos_threshold_flow_rate: u64,
    pub ddos_min_flow: u64,

    pub numaddrs_threshold: u32,
    pub haddrscan_idle_threshold: u32,
    pub haddrscan_pruning_interval: u32,

    pub recv_timeout_secs: u32,
}

impl Config {
    /// `BRUTEFORCE_DATA_THRESHOLD = 0.5 * BRUTEFORCE_REQ_THRESHOLD` in the
    /// original: it is derived, not independently configurable.
    pub fn bruteforce_data_threshold(&self) -> u64 {
        self.bruteforce_req_threshold / 2
    }

    /// `N = (max_flow_len + max_flow_delay) / interval` rolling-window slots.
    pub fn ddos_n_intervals(&self) -> u32 {
        (self.ddos_max_flow_len + self.ddos_max_flow_delay) / self.ddos_interval
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            table_size: 65536,
            det_start_time: 10,
            timeout_active: 300,
            timeout_inactive: 30,

            rules_generic: true,
            rules_ssh: false,
            rules_dns: false,
            port_flowdir: false,

            syn_scan_threshold: 200,
            syn_scan_syn_to_ack_ratio: 20,
            syn_scan_request_to_response_ratio: 5,
            syn_scan_ips: 200,

            dos_victim_connections_synflood: 270_000,
            dos_victim_connections_others: 1_000_000,
            dos_victim_packet_ratio: 2,
            dos_attacker_connections_synflood: 270_000,
            dos_attacker_connections_others: 1_000_000,
            dos_attacker_packet_ratio: 2,
            dos_req_rsp_est_ratio: 0.8,
            dos_rsp_req_est_ratio: 0.2,

            bruteforce_req_threshold: 60,
            bruteforce_req_min_packet_ratio: 5,
            bruteforce_req_max_packet_ratio: 20,
            bruteforce_data_min_packet_ratio: 10,
            bruteforce_data_max_packet_ratio: 25,
            bruteforce_ips: 5,
            bruteforce_ips_ratio: 20,
            bruteforce_server_ratio: 3,

            dns_amplif_threshold: 10_000,

            ddos_interval: 60,
            ddos_max_flow_len: 330,
            ddos_max_flow_delay: 90,
            ddos_threshold_flow_rate: 4,
            ddos_min_flow: 250 * 60,

            numaddrs_threshold: 50,
            haddrscan_idle_threshold: 300,
            haddrscan_pruning_interval: 60,

            recv_timeout_secs: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.table_size, 65536);
        assert_eq!(cfg.syn_scan_threshold, 200);
        assert_eq!(cfg.ddos_n_intervals(), 7);
        assert_eq!(cfg.bruteforce_data_threshold(), 30);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }
}
