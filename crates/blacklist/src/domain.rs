//! FQDN/URL blacklist lookup, grounded on `blacklistfilter/dnsblacklistfilter.cpp`
//! and `urlblacklistfilter.cpp`. Both load the same `entity\bl_id` file
//! format and normalize the same way (`www.` stripped, lowercased,
//! trailing `/` trimmed) but differ in match order (spec §3/§4.C8):
//! DNS is a suffix tree over dot-labels so a blacklisted `example.com`
//! also catches `foo.example.com`; URL is a prefix tree over `/`-segments
//! so a blacklisted `example.com/evil` also catches `example.com/evil/more`.
//!
//! Spec §4.C8/§6 keeps this lookup independent of [`FlowRecord`](netflow::FlowRecord):
//! the flow model carries no domain/URL field, so this API is exposed for a
//! caller holding an out-of-band HTTP Host/URL or DNS query name (e.g. from
//! a collaborator protocol parser) to consult directly.

const WWW_PREFIX: &str = "www.";

/// Lowercases, strips a leading `www.` and trailing slashes, exactly as
/// `check_blacklist` does before the tree search.
pub fn normalize(input: &str) -> String {
    let mut s = input.to_lowercase();
    if let Some(rest) = s.strip_prefix(WWW_PREFIX) {
        s = rest.to_string();
    }
    while s.ends_with('/') {
        s.pop();
    }
    s
}

fn parse_entries(text: &str) -> Vec<(String, u64)> {
    let mut out = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let Some(sep) = line.rfind('\\') else {
            log::warn!("blacklist file: bad formatted line number {}", i + 1);
            continue;
        };
        let entity = normalize(&line[..sep]);
        match line[sep + 1..].parse::<u64>() {
            Ok(bl_id) => out.push((entity, bl_id)),
            Err(_) => log::warn!("blacklist file: bad blacklist id on line {}", i + 1),
        }
    }
    out
}

/// FQDN blacklist: matches an entity or any of its subdomains against the
/// tree built from dot-separated labels, compared from the root label
/// inward (suffix order).
#[derive(Debug, Clone, Default)]
pub struct DnsTree {
    entries: Vec<(Vec<String>, u64)>,
}

fn labels_suffix_order(fqdn: &str) -> Vec<String> {
    fqdn.split('.').rev().map(str::to_owned).collect()
}

impl DnsTree {
    pub fn load(text: &str) -> Self {
        let entries = parse_entries(text)
            .into_iter()
            .map(|(fqdn, bl_id)| (labels_suffix_order(&fqdn), bl_id))
            .collect();
        DnsTree { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the blacklist id of the longest blacklisted suffix of
    /// `fqdn`, i.e. `example.com` blacklists `foo.example.com` too.
    pub fn lookup(&self, fqdn: &str) -> Option<u64> {
        let query = labels_suffix_order(&normalize(fqdn));
        let mut best: Option<(usize, u64)> = None;
        for (labels, bl_id) in &self.entries {
            if labels.len() > query.len() {
                continue;
            }
            if query[..labels.len()] == labels[..] && best.is_none_or(|(len, _)| labels.len() > len) {
                best = Some((labels.len(), *bl_id));
            }
        }
        best.map(|(_, bl_id)| bl_id)
    }
}

/// URL blacklist: matches an entity or any deeper path under it against
/// the tree built from `/`-separated segments, compared in prefix order.
#[derive(Debug, Clone, Default)]
pub struct UrlTree {
    entries: Vec<(Vec<String>, u64)>,
}

fn segments_prefix_order(url: &str) -> Vec<String> {
    url.split('/').map(str::to_owned).collect()
}

impl UrlTree {
    pub fn load(text: &str) -> Self {
        let entries = parse_entries(text)
            .into_iter()
            .map(|(url, bl_id)| (segments_prefix_order(&url), bl_id))
            .collect();
        UrlTree { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the blacklist id of the longest blacklisted prefix of
    /// `host_and_path`, i.e. `example.com/evil` blacklists
    /// `example.com/evil/more` too.
    pub fn lookup(&self, host_and_path: &str) -> Option<u64> {
        let query = segments_prefix_order(&normalize(host_and_path));
        let mut best: Option<(usize, u64)> = None;
        for (segs, bl_id) in &self.entries {
            if segs.len() > query.len() {
                continue;
            }
            if query[..segs.len()] == segs[..] && best.is_none_or(|(len, _)| segs.len() > len) {
                best = Some((segs.len(), *bl_id));
            }
        }
        best.map(|(_, bl_id)| bl_id)
    }
}
