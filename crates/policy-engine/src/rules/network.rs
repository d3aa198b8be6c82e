//! Network rule matching: domain globs with wildcard subdomains, CIDR
//! containment, and port set membership.

use std::net::IpAddr;

use agentwarden_core::config::Defaults;
use agentwarden_core::types::{Category, Decision, Verdict};

#[derive(Debug)]
pub struct NetworkMatcher {
    pub name: String,
    /// Lowercased at compile time.
    pub(crate) domains: Vec<String>,
    pub(crate) cidrs: Vec<Cidr>,
    /// Empty means any port.
    pub(crate) ports: Vec<u16>,
    pub(crate) verdict: Verdict,
}

impl NetworkMatcher {
    fn matches(&self, host: &str, ip: Option<IpAddr>, port: u16) -> bool {
        // Check 1: port set membership.
        if !self.ports.is_empty() && !self.ports.contains(&port) {
            return false;
        }

        // Check 2: destination. A rule with neither domains nor cidrs is
        // a ports-only rule and matches any destination.
        if self.domains.is_empty() && self.cidrs.is_empty() {
            return true;
        }
        if self.domains.iter().any(|pattern| domain_matches(pattern, host)) {
            return true;
        }
        if let Some(ip) = ip {
            if self.cidrs.iter().any(|cidr| cidr.contains(ip)) {
                return true;
            }
        }
        false
    }
}

/// `*.example.com` matches any subdomain depth but not the apex; list
/// the apex separately when both are meant.
pub fn domain_matches(pattern: &str, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let host = host.trim_end_matches('.');
    if let Some(suffix) = pattern.strip_prefix("*.") {
        let dotted = format!(".{suffix}");
        return host.ends_with(&dotted);
    }
    host == pattern
}

/// Hand-rolled CIDR containment over std::net addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn parse(input: &str) -> Result<Self, String> {
        let (addr, prefix) = match input.split_once('/') {
            Some((addr, prefix)) => (addr.trim(), Some(prefix.trim())),
            None => (input.trim(), None),
        };
        let network: IpAddr = addr
            .parse()
            .map_err(|_| format!("bad network address in `{input}`"))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            // A bare address is a host route.
            None => max,
            Some(raw) => raw
                .parse::<u8>()
                .map_err(|_| format!("bad prefix length in `{input}`"))?,
        };
        if prefix > max {
            return Err(format!("prefix /{prefix} too long for `{input}`"));
        }
        Ok(Self { network, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 32 - u32::from(self.prefix);
                (u32::from(network) >> shift) == (u32::from(ip) >> shift)
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let shift = 128 - u32::from(self.prefix);
                (u128::from(network) >> shift) == (u128::from(ip) >> shift)
            }
            // Families never mix.
            _ => false,
        }
    }
}

pub fn evaluate(
    rules: &[NetworkMatcher],
    defaults: &Defaults,
    host: &str,
    ip: Option<IpAddr>,
    port: u16,
) -> Decision {
    for rule in rules {
        if rule.matches(host, ip, port) {
            return super::rule_decision(
                &rule.name,
                rule.verdict,
                "",
                None,
                defaults.approval_ceiling,
                format!("destination {host}:{port} matched rule `{}`", rule.name),
            );
        }
    }
    super::default_decision(defaults, Category::Network)
}
