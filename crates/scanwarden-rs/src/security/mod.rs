use std::{net::IpAddr, str::FromStr};

use ipnet::IpNet;
use url::{Host, Url};

/// Whether `target` may be scanned under `allowlist`. Entries are hostnames (`example.com`),
/// wildcard domains (`*.example.com`, which also matches the apex) or CIDR blocks. An empty
/// allowlist permits everything.
pub fn in_scope(target: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }

    if allowlist
        .iter()
        .any(|item| item.eq_ignore_ascii_case(target))
    {
        return true;
    }

    let Some(host) = target_host(target) else {
        return false;
    };

    if let Ok(ip) = IpAddr::from_str(&host) {
        return allowlist.iter().any(|entry| {
            IpNet::from_str(entry)
                .map(|net| net.contains(&ip))
                .unwrap_or_else(|_| IpAddr::from_str(entry).map_or(false, |e| e == ip))
        });
    }

    allowlist.iter().any(|entry| host_matches(&host, entry))
}

/// Host part of a target given either as a URL or a bare host.
fn target_host(target: &str) -> Option<String> {
    let parsed = Url::parse(target)
        .ok()
        .filter(|u| u.has_host())
        .or_else(|| Url::parse(&format!("scan://{target}")).ok())?;

    match parsed.host()? {
        Host::Domain(d) => Some(d.trim_end_matches('.').to_ascii_lowercase()),
        Host::Ipv4(ip) => Some(ip.to_string()),
        Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

fn host_matches(host: &str, entry: &str) -> bool {
    let entry = entry.trim().trim_end_matches('.').to_ascii_lowercase();
    match entry.strip_prefix("*.") {
        Some(domain) => host == domain || host.ends_with(&format!(".{domain}")),
        None => host == entry,
    }
}
