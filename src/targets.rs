use anyhow::{bail, Result};
use ipnet::{IpNet, Ipv4Net};
use std::net::{IpAddr, Ipv4Addr};

/// Split a comma-separated target list, dropping empty items.
pub fn split_targets(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Number of hosts a target list expands to.
///
/// CIDRs count their usable IPv4 hosts (at least one); plain IPs and host
/// names count as one.
pub fn count_hosts(s: &str) -> Result<u64> {
    let targets = split_targets(s);
    if targets.is_empty() {
        bail!("no scan targets given");
    }
    let mut total = 0u64;
    for t in &targets {
        if t.contains('/') {
            let net: IpNet = t
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid CIDR {t:?}: {e}"))?;
            // tiny and IPv6 networks still name at least one scan target
            total += cidr_host_count(net).max(1);
        } else {
            total += 1;
        }
    }
    Ok(total)
}

/// Usable IPv4 host addresses in a CIDR, without building the list.
///
/// Network and broadcast addresses are excluded; /31, /32 and IPv6
/// networks count zero, matching [`expand_cidr_to_ips`].
pub fn cidr_host_count(cidr: IpNet) -> u64 {
    match cidr {
        IpNet::V4(n4) => {
            let size = 1u64 << (32 - u32::from(n4.prefix_len()));
            if size <= 2 {
                0
            } else {
                size - 2
            }
        }
        IpNet::V6(_) => 0,
    }
}

/// Expand a CIDR into individual IP addresses suitable for host scanning.
///
/// For IPv4, excludes the network and broadcast addresses.
/// IPv6 networks are not expanded and return an empty list.
pub fn expand_cidr_to_ips(cidr: IpNet) -> Vec<IpAddr> {
    match cidr {
        IpNet::V4(n4) => expand_ipv4net_hosts(n4)
            .into_iter()
            .map(IpAddr::V4)
            .collect(),
        IpNet::V6(_) => Vec::new(),
    }
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if end <= start + 1 {
        // /31 and /32 carry no host addresses
        return Vec::new();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}
