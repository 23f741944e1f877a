use anyhow::{bail, Context, Result};
use std::collections::HashSet;

/// Parse a port spec into a deduplicated list of TCP/UDP ports (1..=65535).
///
/// Items are separated by commas or newlines:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` on a line is ignored
/// - whitespace and empty items are ignored
///
/// Order of first appearance is preserved.
pub fn parse_port_spec(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for raw_line in s.lines() {
        let line = raw_line.split('#').next().unwrap_or("");
        for item in line.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            if let Some((a, b)) = item.split_once('-') {
                let start = parse_port(a.trim())
                    .with_context(|| format!("invalid start in range {item:?}"))?;
                let end = parse_port(b.trim())
                    .with_context(|| format!("invalid end in range {item:?}"))?;
                if start > end {
                    bail!("invalid range {start}-{end} (start > end)");
                }
                for p in start..=end {
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
                continue;
            }

            let p = parse_port(item).with_context(|| format!("invalid port value {item:?}"))?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    if out.is_empty() {
        bail!("port spec {s:?} names no ports");
    }
    Ok(out)
}

/// Number of distinct ports named by a spec.
pub fn count_ports(s: &str) -> Result<u64> {
    Ok(parse_port_spec(s)?.len() as u64)
}

fn parse_port(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
