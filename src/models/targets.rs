//! Target expansion and partitioning.
//!
//! CIDR blocks expand to their usable host addresses; single addresses and
//! hostnames pass through unchanged. Duplicates are dropped so shards stay disjoint.

use crate::error::{ScanError, ScanResult};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::collections::HashSet;
use std::net::IpAddr;

/// Upper bound on the expanded target set of one task
pub const MAX_EXPANDED_TARGETS: usize = 1 << 20;

/// Expand submitted targets into individual hosts in submission order
pub fn expand_targets(targets: &[String]) -> ScanResult<Vec<String>> {
    let mut expanded = Vec::new();
    let mut seen = HashSet::new();

    for raw in targets {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }

        if entry.parse::<IpAddr>().is_ok() || !entry.contains('/') {
            push_unique(&mut expanded, &mut seen, entry.to_string())?;
            continue;
        }

        let network: IpNetwork = entry
            .parse()
            .map_err(|e| ScanError::validation(format!("invalid CIDR target '{entry}': {e}")))?;

        match network {
            IpNetwork::V4(net) => expand_v4(net, &mut expanded, &mut seen)?,
            IpNetwork::V6(net) => expand_v6(net, &mut expanded, &mut seen)?,
        }
    }

    if expanded.is_empty() {
        return Err(ScanError::validation("target set is empty"));
    }
    Ok(expanded)
}

fn expand_v4(
    net: Ipv4Network,
    out: &mut Vec<String>,
    seen: &mut HashSet<String>,
) -> ScanResult<()> {
    let size = net.size() as usize;
    ensure_capacity(out.len(), size)?;

    // Network and broadcast addresses are not hosts below /31
    let skip_edges = net.prefix() < 31;
    for addr in net.iter() {
        if skip_edges && (addr == net.network() || addr == net.broadcast()) {
            continue;
        }
        push_unique(out, seen, addr.to_string())?;
    }
    Ok(())
}

fn expand_v6(
    net: Ipv6Network,
    out: &mut Vec<String>,
    seen: &mut HashSet<String>,
) -> ScanResult<()> {
    let size = usize::try_from(net.size()).unwrap_or(usize::MAX);
    ensure_capacity(out.len(), size)?;
    for addr in net.iter() {
        push_unique(out, seen, addr.to_string())?;
    }
    Ok(())
}

fn ensure_capacity(current: usize, additional: usize) -> ScanResult<()> {
    if current.saturating_add(additional) > MAX_EXPANDED_TARGETS {
        return Err(ScanError::validation(format!(
            "target set expands beyond {MAX_EXPANDED_TARGETS} hosts"
        )));
    }
    Ok(())
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, target: String) -> ScanResult<()> {
    if seen.insert(target.clone()) {
        ensure_capacity(out.len(), 1)?;
        out.push(target);
    }
    Ok(())
}

/// Split targets into consecutive partitions of at most `size` entries
pub fn partition_targets(targets: Vec<String>, size: usize) -> Vec<Vec<String>> {
    let size = size.max(1);
    let mut partitions = Vec::with_capacity(targets.len().div_ceil(size));
    let mut iter = targets.into_iter().peekable();
    while iter.peek().is_some() {
        partitions.push(iter.by_ref().take(size).collect());
    }
    partitions
}
