//! Remote port candidates
//!
//! Remote ports may already be taken by other tunnels, so negotiation walks
//! a list of independently chosen candidates instead of coordinating with
//! the server.

use std::collections::HashSet;

use pt_core::config::PortCandidateConfig;
use rand::Rng;

/// Build the ordered candidate list for a tunnel
///
/// Configured hints come first, in order and without duplicates. Random
/// ports from the configured range fill the list up to `policy.count`.
pub fn candidate_ports(hints: &[u16], policy: &PortCandidateConfig) -> Vec<u16> {
    candidate_ports_with(hints, policy, &mut rand::thread_rng())
}

/// [`candidate_ports`] with a caller-supplied RNG
pub fn candidate_ports_with<R: Rng>(
    hints: &[u16],
    policy: &PortCandidateConfig,
    rng: &mut R,
) -> Vec<u16> {
    let mut seen = HashSet::new();
    let mut candidates: Vec<u16> = hints
        .iter()
        .copied()
        .filter(|port| *port != 0 && seen.insert(*port))
        .collect();

    if candidates.len() >= policy.count || policy.range_start > policy.range_end {
        return candidates;
    }

    let range = policy.range_start..=policy.range_end;
    let range_size = usize::from(policy.range_end - policy.range_start) + 1;
    let hints_in_range = candidates.iter().filter(|p| range.contains(p)).count();
    let available = range_size - hints_in_range;
    let wanted = (policy.count - candidates.len()).min(available);

    let target = candidates.len() + wanted;
    while candidates.len() < target {
        let port = rng.gen_range(range.clone());
        if seen.insert(port) {
            candidates.push(port);
        }
    }

    candidates
}
