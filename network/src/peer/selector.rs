use crate::peer::{PeerNode, PeerRegistry};
use gyre_async::time;
use gyre_primitives::location::Location;
use gyre_primitives::network::PeerId;
use std::collections::HashSet;
use std::sync::Arc;

/// How many runner-up locations `best_not_taken` reports at most.
const MAX_BEST_NOT_TAKEN: usize = 8;

/// Greedy next-hop selection: the routable peer closest to `target` on the
/// circle, excluding the request source, every peer already visited, and any
/// explicitly ignored peer.
///
/// Exact distance ties go to the numerically smaller peer id, so selection is
/// deterministic across calls and nodes.
///
/// `max_distance`, when finite, drops candidates further than that from the
/// target (probe-style routing). `best_not_taken`, when provided, receives
/// the best candidate locations that were considered but not chosen, closest
/// first, without duplicates.
pub fn closer_peer(
    registry: &PeerRegistry,
    clock: &time::Clock,
    source: Option<PeerId>,
    visited: &HashSet<PeerId>,
    ignored: &HashSet<PeerId>,
    target: Location,
    max_distance: Option<f64>,
    best_not_taken: Option<&mut Vec<Location>>,
) -> Option<Arc<PeerNode>> {
    let now = clock.now();
    let mut candidates: Vec<(f64, PeerId, Arc<PeerNode>, Location)> = Vec::new();
    for peer in registry.all() {
        if Some(peer.id) == source || visited.contains(&peer.id) || ignored.contains(&peer.id) {
            continue;
        }
        if !peer.is_routable(now) {
            continue;
        }
        let Some(location) = peer.location() else { continue };
        let distance = target.distance(location);
        if max_distance.is_some_and(|max| distance > max) {
            continue;
        }
        candidates.push((distance, peer.id, peer, location));
    }
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(|a, b| {
        a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1))
    });
    let chosen = candidates.remove(0);
    if let Some(out) = best_not_taken {
        out.clear();
        for (_, _, _, location) in &candidates {
            if out.len() >= MAX_BEST_NOT_TAKEN {
                break;
            }
            if !out.iter().any(|l| l == location) {
                out.push(*location);
            }
        }
    }
    Some(chosen.2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testonly;
    use gyre_async::time::FakeClock;

    fn loc(x: f64) -> Location {
        Location::normalize(x)
    }

    #[tokio::test]
    async fn picks_closest_routable_peer() {
        let clock = FakeClock::default();
        let harness = testonly::PeerHarness::new(&clock);
        let registry = PeerRegistry::new();
        registry.insert(harness.connected_peer(PeerId(1), loc(0.1)));
        registry.insert(harness.connected_peer(PeerId(2), loc(0.4)));
        registry.insert(harness.connected_peer(PeerId(3), loc(0.95)));
        let chosen = closer_peer(
            &registry,
            &clock.clock(),
            None,
            &HashSet::new(),
            &HashSet::new(),
            loc(0.05),
            None,
            None,
        )
        .unwrap();
        assert_eq!(chosen.id, PeerId(1));
    }

    #[tokio::test]
    async fn excludes_source_and_visited() {
        let clock = FakeClock::default();
        let harness = testonly::PeerHarness::new(&clock);
        let registry = PeerRegistry::new();
        registry.insert(harness.connected_peer(PeerId(1), loc(0.1)));
        registry.insert(harness.connected_peer(PeerId(2), loc(0.2)));
        registry.insert(harness.connected_peer(PeerId(3), loc(0.3)));
        let mut visited = HashSet::new();
        visited.insert(PeerId(2));
        let chosen = closer_peer(
            &registry,
            &clock.clock(),
            Some(PeerId(1)),
            &visited,
            &HashSet::new(),
            loc(0.1),
            None,
            None,
        )
        .unwrap();
        assert_eq!(chosen.id, PeerId(3));
    }

    #[tokio::test]
    async fn exact_tie_goes_to_smaller_peer_id() {
        let clock = FakeClock::default();
        let harness = testonly::PeerHarness::new(&clock);
        let registry = PeerRegistry::new();
        // Exactly equidistant on both sides of the target (0.25 and 0.75 are
        // exactly representable, so the tie is genuine).
        registry.insert(harness.connected_peer(PeerId(9), loc(0.25)));
        registry.insert(harness.connected_peer(PeerId(4), loc(0.75)));
        let chosen = closer_peer(
            &registry,
            &clock.clock(),
            None,
            &HashSet::new(),
            &HashSet::new(),
            loc(0.0),
            None,
            None,
        )
        .unwrap();
        assert_eq!(chosen.id, PeerId(4));
    }

    #[tokio::test]
    async fn max_distance_filters_candidates() {
        let clock = FakeClock::default();
        let harness = testonly::PeerHarness::new(&clock);
        let registry = PeerRegistry::new();
        registry.insert(harness.connected_peer(PeerId(1), loc(0.5)));
        let none = closer_peer(
            &registry,
            &clock.clock(),
            None,
            &HashSet::new(),
            &HashSet::new(),
            loc(0.0),
            Some(0.1),
            None,
        );
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn best_not_taken_reports_runners_up() {
        let clock = FakeClock::default();
        let harness = testonly::PeerHarness::new(&clock);
        let registry = PeerRegistry::new();
        registry.insert(harness.connected_peer(PeerId(1), loc(0.10)));
        registry.insert(harness.connected_peer(PeerId(2), loc(0.20)));
        registry.insert(harness.connected_peer(PeerId(3), loc(0.40)));
        let mut runners_up = Vec::new();
        let chosen = closer_peer(
            &registry,
            &clock.clock(),
            None,
            &HashSet::new(),
            &HashSet::new(),
            loc(0.08),
            None,
            Some(&mut runners_up),
        )
        .unwrap();
        assert_eq!(chosen.id, PeerId(1));
        assert_eq!(runners_up, vec![loc(0.20), loc(0.40)]);
    }

    #[tokio::test]
    async fn backed_off_peer_is_skipped() {
        let clock = FakeClock::default();
        let harness = testonly::PeerHarness::new(&clock);
        let registry = PeerRegistry::new();
        let near = harness.connected_peer(PeerId(1), loc(0.1));
        registry.insert(near.clone());
        registry.insert(harness.connected_peer(PeerId(2), loc(0.6)));
        near.enter_backoff(&clock.clock(), "test");
        let chosen = closer_peer(
            &registry,
            &clock.clock(),
            None,
            &HashSet::new(),
            &HashSet::new(),
            loc(0.1),
            None,
            None,
        )
        .unwrap();
        assert_eq!(chosen.id, PeerId(2));
    }
}
