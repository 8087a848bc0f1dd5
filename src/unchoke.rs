//! The unchoke scheduler.
//!
//! Which peers may download from us is recomputed on two cadences: the
//! regular pass ranks all eligible peers with the configured choker and
//! unchokes the top of the ranking, and the optimistic pass rotates a small
//! quota of unchoke slots through peers that have waited the longest,
//! regardless of their rank, to discover better trading partners.
//!
//! Both passes are pure functions over snapshots of per-peer state; the
//! session applies the returned decision by toggling flags and writing
//! (un)choke messages, and feeds the gauges from it.

use crate::conf::{ChokerConf, ChokingAlgorithm};

/// Identifies a peer connection to the scheduler. Matches the connection
/// ids the session hands out.
pub(crate) type ConnectionId = usize;

/// What the scheduler needs to know about one peer connection.
#[derive(Clone, Debug)]
pub(crate) struct PeerSnapshot {
    pub id: ConnectionId,
    /// The peer wants to download from us.
    pub is_peer_interested: bool,
    /// We are currently choking the peer.
    pub is_choked: bool,
    pub is_connecting: bool,
    pub is_disconnecting: bool,
    /// The torrent's metadata is known, so the peer could actually be
    /// served.
    pub has_metadata: bool,
    /// The peer is exempt from unchoke slot accounting.
    pub ignore_unchoke_slots: bool,
    pub optimistically_unchoked: bool,
    /// Session time of the last optimistic promotion, for rotation.
    pub last_optimistically_unchoked: u64,
    /// External priority; lower goes first in optimistic ties.
    pub priority: u32,
    /// Bytes per second we download from the peer, for the rate based
    /// choker.
    pub download_rate: u64,
    /// Session time the peer was last unchoked, for round robin rotation.
    pub time_of_last_unchoke: u64,
}

/// The changes a scheduler pass decided on. `unchoke`/`choke` only list
/// peers whose state must change; flags are adjusted before messages are
/// written.
#[derive(Debug, Default)]
pub(crate) struct ChokeDecision {
    pub unchoke: Vec<ConnectionId>,
    pub choke: Vec<ConnectionId>,
    pub set_optimistic: Vec<ConnectionId>,
    pub clear_optimistic: Vec<ConnectionId>,
    /// The slot count to publish in the `num_unchoke_slots` gauge.
    pub num_unchoke_slots: u64,
    /// A regular promotion displaced an optimistic peer: rotate the
    /// optimistic slate immediately instead of waiting out the interval.
    pub force_optimistic_recalc: bool,
}

/// The regular unchoke recomputation.
///
/// `num_optimistic` is the count of currently optimistically unchoked peers
/// (their slots are reserved out of the regular quota).
pub(crate) fn recalculate_unchoke_slots(
    peers: &[PeerSnapshot],
    conf: &ChokerConf,
    num_optimistic: usize,
) -> ChokeDecision {
    let mut decision = ChokeDecision::default();

    // if we unchoke everyone, skip the ranking entirely
    if conf.choking_algorithm == ChokingAlgorithm::FixedSlots
        && conf.unchoke_slots_limit < 0
    {
        decision.num_unchoke_slots = u64::MAX;
        for p in peers {
            if eligible(p) && p.is_choked {
                decision.unchoke.push(p.id);
            }
        }
        return decision;
    }

    let mut candidates: Vec<&PeerSnapshot> = Vec::new();
    for p in peers {
        if p.ignore_unchoke_slots || !p.has_metadata {
            continue;
        }
        if !p.is_peer_interested || p.is_disconnecting || p.is_connecting {
            // not unchokable; if it's unchoked now, take the slot back
            if !p.is_choked {
                if p.optimistically_unchoked {
                    decision.clear_optimistic.push(p.id);
                    decision.force_optimistic_recalc = true;
                }
                decision.choke.push(p.id);
            }
            continue;
        }
        candidates.push(p);
    }

    match conf.choking_algorithm {
        ChokingAlgorithm::FixedSlots => {
            // round robin: the longest-choked peers go first
            candidates.sort_by_key(|p| (p.time_of_last_unchoke, p.id));
        }
        ChokingAlgorithm::RateBased | ChokingAlgorithm::Bittyrant => {
            // prefer the peers we download the fastest from
            candidates
                .sort_by_key(|p| (std::cmp::Reverse(p.download_rate), p.id));
        }
    }

    let allowed_upload_slots = conf.unchoke_slots_limit.max(0) as usize;
    decision.num_unchoke_slots = allowed_upload_slots as u64;

    let num_opt = if num_optimistic == 0 {
        (allowed_upload_slots / 5).max(1)
    } else {
        num_optimistic
    };
    let mut unchoke_set_size = allowed_upload_slots.saturating_sub(num_opt);

    for p in &candidates {
        if unchoke_set_size > 0 {
            if p.is_choked {
                decision.unchoke.push(p.id);
            }
            unchoke_set_size -= 1;

            if p.optimistically_unchoked {
                // promoted into the proper unchoke set; free the
                // optimistic slot right away
                decision.clear_optimistic.push(p.id);
                decision.force_optimistic_recalc = true;
            }
        } else if !p.is_choked && !p.optimistically_unchoked {
            decision.choke.push(p.id);
        }
    }

    decision
}

/// The optimistic unchoke rotation.
///
/// `allowed_unchoke_slots` is the slot gauge published by the last regular
/// pass.
pub(crate) fn recalculate_optimistic_unchoke_slots(
    peers: &[PeerSnapshot],
    conf: &ChokerConf,
    allowed_unchoke_slots: u64,
) -> ChokeDecision {
    let mut decision = ChokeDecision::default();
    decision.num_unchoke_slots = allowed_unchoke_slots;

    if allowed_unchoke_slots == 0 {
        return decision;
    }
    if conf.choking_algorithm == ChokingAlgorithm::FixedSlots
        && conf.unchoke_slots_limit < 0
    {
        return decision;
    }

    let mut prev_optimistic: Vec<ConnectionId> = Vec::new();
    let mut candidates: Vec<&PeerSnapshot> = Vec::new();
    for p in peers {
        if p.optimistically_unchoked {
            prev_optimistic.push(p.id);
        }
        if !p.is_connecting
            && !p.is_disconnecting
            && p.is_peer_interested
            && (p.is_choked || p.optimistically_unchoked)
            && !p.ignore_unchoke_slots
            && p.has_metadata
        {
            candidates.push(p);
        }
    }

    let mut num_opt = if conf.num_optimistic_unchoke_slots == 0 {
        ((allowed_unchoke_slots / 5) as usize).max(1)
    } else {
        conf.num_optimistic_unchoke_slots
    };
    num_opt = num_opt.min(candidates.len());

    // the peers that have waited the longest for a turn come first
    candidates.sort_by_key(|p| {
        (p.last_optimistically_unchoked, p.priority, p.id)
    });

    for p in &candidates[..num_opt] {
        if p.optimistically_unchoked {
            // gets another round; don't choke it below
            prev_optimistic.retain(|id| *id != p.id);
        } else {
            decision.set_optimistic.push(p.id);
            decision.unchoke.push(p.id);
        }
    }

    // previously optimistic peers that lost their slot
    for id in prev_optimistic {
        decision.clear_optimistic.push(id);
        decision.choke.push(id);
    }

    decision
}

fn eligible(p: &PeerSnapshot) -> bool {
    p.is_peer_interested
        && !p.is_connecting
        && !p.is_disconnecting
        && p.has_metadata
        && !p.ignore_unchoke_slots
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: ConnectionId) -> PeerSnapshot {
        PeerSnapshot {
            id,
            is_peer_interested: true,
            is_choked: true,
            is_connecting: false,
            is_disconnecting: false,
            has_metadata: true,
            ignore_unchoke_slots: false,
            optimistically_unchoked: false,
            last_optimistically_unchoked: 0,
            priority: 0,
            download_rate: 0,
            time_of_last_unchoke: 0,
        }
    }

    fn conf() -> ChokerConf {
        ChokerConf {
            unchoke_slots_limit: 5,
            ..ChokerConf::default()
        }
    }

    #[test]
    fn test_regular_respects_slot_limit() {
        let peers: Vec<_> = (0..10).map(peer).collect();
        let decision = recalculate_unchoke_slots(&peers, &conf(), 1);
        // five slots, one reserved for the optimistic set
        assert_eq!(decision.unchoke.len(), 4);
        assert_eq!(decision.num_unchoke_slots, 5);
        assert!(decision.choke.is_empty());
    }

    #[test]
    fn test_regular_unlimited_unchokes_everyone() {
        let peers: Vec<_> = (0..10).map(peer).collect();
        let conf = ChokerConf {
            unchoke_slots_limit: -1,
            ..ChokerConf::default()
        };
        let decision = recalculate_unchoke_slots(&peers, &conf, 0);
        assert_eq!(decision.unchoke.len(), 10);
        assert_eq!(decision.num_unchoke_slots, u64::MAX);
    }

    #[test]
    fn test_regular_chokes_uninterested_unchoked() {
        let mut peers: Vec<_> = (0..3).map(peer).collect();
        peers[0].is_peer_interested = false;
        peers[0].is_choked = false;
        let decision = recalculate_unchoke_slots(&peers, &conf(), 1);
        assert_eq!(decision.choke, vec![0]);
        assert!(decision.unchoke.contains(&1));
        assert!(decision.unchoke.contains(&2));
    }

    #[test]
    fn test_rate_based_prefers_fast_peers() {
        let conf = ChokerConf {
            unchoke_slots_limit: 2,
            choking_algorithm: ChokingAlgorithm::RateBased,
            ..ChokerConf::default()
        };
        let mut peers: Vec<_> = (0..4).map(peer).collect();
        peers[0].download_rate = 10;
        peers[1].download_rate = 500;
        peers[2].download_rate = 300;
        peers[3].download_rate = 40;
        let decision = recalculate_unchoke_slots(&peers, &conf, 1);
        // one slot after the optimistic reservation: the fastest peer
        assert_eq!(decision.unchoke, vec![1]);
    }

    #[test]
    fn test_regular_promotion_clears_optimistic_flag() {
        let mut peers: Vec<_> = (0..2).map(peer).collect();
        peers[0].optimistically_unchoked = true;
        peers[0].is_choked = false;
        let decision = recalculate_unchoke_slots(&peers, &conf(), 1);
        // peer 0 earned a regular slot; its optimistic flag is freed and
        // the optimistic slate is rotated immediately
        assert_eq!(decision.clear_optimistic, vec![0]);
        assert!(decision.force_optimistic_recalc);
        // already unchoked, so no new unchoke message for it
        assert!(!decision.unchoke.contains(&0));
    }

    #[test]
    fn test_optimistic_picks_longest_waiting() {
        let mut peers: Vec<_> = (0..4).map(peer).collect();
        peers[0].last_optimistically_unchoked = 300;
        peers[1].last_optimistically_unchoked = 100;
        peers[2].last_optimistically_unchoked = 200;
        peers[3].last_optimistically_unchoked = 400;
        let decision =
            recalculate_optimistic_unchoke_slots(&peers, &conf(), 5);
        // quota is max(1, 5/5) = 1: the peer that waited the longest
        assert_eq!(decision.set_optimistic, vec![1]);
        assert_eq!(decision.unchoke, vec![1]);
    }

    #[test]
    fn test_optimistic_rotation_chokes_previous() {
        let conf = ChokerConf {
            unchoke_slots_limit: 5,
            num_optimistic_unchoke_slots: 1,
            ..ChokerConf::default()
        };
        let mut peers: Vec<_> = (0..3).map(peer).collect();
        peers[2].optimistically_unchoked = true;
        peers[2].is_choked = false;
        peers[2].last_optimistically_unchoked = 500;
        let decision = recalculate_optimistic_unchoke_slots(&peers, &conf, 5);
        // peer 0 takes over the optimistic slot, peer 2 is choked
        assert_eq!(decision.set_optimistic, vec![0]);
        assert_eq!(decision.clear_optimistic, vec![2]);
        assert_eq!(decision.choke, vec![2]);
    }

    #[test]
    fn test_optimistic_keeps_incumbent_when_still_best() {
        let conf = ChokerConf {
            unchoke_slots_limit: 5,
            num_optimistic_unchoke_slots: 1,
            ..ChokerConf::default()
        };
        let mut peers: Vec<_> = (0..2).map(peer).collect();
        peers[0].optimistically_unchoked = true;
        peers[0].is_choked = false;
        peers[1].last_optimistically_unchoked = 900;
        let decision = recalculate_optimistic_unchoke_slots(&peers, &conf, 5);
        // the incumbent has the oldest timestamp, so nothing changes
        assert!(decision.set_optimistic.is_empty());
        assert!(decision.clear_optimistic.is_empty());
        assert!(decision.choke.is_empty());
        assert!(decision.unchoke.is_empty());
    }
}
