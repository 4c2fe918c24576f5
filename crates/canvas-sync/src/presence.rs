//! Pure presence helpers: broadcast throttling, idle and fade tiers, join
//! and leave synthesis, and follow mode.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use canvas_common::transport::Viewport;
use canvas_common::{ActorId, AwarenessState};
use web_time::Instant;

/// Peer id to current state, local actor excluded.
pub type PeerMap = BTreeMap<ActorId, AwarenessState>;

/// What to do with a pending awareness change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    SendNow,
    /// Hold it; the window reopens after this long.
    Defer(Duration),
}

/// Coalesce broadcasts so that at most one goes out per `interval`.
pub fn throttle_decision(
    last_sent: Option<Instant>,
    now: Instant,
    interval: Duration,
) -> ThrottleDecision {
    match last_sent {
        None => ThrottleDecision::SendNow,
        Some(last) => {
            let elapsed = now.saturating_duration_since(last);
            if elapsed >= interval {
                ThrottleDecision::SendNow
            } else {
                ThrottleDecision::Defer(interval - elapsed)
            }
        }
    }
}

/// Whether more than `threshold_ms` have passed since `last_activity`.
///
/// Exactly `threshold_ms` is still active.
pub fn is_idle(last_activity: u64, now_ms: u64, threshold_ms: u64) -> bool {
    now_ms.saturating_sub(last_activity) > threshold_ms
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActivityTier {
    Active,
    /// Cursor drawn faded.
    Faded,
    Idle,
}

/// Visual tier of a peer, recomputed by observers from its activity stamp.
pub fn activity_tier(state: &AwarenessState, now_ms: u64, fade_ms: u64, idle_ms: u64) -> ActivityTier {
    if state.is_idle || is_idle(state.last_activity, now_ms, idle_ms) {
        ActivityTier::Idle
    } else if is_idle(state.last_activity, now_ms, fade_ms) {
        ActivityTier::Faded
    } else {
        ActivityTier::Active
    }
}

/// Peers that appeared or vanished between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceDiff {
    pub joined: BTreeSet<ActorId>,
    pub left: BTreeSet<ActorId>,
}

impl PresenceDiff {
    pub fn between<V>(prev: &BTreeMap<ActorId, V>, next: &BTreeMap<ActorId, V>) -> Self {
        Self {
            joined: next.keys().filter(|id| !prev.contains_key(*id)).copied().collect(),
            left: prev.keys().filter(|id| !next.contains_key(*id)).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Keeps the previous peer set and turns each update into a diff.
#[derive(Debug, Default)]
pub struct PresenceWatcher {
    known: BTreeSet<ActorId>,
}

impl PresenceWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, peers: &PeerMap) -> PresenceDiff {
        let next: BTreeSet<ActorId> = peers.keys().copied().collect();
        let diff = PresenceDiff {
            joined: next.difference(&self.known).copied().collect(),
            left: self.known.difference(&next).copied().collect(),
        };
        self.known = next;
        diff
    }

    pub fn known(&self) -> &BTreeSet<ActorId> {
        &self.known
    }
}

/// Follow another collaborator's camera.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FollowState {
    target: Option<ActorId>,
}

impl FollowState {
    pub fn follow(&mut self, actor: ActorId) {
        tracing::debug!(%actor, "following peer");
        self.target = Some(actor);
    }

    pub fn stop(&mut self) {
        self.target = None;
    }

    pub fn target(&self) -> Option<ActorId> {
        self.target
    }

    /// Viewport to mirror, if the followed peer has published one.
    pub fn viewport(&self, peers: &PeerMap) -> Option<Viewport> {
        self.target
            .and_then(|actor| peers.get(&actor))
            .and_then(|state| state.viewport)
    }

    /// The local user panned or zoomed by hand.
    pub fn on_manual_camera_move(&mut self) {
        if self.target.take().is_some() {
            tracing::debug!("stopped following after manual camera move");
        }
    }

    /// Stop following when the target leaves. Returns whether it did.
    pub fn on_peers_changed(&mut self, peers: &PeerMap) -> bool {
        match self.target {
            Some(actor) if !peers.contains_key(&actor) => {
                tracing::debug!(%actor, "followed peer left");
                self.target = None;
                true
            }
            _ => false,
        }
    }
}
