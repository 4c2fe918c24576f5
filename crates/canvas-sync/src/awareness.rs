//! Presence broadcasting over the room channel.
//!
//! The local actor's [`AwarenessState`] is sent as [`CollabMessage::Awareness`]
//! at most once per throttle interval, and re-sent as a heartbeat so peers
//! can time out replicas that vanish without saying goodbye. Remote states
//! are last-write-wins per actor, ordered by the sender's counter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use canvas_common::transport::{CursorState, UserInfo, Viewport};
use canvas_common::{
    ActorId, AwarenessState, Clock, CollabMessage, Subscribers, Subscription, SyncConfig,
    TransportChannel,
};
use smol_str::SmolStr;
use web_time::Instant;

use crate::presence::{PeerMap, ThrottleDecision, is_idle, throttle_decision};

/// A partial change to the local state. Unset fields are kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessUpdate {
    /// `Some(None)` takes the cursor off the canvas.
    pub cursor: Option<Option<CursorState>>,
    pub selection: Option<Vec<SmolStr>>,
    pub viewport: Option<Viewport>,
    /// Refresh the activity stamp even if nothing else marks this as
    /// activity (an edit, for example).
    pub activity: bool,
}

impl AwarenessUpdate {
    pub fn cursor(cursor: CursorState) -> Self {
        Self {
            cursor: Some(Some(cursor)),
            ..Default::default()
        }
    }

    pub fn selection(ids: impl IntoIterator<Item = impl Into<SmolStr>>) -> Self {
        Self {
            selection: Some(ids.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn viewport(viewport: Viewport) -> Self {
        Self {
            viewport: Some(viewport),
            ..Default::default()
        }
    }

    pub fn activity() -> Self {
        Self {
            activity: true,
            ..Default::default()
        }
    }

    /// Pointer moves and selection changes count as activity; camera
    /// moves alone do not.
    fn is_activity(&self) -> bool {
        self.activity || matches!(self.cursor, Some(Some(_))) || self.selection.is_some()
    }
}

#[derive(Debug, Clone)]
struct PeerEntry {
    state: AwarenessState,
    clock: u64,
    seen_at: Instant,
}

/// Owns the local presence state and the view of every peer's.
pub struct AwarenessBroadcaster {
    actor: ActorId,
    local: Option<AwarenessState>,
    clock: u64,
    peers: BTreeMap<ActorId, PeerEntry>,
    dirty: bool,
    last_sent: Option<Instant>,
    throttle: Duration,
    heartbeat: Duration,
    timeout: Duration,
    idle_threshold_ms: u64,
    channel: Arc<dyn TransportChannel>,
    time: Arc<dyn Clock>,
    listeners: Subscribers<PeerMap>,
}

impl AwarenessBroadcaster {
    pub fn new(
        actor: ActorId,
        user: UserInfo,
        channel: Arc<dyn TransportChannel>,
        time: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        let timeout = config.awareness_timeout();
        Self {
            actor,
            local: Some(AwarenessState::new(user, time.unix_millis())),
            clock: 0,
            peers: BTreeMap::new(),
            dirty: true,
            last_sent: None,
            throttle: config.awareness_throttle(),
            heartbeat: timeout / 2,
            timeout,
            idle_threshold_ms: config.idle_threshold_ms,
            channel,
            time,
            listeners: Subscribers::new(),
        }
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub fn local_state(&self) -> Option<&AwarenessState> {
        self.local.as_ref()
    }

    /// Merge `update` into the local state and send it when the throttle
    /// allows. Returns how long to wait before calling [`tick`](Self::tick)
    /// if the send was deferred.
    pub fn publish_local_state(&mut self, update: AwarenessUpdate) -> Option<Duration> {
        let now_ms = self.time.unix_millis();
        let Some(local) = self.local.as_mut() else {
            tracing::debug!("awareness torn down, ignoring local update");
            return None;
        };
        let touched = update.is_activity();
        if let Some(cursor) = update.cursor {
            local.cursor = cursor;
        }
        if let Some(selection) = update.selection {
            local.selection = selection;
        }
        if let Some(viewport) = update.viewport {
            local.viewport = Some(viewport);
        }
        if touched {
            local.last_activity = now_ms;
            local.is_idle = false;
        }
        self.dirty = true;
        self.flush()
    }

    /// The pointer left the canvas.
    pub fn clear_local_cursor(&mut self) -> Option<Duration> {
        self.publish_local_state(AwarenessUpdate {
            cursor: Some(None),
            ..Default::default()
        })
    }

    /// Periodic housekeeping: flag the local actor idle, send heartbeats and
    /// deferred changes, and drop peers that went quiet.
    pub fn tick(&mut self) -> Option<Duration> {
        let now = self.time.now();
        let now_ms = self.time.unix_millis();

        if let Some(local) = self.local.as_mut() {
            if !local.is_idle && is_idle(local.last_activity, now_ms, self.idle_threshold_ms) {
                tracing::debug!(actor = %self.actor, "local actor went idle");
                local.is_idle = true;
                self.dirty = true;
            }
        }
        if self
            .last_sent
            .is_some_and(|last| now.saturating_duration_since(last) >= self.heartbeat)
        {
            self.dirty = true;
        }

        let before = self.peers.len();
        let timeout = self.timeout;
        self.peers
            .retain(|_, peer| now.saturating_duration_since(peer.seen_at) < timeout);
        if self.peers.len() != before {
            tracing::debug!(dropped = before - self.peers.len(), "timed out silent peers");
            self.notify();
        }

        self.flush()
    }

    /// Send the local state now if it changed and the throttle allows.
    fn flush(&mut self) -> Option<Duration> {
        if !self.dirty || self.local.is_none() {
            return None;
        }
        match throttle_decision(self.last_sent, self.time.now(), self.throttle) {
            ThrottleDecision::SendNow => {
                self.send_local();
                None
            }
            ThrottleDecision::Defer(wait) => Some(wait),
        }
    }

    fn send_local(&mut self) {
        self.clock += 1;
        let message = CollabMessage::Awareness {
            actor: self.actor,
            clock: self.clock,
            state: self.local.clone(),
        };
        if self.send(&message) {
            self.dirty = false;
            self.last_sent = Some(self.time.now());
        }
    }

    /// Best effort; presence is never worth an error.
    fn send(&self, message: &CollabMessage) -> bool {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(?e, "failed to encode awareness");
                return false;
            }
        };
        match self.channel.send(bytes) {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!(?e, "awareness send dropped");
                false
            }
        }
    }

    /// Send the current local state regardless of the throttle, e.g. to
    /// introduce ourselves to a peer that just synced.
    pub fn resend(&mut self) {
        if self.local.is_some() {
            self.send_local();
        }
    }

    /// Apply a peer's awareness message.
    pub fn receive(&mut self, actor: ActorId, clock: u64, state: Option<AwarenessState>) {
        if actor == self.actor {
            return;
        }
        let now = self.time.now();
        let changed = match state {
            None => match self.peers.get(&actor) {
                Some(entry) if clock >= entry.clock => {
                    self.peers.remove(&actor);
                    tracing::debug!(%actor, "peer left");
                    true
                }
                _ => false,
            },
            Some(state) => match self.peers.get_mut(&actor) {
                Some(entry) if clock < entry.clock => false,
                Some(entry) => {
                    entry.clock = clock;
                    entry.seen_at = now;
                    if entry.state == state {
                        false
                    } else {
                        entry.state = state;
                        true
                    }
                }
                None => {
                    tracing::debug!(%actor, user = %state.user.name, "peer appeared");
                    self.peers.insert(
                        actor,
                        PeerEntry {
                            state,
                            clock,
                            seen_at: now,
                        },
                    );
                    true
                }
            },
        };
        if changed {
            self.notify();
        }
    }

    /// Called with the full peer map, local actor excluded, whenever any
    /// peer's state changes.
    pub fn on_remote_states_changed(
        &self,
        handler: impl Fn(&PeerMap) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.subscribe(handler)
    }

    pub fn peers(&self) -> PeerMap {
        self.peers
            .iter()
            .map(|(actor, entry)| (*actor, entry.state.clone()))
            .collect()
    }

    fn notify(&self) {
        self.listeners.emit(&self.peers());
    }

    /// Forget every peer, e.g. after the channel dropped.
    pub fn clear_peers(&mut self) {
        if !self.peers.is_empty() {
            self.peers.clear();
            self.notify();
        }
    }

    /// Say goodbye under the current actor and continue as `actor`.
    pub fn retire_actor(&mut self, actor: ActorId) {
        if actor == self.actor {
            return;
        }
        self.clock += 1;
        self.send(&CollabMessage::Awareness {
            actor: self.actor,
            clock: self.clock,
            state: None,
        });
        tracing::debug!(old = %self.actor, new = %actor, "awareness actor rotated");
        self.actor = actor;
        self.clock = 0;
        self.dirty = true;
        self.last_sent = None;
    }

    /// Publish a cleared state as our final message and drop all peers.
    pub fn teardown(&mut self) {
        if self.local.take().is_none() {
            return;
        }
        self.clock += 1;
        let sent = self.send(&CollabMessage::Awareness {
            actor: self.actor,
            clock: self.clock,
            state: None,
        });
        tracing::debug!(actor = %self.actor, sent, "awareness torn down");
        self.dirty = false;
        self.clear_peers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_common::transport::{CursorKind, MemoryHub, TransportConnector, TransportEvents};
    use canvas_common::{ManualClock, RoomId, TransportEvent};
    use std::sync::Mutex;

    struct Harness {
        clock: ManualClock,
        broadcaster: AwarenessBroadcaster,
        peer_events: TransportEvents,
        _peer: canvas_common::transport::MemoryChannel,
    }

    fn harness() -> Harness {
        let hub = MemoryHub::new();
        let room = RoomId::new("board");
        let (local, _events) = hub.connect(&room, "t");
        let (peer, mut peer_events) = hub.connect(&room, "t");
        while peer_events.try_recv().is_ok() {}
        let clock = ManualClock::new();
        let broadcaster = AwarenessBroadcaster::new(
            ActorId(1),
            UserInfo::new("1", "Ada"),
            Arc::new(local),
            Arc::new(clock.clone()),
            &SyncConfig::default(),
        );
        Harness {
            clock,
            broadcaster,
            peer_events,
            _peer: peer,
        }
    }

    fn sent(events: &mut TransportEvents) -> Vec<(ActorId, u64, Option<AwarenessState>)> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransportEvent::Received(bytes) = event {
                if let Ok(CollabMessage::Awareness { actor, clock, state }) =
                    CollabMessage::from_bytes(&bytes)
                {
                    out.push((actor, clock, state));
                }
            }
        }
        out
    }

    fn cursor(x: f64) -> CursorState {
        CursorState {
            x,
            y: 0.0,
            kind: CursorKind::Default,
            rotation: 0.0,
        }
    }

    fn remote_state(name: &str) -> AwarenessState {
        AwarenessState::new(UserInfo::new(name, name), 1_700_000_000_000)
    }

    #[test]
    fn test_pointer_moves_are_throttled() {
        let mut h = harness();
        assert_eq!(h.broadcaster.publish_local_state(AwarenessUpdate::cursor(cursor(1.0))), None);
        h.clock.advance_millis(10);
        let wait = h.broadcaster.publish_local_state(AwarenessUpdate::cursor(cursor(2.0)));
        h.clock.advance_millis(10);
        h.broadcaster.publish_local_state(AwarenessUpdate::cursor(cursor(3.0)));

        assert_eq!(wait, Some(Duration::from_millis(40)));
        assert_eq!(sent(&mut h.peer_events).len(), 1);

        h.clock.advance_millis(30);
        assert_eq!(h.broadcaster.tick(), None);
        let msgs = sent(&mut h.peer_events);
        assert_eq!(msgs.len(), 1);
        // only the latest position goes out
        assert_eq!(msgs[0].2.as_ref().and_then(|s| s.cursor).map(|c| c.x), Some(3.0));
        assert_eq!(msgs[0].1, 2);
    }

    #[test]
    fn test_clear_cursor_keeps_selection() {
        let mut h = harness();
        h.broadcaster.publish_local_state(AwarenessUpdate {
            cursor: Some(Some(cursor(5.0))),
            selection: Some(vec!["shape:a".into()]),
            ..Default::default()
        });
        h.clock.advance_millis(100);
        h.broadcaster.clear_local_cursor();

        let msgs = sent(&mut h.peer_events);
        let last = msgs.last().and_then(|m| m.2.clone()).unwrap();
        assert!(last.cursor.is_none());
        assert_eq!(last.selection, vec![SmolStr::new("shape:a")]);
    }

    #[test]
    fn test_viewport_alone_is_not_activity() {
        let mut h = harness();
        let stamp = h.broadcaster.local_state().unwrap().last_activity;
        h.clock.advance_millis(5_000);
        h.broadcaster.publish_local_state(AwarenessUpdate::viewport(Viewport {
            x: 0.0,
            y: 0.0,
            zoom: 2.0,
        }));
        assert_eq!(h.broadcaster.local_state().unwrap().last_activity, stamp);

        h.broadcaster.publish_local_state(AwarenessUpdate::selection(["x"]));
        assert_eq!(
            h.broadcaster.local_state().unwrap().last_activity,
            stamp + 5_000
        );
    }

    #[test]
    fn test_remote_states_exclude_self_and_order_by_clock() {
        let mut h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = h
            .broadcaster
            .on_remote_states_changed(move |peers| sink.lock().unwrap().push(peers.len()));

        h.broadcaster.receive(ActorId(1), 9, Some(remote_state("me")));
        h.broadcaster.receive(ActorId(2), 3, Some(remote_state("bob")));
        h.broadcaster.receive(ActorId(2), 2, Some(remote_state("stale")));
        assert_eq!(h.broadcaster.peers()[&ActorId(2)].user.name, "bob");

        h.broadcaster.receive(ActorId(3), 1, Some(remote_state("cy")));
        h.broadcaster.receive(ActorId(2), 4, None);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 1]);
        assert!(!h.broadcaster.peers().contains_key(&ActorId(1)));
    }

    #[test]
    fn test_silent_peers_time_out_and_heartbeat_resends() {
        let mut h = harness();
        h.broadcaster.tick();
        sent(&mut h.peer_events);
        h.broadcaster.receive(ActorId(2), 1, Some(remote_state("bob")));

        h.clock.advance_millis(15_000);
        h.broadcaster.tick();
        assert_eq!(sent(&mut h.peer_events).len(), 1);
        assert_eq!(h.broadcaster.peers().len(), 1);

        h.clock.advance_millis(15_000);
        h.broadcaster.tick();
        assert!(h.broadcaster.peers().is_empty());
    }

    #[test]
    fn test_local_goes_idle_after_threshold() {
        let mut h = harness();
        h.broadcaster.tick();
        h.clock.advance_millis(120_000);
        h.broadcaster.tick();
        assert!(!h.broadcaster.local_state().unwrap().is_idle);
        h.clock.advance_millis(1);
        h.broadcaster.tick();
        assert!(h.broadcaster.local_state().unwrap().is_idle);

        h.broadcaster.publish_local_state(AwarenessUpdate::cursor(cursor(0.0)));
        assert!(!h.broadcaster.local_state().unwrap().is_idle);
    }

    #[test]
    fn test_teardown_sends_null_state() {
        let mut h = harness();
        h.broadcaster.tick();
        h.broadcaster.receive(ActorId(2), 1, Some(remote_state("bob")));
        sent(&mut h.peer_events);

        h.broadcaster.teardown();

        let msgs = sent(&mut h.peer_events);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, ActorId(1));
        assert!(msgs[0].2.is_none());
        assert!(h.broadcaster.peers().is_empty());
        assert_eq!(h.broadcaster.publish_local_state(AwarenessUpdate::activity()), None);
        assert!(sent(&mut h.peer_events).is_empty());
    }

    #[test]
    fn test_retire_actor_says_goodbye_first() {
        let mut h = harness();
        h.broadcaster.tick();
        sent(&mut h.peer_events);

        h.broadcaster.retire_actor(ActorId(8));
        h.broadcaster.tick();

        let msgs = sent(&mut h.peer_events);
        assert_eq!(msgs.len(), 2);
        assert_eq!((msgs[0].0, msgs[0].2.is_none()), (ActorId(1), true));
        assert_eq!((msgs[1].0, msgs[1].1), (ActorId(8), 1));
        assert!(msgs[1].2.is_some());
    }
}
