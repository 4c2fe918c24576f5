//! One replica's connection to a room.
//!
//! A [`Session`] owns the document, the bridge to the host's record store,
//! the undo manager, the awareness broadcaster and the channel. Transport
//! events are fed in either synchronously with [`Session::pump`] or from an
//! async task with [`Session::run`].
//!
//! Every connect after the first one rotates the actor identity: a fresh
//! actor is used for the document, undo scope and presence, and undo history
//! does not survive the gap.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use canvas_common::transport::{TransportConnector, TransportEvents, UserInfo};
use canvas_common::{
    ActorId, Clock, CollabMessage, ConnectionStatus, RoomId, Subscription, SyncConfig,
    TransportChannel, TransportError, TransportEvent,
};
use canvas_crdt::{ActorUndoManager, DocumentStore, ReplicatedDoc, SyncBridge};

use crate::awareness::{AwarenessBroadcaster, AwarenessUpdate};
use crate::connection::{ConnectionIndicator, IndicatorState};
use crate::error::SyncError;
use crate::lifecycle::{LifecycleController, LifecycleSignal};
use crate::presence::PeerMap;

/// Encoded document updates committed while the channel was down.
type Outbox = Arc<Mutex<Vec<Vec<u8>>>>;

fn lock_outbox(outbox: &Mutex<Vec<Vec<u8>>>) -> MutexGuard<'_, Vec<Vec<u8>>> {
    outbox.lock().unwrap_or_else(|e| e.into_inner())
}

fn encode(message: &CollabMessage) -> Result<Vec<u8>, TransportError> {
    Ok(message.to_bytes()?)
}

/// Ship a local commit, or park it until the channel is back.
fn forward_update(channel: &dyn TransportChannel, outbox: &Mutex<Vec<Vec<u8>>>, data: Vec<u8>) {
    let mut queued = lock_outbox(outbox);
    // keep commit order: nothing overtakes updates already waiting
    if queued.is_empty() && channel.is_connected() {
        let sent = encode(&CollabMessage::DocUpdate { data: data.clone() })
            .and_then(|bytes| channel.send(bytes));
        match sent {
            Ok(()) => return,
            Err(e) => tracing::debug!(?e, "update send failed, queueing"),
        }
    }
    queued.push(data);
    tracing::trace!(queued = queued.len(), "update held for reconnect");
}

pub struct Session<C: TransportChannel + 'static, S: DocumentStore + 'static> {
    channel: Arc<C>,
    events: TransportEvents,
    doc: ReplicatedDoc,
    bridge: Arc<SyncBridge<S>>,
    undo: ActorUndoManager,
    awareness: AwarenessBroadcaster,
    indicator: ConnectionIndicator,
    lifecycle: LifecycleController,
    outbox: Outbox,
    updates: Option<Subscription>,
    connected_before: bool,
    closed: bool,
    config: SyncConfig,
}

impl<C: TransportChannel + 'static, S: DocumentStore + 'static> Session<C, S> {
    /// Open `room` and attach `store` to a fresh document.
    ///
    /// The store should be empty or hold the records of a cached snapshot;
    /// the first sync brings it up to date either way.
    pub fn connect<K>(
        connector: &K,
        room: &RoomId,
        token: &str,
        store: S,
        user: UserInfo,
        config: SyncConfig,
        time: Arc<dyn Clock>,
    ) -> Result<Self, SyncError>
    where
        K: TransportConnector<Channel = C>,
    {
        Self::connect_with_doc(
            connector,
            room,
            token,
            store,
            ReplicatedDoc::with_actor(ActorId::random())?,
            user,
            config,
            time,
        )
    }

    /// Like [`connect`](Self::connect), starting from an existing document
    /// such as one restored from a snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn connect_with_doc<K>(
        connector: &K,
        room: &RoomId,
        token: &str,
        store: S,
        doc: ReplicatedDoc,
        user: UserInfo,
        config: SyncConfig,
        time: Arc<dyn Clock>,
    ) -> Result<Self, SyncError>
    where
        K: TransportConnector<Channel = C>,
    {
        let (channel, events) = connector.connect(room, token);
        let channel = Arc::new(channel);
        let actor = doc.actor();
        tracing::info!(%room, %actor, "session connecting");

        let bridge = Arc::new(SyncBridge::attach(doc.clone(), store));
        let undo = ActorUndoManager::new(
            doc.clone(),
            time.clone(),
            config.undo_capture(),
            config.undo_max_steps,
        );

        let outbox: Outbox = Arc::default();
        let updates = {
            let channel = channel.clone();
            let outbox = outbox.clone();
            doc.subscribe_local_updates(move |data| {
                forward_update(&*channel, &outbox, data)
            })
        };

        let dyn_channel: Arc<dyn TransportChannel> = channel.clone();
        let awareness =
            AwarenessBroadcaster::new(actor, user, dyn_channel.clone(), time.clone(), &config);

        Ok(Self {
            events,
            doc,
            bridge,
            undo,
            awareness,
            indicator: ConnectionIndicator::new(config.reconnected_banner(), time),
            lifecycle: LifecycleController::new(dyn_channel),
            outbox,
            updates: Some(updates),
            connected_before: false,
            closed: false,
            channel,
            config,
        })
    }

    pub fn actor(&self) -> ActorId {
        self.doc.actor()
    }

    pub fn room(&self) -> &RoomId {
        self.channel.room()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.channel.status()
    }

    pub fn doc(&self) -> &ReplicatedDoc {
        &self.doc
    }

    /// Shared handle for a [`ReconcilerDriver`](crate::ReconcilerDriver).
    pub fn bridge(&self) -> &Arc<SyncBridge<S>> {
        &self.bridge
    }

    pub fn store(&self) -> &S {
        self.bridge.store()
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    pub fn awareness(&self) -> &AwarenessBroadcaster {
        &self.awareness
    }

    pub fn awareness_mut(&mut self) -> &mut AwarenessBroadcaster {
        &mut self.awareness
    }

    pub fn peers(&self) -> PeerMap {
        self.awareness.peers()
    }

    pub fn indicator(&self) -> IndicatorState {
        self.indicator.state()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Updates waiting for the channel.
    pub fn queued_updates(&self) -> usize {
        lock_outbox(&self.outbox).len()
    }

    /// Merge a presence change into the local state.
    pub fn publish_presence(&mut self, update: AwarenessUpdate) -> Option<Duration> {
        self.awareness.publish_local_state(update)
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    /// Revert this replica's most recent unit of edits.
    pub fn undo(&self) -> Result<bool, SyncError> {
        self.ensure_open()?;
        Ok(self.undo.undo()?)
    }

    pub fn redo(&self) -> Result<bool, SyncError> {
        self.ensure_open()?;
        Ok(self.undo.redo()?)
    }

    /// Close the current undo capture window.
    pub fn stop_capturing(&self) {
        self.undo.stop_capturing();
    }

    /// Ask the channel to re-establish itself.
    pub fn reconnect(&self) -> Result<(), SyncError> {
        self.ensure_open()?;
        tracing::info!(room = %self.channel.room(), "reconnect requested");
        self.channel.reconnect();
        Ok(())
    }

    /// Forward a host lifecycle signal. Returns whether a reconnect was
    /// requested.
    pub fn on_lifecycle(&self, signal: LifecycleSignal) -> bool {
        !self.closed && self.lifecycle.on_signal(signal)
    }

    /// Drain every queued transport event without blocking, then run the
    /// timers. Returns the number of events handled.
    ///
    /// Errors from individual events are logged and do not stop the drain.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            if let Err(e) = self.handle_event(event) {
                tracing::warn!(?e, "failed to handle transport event");
            }
            handled += 1;
        }
        self.tick();
        handled
    }

    /// Handle events as they arrive until the channel closes its stream.
    pub async fn run(&mut self) {
        let period = self.config.awareness_throttle().max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        tracing::debug!("transport event stream ended");
                        break;
                    };
                    if let Err(e) = self.handle_event(event) {
                        tracing::warn!(?e, "failed to handle transport event");
                    }
                }
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    /// Time-driven work: presence heartbeat and expiry, banner dismissal.
    pub fn tick(&mut self) {
        if self.closed {
            return;
        }
        self.awareness.tick();
        self.indicator.tick();
    }

    pub fn handle_event(&mut self, event: TransportEvent) -> Result<(), SyncError> {
        self.ensure_open()?;
        match event {
            TransportEvent::StatusChanged(status) => {
                self.indicator.on_status(status);
                match status {
                    ConnectionStatus::Connected => self.on_connected()?,
                    ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                        self.on_disconnected(status)
                    }
                    ConnectionStatus::Connecting => {}
                }
            }
            TransportEvent::Synced(true) => {
                let stats = self.bridge.initial_sync()?;
                tracing::debug!(mutations = stats.mutations(), "initial sync applied");
            }
            TransportEvent::Synced(false) => {}
            TransportEvent::Received(bytes) => self.on_message(&bytes)?,
        }
        Ok(())
    }

    fn on_connected(&mut self) -> Result<(), SyncError> {
        if self.connected_before {
            let actor = ActorId::random();
            self.doc.set_actor(actor)?;
            self.undo.set_actor(actor);
            self.awareness.retire_actor(actor);
            tracing::info!(%actor, "reconnected with new actor");
        } else {
            tracing::info!(actor = %self.actor(), "connected");
        }
        self.connected_before = true;

        self.send(&CollabMessage::SyncRequest {
            have_version: self.doc.encode_version(),
        })?;
        self.flush_outbox();
        self.awareness.resend();
        Ok(())
    }

    fn on_disconnected(&mut self, status: ConnectionStatus) {
        tracing::info!(%status, actor = %self.actor(), "connection lost");
        self.undo.clear();
        self.awareness.clear_peers();
    }

    fn on_message(&mut self, bytes: &[u8]) -> Result<(), SyncError> {
        let message = match CollabMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(?e, len = bytes.len(), "dropping malformed room message");
                return Ok(());
            }
        };
        tracing::trace!(kind = message.kind(), "room message");
        match message {
            CollabMessage::DocUpdate { data } | CollabMessage::SyncResponse { data } => {
                self.bridge.apply_remote_update(&data)?;
            }
            CollabMessage::SyncRequest { have_version } => {
                let version = ReplicatedDoc::decode_version(&have_version)?;
                let data = self.doc.export_updates_since(&version)?;
                self.send(&CollabMessage::SyncResponse { data })?;
                // introduce ourselves to whoever just arrived
                self.awareness.resend();
            }
            CollabMessage::Awareness {
                actor,
                clock,
                state,
            } => self.awareness.receive(actor, clock, state),
        }
        Ok(())
    }

    fn flush_outbox(&self) {
        let mut queued = lock_outbox(&self.outbox);
        if queued.is_empty() {
            return;
        }
        let total = queued.len();
        let mut sent = 0;
        for data in queued.iter() {
            let result = encode(&CollabMessage::DocUpdate { data: data.clone() })
                .and_then(|bytes| self.channel.send(bytes));
            if let Err(e) = result {
                tracing::debug!(?e, "outbox flush interrupted");
                break;
            }
            sent += 1;
        }
        queued.drain(..sent);
        tracing::debug!(sent, total, "flushed offline updates");
    }

    fn send(&self, message: &CollabMessage) -> Result<(), SyncError> {
        self.channel.send(encode(message)?)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    /// Leave the room: a final empty presence, then the channel and both
    /// bridge listeners go away. The store keeps its records.
    pub fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.awareness.teardown();
        drop(self.updates.take());
        self.channel.destroy();
        self.bridge.detach();
        self.undo.clear();
        tracing::info!(room = %self.channel.room(), "session closed");
    }
}

impl<C: TransportChannel + 'static, S: DocumentStore + 'static> Drop for Session<C, S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
