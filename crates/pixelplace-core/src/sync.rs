//! Grid synchronization with the authority.
//!
//! Local writes are applied to the grid immediately and tracked as
//! [`PendingWrite`]s until the authority echoes them back. Remote deltas are
//! applied in arrival order; the authority is the single ordering point and the
//! last write it accepts for a cell wins.

use std::collections::HashMap;

#[cfg(not(target_arch = "wasm32"))]
use std::time::{Duration, Instant};

#[cfg(target_arch = "wasm32")]
use web_time::{Duration, Instant};

use uuid::Uuid;

use crate::color::ColorValue;
use crate::config::EngineConfig;
use crate::error::{CanvasResult, ProtocolError};
use crate::grid::{GridCoordinate, GridStore};
use crate::protocol::{ClientMessage, ServerMessage, SnapshotEntry};
use crate::transport::{Transport, TransportEvent};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Synced,
}

/// A local write the authority has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub coord: GridCoordinate,
    pub color: ColorValue,
    pub seq: u64,
    /// When the write was last handed to the transport; `None` while queued.
    pub sent_at: Option<Instant>,
}

/// Things that happened during a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection state changed
    StateChanged(ConnectionState),
    /// Full grid replaced from a snapshot
    SnapshotApplied { entries: usize },
    /// A remote write was applied to the grid
    DeltaApplied { coord: GridCoordinate, color: ColorValue },
    /// The authority accepted one of our writes
    Acknowledged { coord: GridCoordinate, seq: u64 },
    /// A pending write was dropped without acknowledgment
    PendingDropped { coord: GridCoordinate, seq: u64 },
    /// The authority sent garbage; the channel was reset
    ProtocolError(ProtocolError),
    /// The authority reported an error message
    AuthorityError { message: String },
}

/// Reconnect delay for the given number of consecutive failures.
///
/// `base * 2^failures`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

// First 100 characters, for logs.
fn preview(text: &str) -> &str {
    text.char_indices().nth(100).map_or(text, |(i, _)| &text[..i])
}

/// Keeps a [`GridStore`] in step with the authority over a [`Transport`].
pub struct SyncChannel<T: Transport> {
    transport: T,
    /// Stable across reconnects so late acknowledgments are still recognized.
    client_id: String,
    state: ConnectionState,
    /// Where to (re)connect; `None` once torn down.
    endpoint: Option<String>,
    next_seq: u64,
    pending: HashMap<GridCoordinate, PendingWrite>,
    failures: u32,
    retry_at: Option<Instant>,
    /// Events from `connect`/`disconnect`, handed out by the next poll
    queued_events: Vec<SyncEvent>,
    reconnect_base: Duration,
    reconnect_max: Duration,
    ack_timeout: Duration,
}

impl<T: Transport> SyncChannel<T> {
    /// Create a disconnected channel.
    pub fn new(transport: T, config: &EngineConfig) -> Self {
        Self {
            transport,
            client_id: Uuid::new_v4().to_string(),
            state: ConnectionState::Disconnected,
            endpoint: None,
            next_seq: 1,
            pending: HashMap::new(),
            failures: 0,
            retry_at: None,
            queued_events: Vec::new(),
            reconnect_base: config.reconnect_base(),
            reconnect_max: config.reconnect_max(),
            ack_timeout: config.ack_timeout(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// When the next reconnect attempt is due, if one is scheduled.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Unacknowledged writes, oldest first.
    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        let mut writes: Vec<_> = self.pending.values().copied().collect();
        writes.sort_by_key(|w| w.seq);
        writes
    }

    pub fn pending_for(&self, coord: GridCoordinate) -> Option<&PendingWrite> {
        self.pending.get(&coord)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Start connecting to `endpoint`. Returns immediately.
    ///
    /// The resulting [`SyncEvent::StateChanged`] is reported by the next poll.
    pub fn connect(&mut self, endpoint: &str) {
        self.connect_at(endpoint, Instant::now());
    }

    pub fn connect_at(&mut self, endpoint: &str, now: Instant) {
        let before = self.state;
        if self.state != ConnectionState::Disconnected || self.retry_at.is_some() {
            self.transport.disconnect();
            self.requeue_pending();
        }
        self.endpoint = Some(endpoint.to_string());
        self.failures = 0;
        self.start_attempt(now);
        if self.state != before {
            self.queued_events.push(SyncEvent::StateChanged(self.state));
        }
    }

    /// Tear the channel down and cancel reconnection. Pending writes are kept.
    pub fn disconnect(&mut self) {
        self.endpoint = None;
        self.retry_at = None;
        self.transport.disconnect();
        self.requeue_pending();
        if self.state != ConnectionState::Disconnected {
            log::info!("Sync channel torn down");
            self.state = ConnectionState::Disconnected;
            self.queued_events.push(SyncEvent::StateChanged(self.state));
        }
    }

    /// Apply a local write optimistically and send it (or queue it).
    ///
    /// Returns the sequence number assigned to the write.
    pub fn submit_write(
        &mut self,
        store: &mut GridStore,
        coord: GridCoordinate,
        color: ColorValue,
    ) -> CanvasResult<u64> {
        self.submit_write_at(store, coord, color, Instant::now())
    }

    pub fn submit_write_at(
        &mut self,
        store: &mut GridStore,
        coord: GridCoordinate,
        color: ColorValue,
        now: Instant,
    ) -> CanvasResult<u64> {
        store.set(coord, color)?;

        let seq = self.next_seq;
        self.next_seq += 1;
        let mut write = PendingWrite {
            coord,
            color,
            seq,
            sent_at: None,
        };

        if self.state == ConnectionState::Synced {
            self.transmit(&mut write, now);
        }
        if let Some(old) = self.pending.insert(coord, write) {
            log::debug!("Write #{} to ({}, {}) superseded by #{}", old.seq, coord.x, coord.y, seq);
        }
        Ok(seq)
    }

    /// Drain transport events and drive timers.
    pub fn poll(&mut self, store: &mut GridStore) -> Vec<SyncEvent> {
        self.poll_at(store, Instant::now())
    }

    pub fn poll_at(&mut self, store: &mut GridStore, now: Instant) -> Vec<SyncEvent> {
        let mut events = std::mem::take(&mut self.queued_events);

        for event in self.transport.poll_events() {
            let keep_going = match event {
                TransportEvent::Opened => {
                    self.on_opened(now, &mut events);
                    true
                }
                TransportEvent::Message(text) => self.on_message(store, &text, now, &mut events),
                TransportEvent::Closed => {
                    self.on_link_down("socket closed", now, &mut events);
                    false
                }
                TransportEvent::Error(message) => {
                    self.on_link_down(&message, now, &mut events);
                    false
                }
            };
            // Anything left in the batch belongs to a socket we already dropped
            if !keep_going {
                break;
            }
        }

        if let Some(at) = self.retry_at {
            if now >= at && self.endpoint.is_some() {
                self.start_attempt(now);
                events.push(SyncEvent::StateChanged(self.state));
            }
        }

        if self.state == ConnectionState::Synced {
            self.expire_pending(now, &mut events);
        }

        events
    }

    fn start_attempt(&mut self, now: Instant) {
        self.retry_at = None;
        self.state = ConnectionState::Connecting;
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        log::info!("Connecting to {} (attempt {})", endpoint, self.failures + 1);
        if let Err(e) = self.transport.connect(&endpoint) {
            log::warn!("Connect to {} failed: {}", endpoint, e);
            self.schedule_retry(now);
        }
    }

    fn schedule_retry(&mut self, now: Instant) {
        let delay = backoff_delay(self.reconnect_base, self.reconnect_max, self.failures);
        self.failures = self.failures.saturating_add(1);
        self.retry_at = Some(now + delay);
        log::info!("Reconnecting in {:?}", delay);
    }

    fn on_opened(&mut self, now: Instant, events: &mut Vec<SyncEvent>) {
        log::info!("Handshake with authority as {}", self.client_id);
        self.state = ConnectionState::Synced;
        self.failures = 0;
        events.push(SyncEvent::StateChanged(self.state));

        self.send(&ClientMessage::Hello {
            client_id: self.client_id.clone(),
        });
        self.flush(now);
    }

    fn on_link_down(&mut self, reason: &str, now: Instant, events: &mut Vec<SyncEvent>) {
        self.transport.disconnect();
        self.requeue_pending();
        match self.state {
            ConnectionState::Synced => {
                log::warn!("Connection lost: {}", reason);
                self.state = ConnectionState::Disconnected;
                events.push(SyncEvent::StateChanged(self.state));
            }
            // A failed handshake keeps us in Connecting while we retry
            ConnectionState::Connecting => log::warn!("Handshake failed: {}", reason),
            ConnectionState::Disconnected => return,
        }
        if self.endpoint.is_some() {
            self.schedule_retry(now);
        }
    }

    /// Returns false if the channel was reset and the rest of the batch must be dropped.
    fn on_message(
        &mut self,
        store: &mut GridStore,
        text: &str,
        now: Instant,
        events: &mut Vec<SyncEvent>,
    ) -> bool {
        if self.state != ConnectionState::Synced {
            log::debug!("Ignoring message while {:?}", self.state);
            return true;
        }
        log::debug!("Authority message: {}", preview(text));

        let result = serde_json::from_str::<ServerMessage>(text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
            .and_then(|msg| self.apply_message(store, msg, events));

        match result {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Protocol error from authority: {}", err);
                events.push(SyncEvent::ProtocolError(err));
                self.transport.disconnect();
                self.requeue_pending();
                self.state = ConnectionState::Disconnected;
                events.push(SyncEvent::StateChanged(self.state));
                if self.endpoint.is_some() {
                    self.schedule_retry(now);
                }
                false
            }
        }
    }

    fn apply_message(
        &mut self,
        store: &mut GridStore,
        msg: ServerMessage,
        events: &mut Vec<SyncEvent>,
    ) -> Result<(), ProtocolError> {
        match msg {
            ServerMessage::Snapshot { width, height, entries } => {
                self.apply_snapshot(store, width, height, &entries)?;
                events.push(SyncEvent::SnapshotApplied {
                    entries: entries.len(),
                });
            }
            ServerMessage::Delta {
                x,
                y,
                color,
                origin,
                origin_seq,
            } => {
                let coord = GridCoordinate::new(x, y);
                if !store.contains(coord) {
                    return Err(ProtocolError::OutOfBounds { x, y });
                }
                self.apply_delta(store, coord, color, origin.as_deref(), origin_seq, events);
            }
            ServerMessage::Error { message } => {
                log::warn!("Authority error: {}", message);
                events.push(SyncEvent::AuthorityError { message });
            }
        }
        Ok(())
    }

    fn apply_snapshot(
        &mut self,
        store: &mut GridStore,
        width: u32,
        height: u32,
        entries: &[SnapshotEntry],
    ) -> Result<(), ProtocolError> {
        let (local_width, local_height) = store.dimensions();
        if (width, height) != (local_width, local_height) {
            return Err(ProtocolError::DimensionMismatch {
                width: local_width,
                height: local_height,
                got_width: width,
                got_height: height,
            });
        }
        if let Some(bad) = entries.iter().find(|e| !store.contains(e.coord())) {
            return Err(ProtocolError::OutOfBounds { x: bad.x, y: bad.y });
        }

        // Cells with a pending write keep their optimistic color; the write
        // was just re-sent and will land after this snapshot.
        let pending = &self.pending;
        store
            .replace_all(
                entries.iter().map(|e| (e.coord(), e.color)),
                |coord| pending.contains_key(&coord),
            )
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        log::info!("Applied snapshot with {} painted cells", entries.len());
        Ok(())
    }

    fn apply_delta(
        &mut self,
        store: &mut GridStore,
        coord: GridCoordinate,
        color: ColorValue,
        origin: Option<&str>,
        origin_seq: Option<u64>,
        events: &mut Vec<SyncEvent>,
    ) {
        let from_self = origin == Some(self.client_id.as_str());

        if let Some(pending) = self.pending.get(&coord).copied() {
            if from_self {
                match origin_seq {
                    Some(seq) if seq == pending.seq => {
                        self.pending.remove(&coord);
                        events.push(SyncEvent::Acknowledged { coord, seq });
                    }
                    // Echo of a write we already superseded locally
                    Some(seq) if seq < pending.seq => return,
                    _ => {}
                }
            } else if pending.sent_at.is_some() {
                // Accepted by the authority after our write went out: it wins
                log::debug!(
                    "Remote write to ({}, {}) overrides pending #{}",
                    coord.x,
                    coord.y,
                    pending.seq
                );
                self.pending.remove(&coord);
                events.push(SyncEvent::PendingDropped {
                    coord,
                    seq: pending.seq,
                });
            } else {
                // Our queued write will be ordered after this one
                return;
            }
        }

        // In-range was checked by the caller
        if store.set(coord, color).is_ok() {
            events.push(SyncEvent::DeltaApplied { coord, color });
        }
    }

    /// Send every queued write, oldest first.
    fn flush(&mut self, now: Instant) {
        let mut queued: Vec<_> = self
            .pending
            .values()
            .filter(|w| w.sent_at.is_none())
            .map(|w| w.coord)
            .collect();
        queued.sort_by_key(|coord| self.pending[coord].seq);

        if !queued.is_empty() {
            log::info!("Flushing {} queued writes", queued.len());
        }
        for coord in queued {
            if let Some(mut write) = self.pending.get(&coord).copied() {
                self.transmit(&mut write, now);
                self.pending.insert(coord, write);
            }
        }
    }

    fn transmit(&self, write: &mut PendingWrite, now: Instant) {
        if self.send(&ClientMessage::write(write.coord, write.color, write.seq)) {
            write.sent_at = Some(now);
        }
    }

    fn send(&self, msg: &ClientMessage) -> bool {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Failed to encode {:?}: {}", msg, e);
                return false;
            }
        };
        match self.transport.send(&json) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Send failed: {}", e);
                false
            }
        }
    }

    /// Mark all in-flight writes as queued so they are retried after reconnect.
    fn requeue_pending(&mut self) {
        for write in self.pending.values_mut() {
            write.sent_at = None;
        }
    }

    fn expire_pending(&mut self, now: Instant, events: &mut Vec<SyncEvent>) {
        let timeout = self.ack_timeout;
        let expired: Vec<PendingWrite> = self
            .pending
            .values()
            .filter(|w| w.sent_at.is_some_and(|at| now.duration_since(at) >= timeout))
            .copied()
            .collect();
        for write in expired {
            log::warn!(
                "Write #{} to ({}, {}) was never acknowledged; dropping",
                write.seq,
                write.coord.x,
                write.coord.y
            );
            self.pending.remove(&write.coord);
            events.push(SyncEvent::PendingDropped {
                coord: write.coord,
                seq: write.seq,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;

    const RED: ColorValue = ColorValue::new(255, 0, 0);
    const GREEN: ColorValue = ColorValue::new(0, 255, 0);
    const BLUE: ColorValue = ColorValue::new(0, 0, 255);
    const ENDPOINT: &str = "ws://authority/ws";

    fn setup() -> (SyncChannel<MockTransport>, GridStore) {
        let config = EngineConfig {
            width: 10,
            height: 10,
            ..EngineConfig::default()
        };
        let channel = SyncChannel::new(MockTransport::new(), &config);
        let store = GridStore::new(config.width, config.height, config.default_color);
        (channel, store)
    }

    fn synced(now: Instant) -> (SyncChannel<MockTransport>, GridStore) {
        let (mut channel, mut store) = setup();
        channel.connect_at(ENDPOINT, now);
        channel.transport_mut().push(TransportEvent::Opened);
        channel.poll_at(&mut store, now);
        channel.transport().take_sent();
        (channel, store)
    }

    fn sent_messages(channel: &SyncChannel<MockTransport>) -> Vec<ClientMessage> {
        channel
            .transport()
            .take_sent()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    fn delta(
        channel: &SyncChannel<MockTransport>,
        coord: GridCoordinate,
        color: ColorValue,
        seq: Option<u64>,
        own: bool,
    ) -> TransportEvent {
        let origin = if own { channel.client_id() } else { "someone-else" };
        let msg = ServerMessage::Delta {
            x: coord.x,
            y: coord.y,
            color,
            origin: Some(origin.to_string()),
            origin_seq: seq,
        };
        TransportEvent::Message(serde_json::to_string(&msg).unwrap())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, max, 5), Duration::from_millis(16_000));
        assert_eq!(backoff_delay(base, max, 6), max);
        assert_eq!(backoff_delay(base, max, 200), max);
    }

    #[test]
    fn test_write_while_disconnected_is_optimistic_and_queued() {
        let (mut channel, mut store) = setup();
        let coord = GridCoordinate::new(3, 7);
        let seq = channel.submit_write(&mut store, coord, RED).unwrap();

        assert_eq!(store.get(coord).unwrap(), RED);
        assert_eq!(channel.pending_for(coord).map(|w| (w.seq, w.sent_at)), Some((seq, None)));
        assert!(channel.transport().take_sent().is_empty());
    }

    #[test]
    fn test_out_of_bounds_write_is_not_queued() {
        let (mut channel, mut store) = setup();
        assert!(channel.submit_write(&mut store, GridCoordinate::new(10, 0), RED).is_err());
        assert!(channel.pending_writes().is_empty());
    }

    #[test]
    fn test_handshake_sends_hello_then_queued_writes() {
        let now = Instant::now();
        let (mut channel, mut store) = setup();
        channel.submit_write_at(&mut store, GridCoordinate::new(1, 1), RED, now).unwrap();
        channel.submit_write_at(&mut store, GridCoordinate::new(2, 2), BLUE, now).unwrap();

        channel.connect_at(ENDPOINT, now);
        assert_eq!(channel.state(), ConnectionState::Connecting);

        channel.transport_mut().push(TransportEvent::Opened);
        let events = channel.poll_at(&mut store, now);
        assert_eq!(channel.state(), ConnectionState::Synced);
        assert!(events.contains(&SyncEvent::StateChanged(ConnectionState::Synced)));

        let sent = sent_messages(&channel);
        assert_eq!(
            sent,
            vec![
                ClientMessage::Hello {
                    client_id: channel.client_id().to_string()
                },
                ClientMessage::write(GridCoordinate::new(1, 1), RED, 1),
                ClientMessage::write(GridCoordinate::new(2, 2), BLUE, 2),
            ]
        );
    }

    #[test]
    fn test_queued_writes_coalesce_per_cell() {
        let now = Instant::now();
        let (mut channel, mut store) = setup();
        let a = GridCoordinate::new(4, 4);
        channel.submit_write_at(&mut store, a, RED, now).unwrap();
        let second = channel.submit_write_at(&mut store, a, BLUE, now).unwrap();
        assert_eq!(store.get(a).unwrap(), BLUE);

        channel.connect_at(ENDPOINT, now);
        channel.transport_mut().push(TransportEvent::Opened);
        channel.poll_at(&mut store, now);

        let writes: Vec<_> = sent_messages(&channel)
            .into_iter()
            .filter(|m| matches!(m, ClientMessage::Write { .. }))
            .collect();
        assert_eq!(writes, vec![ClientMessage::write(a, BLUE, second)]);
    }

    #[test]
    fn test_snapshot_scenario() {
        let now = Instant::now();
        let (mut channel, mut store) = setup();
        channel.connect_at(ENDPOINT, now);
        assert_eq!(channel.state(), ConnectionState::Connecting);
        channel.transport_mut().push(TransportEvent::Opened);
        channel.transport_mut().push(TransportEvent::Message(
            r#"{"type":"snapshot","width":10,"height":10,
                "entries":[{"x":2,"y":2,"color":[0,255,0]}]}"#
                .to_string(),
        ));
        let events = channel.poll_at(&mut store, now);

        assert_eq!(channel.state(), ConnectionState::Synced);
        assert!(events.contains(&SyncEvent::SnapshotApplied { entries: 1 }));
        assert_eq!(store.get(GridCoordinate::new(2, 2)).unwrap(), GREEN);
        for y in 0..10 {
            for x in 0..10 {
                if (x, y) != (2, 2) {
                    assert_eq!(store.get(GridCoordinate::new(x, y)).unwrap(), ColorValue::WHITE);
                }
            }
        }
    }

    #[test]
    fn test_snapshot_keeps_pending_cells() {
        let now = Instant::now();
        let (mut channel, mut store) = setup();
        let mine = GridCoordinate::new(5, 5);
        channel.submit_write_at(&mut store, mine, RED, now).unwrap();

        channel.connect_at(ENDPOINT, now);
        channel.transport_mut().push(TransportEvent::Opened);
        channel.transport_mut().push(TransportEvent::Message(
            r#"{"type":"snapshot","width":10,"height":10,
                "entries":[{"x":5,"y":5,"color":[0,0,255]}]}"#
                .to_string(),
        ));
        channel.poll_at(&mut store, now);

        assert_eq!(store.get(mine).unwrap(), RED);
        assert!(channel.pending_for(mine).is_some());
    }

    #[test]
    fn test_own_delta_acknowledges() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        let coord = GridCoordinate::new(1, 2);
        let seq = channel.submit_write_at(&mut store, coord, RED, now).unwrap();
        assert_eq!(sent_messages(&channel), vec![ClientMessage::write(coord, RED, seq)]);

        let ack = delta(&channel, coord, RED, Some(seq), true);
        channel.transport_mut().push(ack);
        let events = channel.poll_at(&mut store, now);

        assert!(events.contains(&SyncEvent::Acknowledged { coord, seq }));
        assert!(channel.pending_writes().is_empty());
        assert_eq!(store.get(coord).unwrap(), RED);
    }

    #[test]
    fn test_stale_own_ack_does_not_clobber_newer_write() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        let coord = GridCoordinate::new(1, 2);
        let first = channel.submit_write_at(&mut store, coord, RED, now).unwrap();
        let second = channel.submit_write_at(&mut store, coord, BLUE, now).unwrap();

        let ack = delta(&channel, coord, RED, Some(first), true);
        channel.transport_mut().push(ack);
        channel.poll_at(&mut store, now);

        assert_eq!(store.get(coord).unwrap(), BLUE);
        assert_eq!(channel.pending_for(coord).map(|w| w.seq), Some(second));
    }

    #[test]
    fn test_remote_delta_overrides_sent_pending() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        let coord = GridCoordinate::new(6, 6);
        let seq = channel.submit_write_at(&mut store, coord, RED, now).unwrap();

        let remote = delta(&channel, coord, GREEN, Some(99), false);
        channel.transport_mut().push(remote);
        let events = channel.poll_at(&mut store, now);

        assert!(events.contains(&SyncEvent::PendingDropped { coord, seq }));
        assert_eq!(store.get(coord).unwrap(), GREEN);
        assert!(channel.pending_for(coord).is_none());
    }

    #[test]
    fn test_remote_delta_without_pending_applies() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        let coord = GridCoordinate::new(0, 9);
        let remote = delta(&channel, coord, GREEN, None, false);
        channel.transport_mut().push(remote);
        let events = channel.poll_at(&mut store, now);
        assert_eq!(events, vec![SyncEvent::DeltaApplied { coord, color: GREEN }]);
        assert_eq!(store.get(coord).unwrap(), GREEN);
    }

    #[test]
    fn test_connection_loss_preserves_pending_and_resends() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        let coord = GridCoordinate::new(3, 3);
        let seq = channel.submit_write_at(&mut store, coord, RED, now).unwrap();
        channel.transport().take_sent();

        channel.transport_mut().push(TransportEvent::Closed);
        let events = channel.poll_at(&mut store, now);
        assert!(events.contains(&SyncEvent::StateChanged(ConnectionState::Disconnected)));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(store.get(coord).unwrap(), RED);
        assert_eq!(channel.pending_for(coord).map(|w| w.sent_at), Some(None));

        // Not yet time to retry
        channel.poll_at(&mut store, now + Duration::from_millis(499));
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        channel.poll_at(&mut store, now + Duration::from_millis(500));
        assert_eq!(channel.state(), ConnectionState::Connecting);
        assert_eq!(channel.transport().connect_calls, 2);

        channel.transport_mut().push(TransportEvent::Opened);
        channel.poll_at(&mut store, now + Duration::from_millis(600));
        let writes: Vec<_> = sent_messages(&channel)
            .into_iter()
            .filter(|m| matches!(m, ClientMessage::Write { .. }))
            .collect();
        assert_eq!(writes, vec![ClientMessage::write(coord, RED, seq)]);
    }

    #[test]
    fn test_failed_connects_back_off_while_connecting() {
        let now = Instant::now();
        let (mut channel, mut store) = setup();
        channel.transport_mut().fail_connect = true;

        channel.connect_at(ENDPOINT, now);
        assert_eq!(channel.state(), ConnectionState::Connecting);
        assert_eq!(channel.retry_at(), Some(now + Duration::from_millis(500)));

        channel.poll_at(&mut store, now + Duration::from_millis(500));
        assert_eq!(channel.state(), ConnectionState::Connecting);
        assert_eq!(channel.transport().connect_calls, 2);
        assert_eq!(
            channel.retry_at(),
            Some(now + Duration::from_millis(500) + Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_handshake_error_event_retries() {
        let now = Instant::now();
        let (mut channel, mut store) = setup();
        channel.connect_at(ENDPOINT, now);
        channel.transport_mut().push(TransportEvent::Error("refused".to_string()));
        channel.poll_at(&mut store, now);

        assert_eq!(channel.state(), ConnectionState::Connecting);
        assert_eq!(channel.retry_at(), Some(now + Duration::from_millis(500)));
    }

    #[test]
    fn test_malformed_message_resets_channel() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        channel.transport_mut().push(TransportEvent::Message("{not json".to_string()));
        let events = channel.poll_at(&mut store, now);

        assert!(matches!(
            events.first(),
            Some(SyncEvent::ProtocolError(ProtocolError::Malformed(_)))
        ));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(channel.transport().disconnect_calls, 1);
        assert!(channel.retry_at().is_some());
    }

    #[test]
    fn test_snapshot_dimension_mismatch_is_protocol_error() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        channel.transport_mut().push(TransportEvent::Message(
            r#"{"type":"snapshot","width":20,"height":10,"entries":[]}"#.to_string(),
        ));
        let events = channel.poll_at(&mut store, now);
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::ProtocolError(ProtocolError::DimensionMismatch { got_width: 20, .. })
        )));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_out_of_range_delta_is_protocol_error() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        let bad = delta(&channel, GridCoordinate::new(10, 10), RED, None, false);
        channel.transport_mut().push(bad);
        let events = channel.poll_at(&mut store, now);
        let expected = SyncEvent::ProtocolError(ProtocolError::OutOfBounds { x: 10, y: 10 });
        assert!(events.contains(&expected));
    }

    #[test]
    fn test_unacknowledged_write_times_out() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        let coord = GridCoordinate::new(2, 8);
        let seq = channel.submit_write_at(&mut store, coord, RED, now).unwrap();

        assert!(channel.poll_at(&mut store, now + Duration::from_secs(9)).is_empty());
        let events = channel.poll_at(&mut store, now + Duration::from_secs(10));
        assert_eq!(events, vec![SyncEvent::PendingDropped { coord, seq }]);
        // The optimistic color stays on screen
        assert_eq!(store.get(coord).unwrap(), RED);
    }

    #[test]
    fn test_disconnect_cancels_reconnection() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        channel.submit_write_at(&mut store, GridCoordinate::new(1, 1), RED, now).unwrap();
        channel.disconnect();

        assert_eq!(channel.state(), ConnectionState::Disconnected);
        channel.poll_at(&mut store, now + Duration::from_secs(120));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(channel.transport().connect_calls, 1);
        assert_eq!(channel.pending_writes().len(), 1);
    }

    #[test]
    fn test_remote_delta_ignored_while_write_queued() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        let coord = GridCoordinate::new(7, 1);
        channel.transport_mut().fail_send = true;
        let seq = channel.submit_write_at(&mut store, coord, RED, now).unwrap();
        assert_eq!(channel.pending_for(coord).map(|w| w.sent_at), Some(None));

        let remote = delta(&channel, coord, GREEN, Some(40), false);
        channel.transport_mut().push(remote);
        let events = channel.poll_at(&mut store, now);

        assert!(events.is_empty());
        assert_eq!(store.get(coord).unwrap(), RED);
        assert_eq!(channel.pending_for(coord).map(|w| w.seq), Some(seq));
    }

    #[test]
    fn test_own_delta_without_pending_applies() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        let coord = GridCoordinate::new(4, 0);
        let echo = delta(&channel, coord, BLUE, Some(5), true);
        channel.transport_mut().push(echo);
        let events = channel.poll_at(&mut store, now);

        assert_eq!(events, vec![SyncEvent::DeltaApplied { coord, color: BLUE }]);
        assert_eq!(store.get(coord).unwrap(), BLUE);
    }

    #[test]
    fn test_ack_after_reconnect_is_recognized() {
        let now = Instant::now();
        let (mut channel, mut store) = synced(now);
        let client_id = channel.client_id().to_string();
        let coord = GridCoordinate::new(8, 8);
        let seq = channel.submit_write_at(&mut store, coord, RED, now).unwrap();

        channel.transport_mut().push(TransportEvent::Closed);
        channel.poll_at(&mut store, now);
        channel.poll_at(&mut store, now + Duration::from_millis(500));
        assert_eq!(channel.state(), ConnectionState::Connecting);

        channel.transport_mut().push(TransportEvent::Opened);
        channel.poll_at(&mut store, now + Duration::from_millis(600));
        assert_eq!(channel.client_id(), client_id);
        let sent = sent_messages(&channel);
        assert!(sent.contains(&ClientMessage::Hello { client_id }));

        let echo = delta(&channel, coord, RED, Some(seq), true);
        channel.transport_mut().push(echo);
        let events = channel.poll_at(&mut store, now + Duration::from_millis(700));
        assert!(events.contains(&SyncEvent::Acknowledged { coord, seq }));
        assert!(channel.pending_writes().is_empty());
    }

    #[test]
    fn test_connect_and_disconnect_report_state_on_next_poll() {
        let now = Instant::now();
        let (mut channel, mut store) = setup();
        channel.connect_at(ENDPOINT, now);
        assert_eq!(
            channel.poll_at(&mut store, now),
            vec![SyncEvent::StateChanged(ConnectionState::Connecting)]
        );

        channel.disconnect();
        assert_eq!(
            channel.poll_at(&mut store, now),
            vec![SyncEvent::StateChanged(ConnectionState::Disconnected)]
        );
        assert!(channel.poll_at(&mut store, now).is_empty());
    }
}
