//! Sequenced application event logging with at-least-once delivery.
//!
//! Events are queued locally with a per-session sequence number and flushed
//! in batches: right after logging (best-effort), periodically, and on
//! teardown through the transport's beacon. A batch that fails to send goes
//! back to the front of the queue, ahead of anything logged meanwhile.

use log::{debug, info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::constants::{now_ms, DEFAULT_EVENT_FLUSH_INTERVAL_MS};
use crate::transport::{EventTransport, TransportError};
use crate::types::{Event, EventBatch, EventKind, EventValidationError};

#[derive(Debug, Clone, PartialEq)]
pub struct EventPolicy {
    pub flush_interval_ms: u64,
    /// Trigger a flush after every logged event
    pub immediate_flush: bool,
}

impl Default for EventPolicy {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_EVENT_FLUSH_INTERVAL_MS,
            immediate_flush: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogError {
    NotInitialized,
    Invalid(EventValidationError),
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::NotInitialized => write!(f, "Event logger has no session"),
            LogError::Invalid(e) => write!(f, "Invalid event: {}", e),
        }
    }
}

impl std::error::Error for LogError {}

impl From<EventValidationError> for LogError {
    fn from(e: EventValidationError) -> Self {
        LogError::Invalid(e)
    }
}

#[derive(Default)]
struct LoggerState {
    session_id: Option<String>,
    next_sequence: u64,
    queue: VecDeque<Event>,
    /// Snapshots currently being sent, by flush id
    in_flight: BTreeMap<u64, Vec<Event>>,
    next_flush_id: u64,
}

fn lock_state(state: &Mutex<LoggerState>) -> MutexGuard<'_, LoggerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct EventLogger<T: EventTransport> {
    transport: Arc<T>,
    policy: EventPolicy,
    state: Arc<Mutex<LoggerState>>,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: EventTransport> EventLogger<T> {
    pub fn new(transport: Arc<T>, policy: EventPolicy) -> Self {
        Self {
            transport,
            policy,
            state: Arc::new(Mutex::new(LoggerState::default())),
            cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
        }
    }

    /// Bind the logger to a session.
    ///
    /// Same id: no-op. Different id: the queue of the prior session is
    /// flushed first, then the sequence counter restarts at 0. Events of the
    /// prior session that could not be sent stay queued under their own id.
    pub async fn initialize(&self, session_id: &str) {
        let had_prior = {
            let state = lock_state(&self.state);
            match &state.session_id {
                Some(current) if current == session_id => return,
                Some(_) => true,
                None => false,
            }
        };
        if had_prior {
            if let Err(e) = flush_queue(Arc::clone(&self.transport), Arc::clone(&self.state)).await {
                warn!("Flush of the previous session failed, events stay queued: {}", e);
            }
        }
        let mut state = lock_state(&self.state);
        state.session_id = Some(session_id.to_string());
        state.next_sequence = 0;
        info!("[{}] Event logger initialized", session_id);
    }

    /// Spawn the periodic backup flush on the current tokio runtime
    pub fn start_periodic_flush(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if ticker.is_some() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let period = Duration::from_millis(self.policy.flush_interval_ms.max(1));
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = flush_queue(Arc::clone(&transport), Arc::clone(&state)).await {
                            debug!("Periodic event flush failed, retrying next tick: {}", e);
                        }
                    }
                }
            }
        }));
    }

    /// Validate, sequence and queue an event. Returns its sequence number.
    pub fn log_event(&self, kind: EventKind) -> Result<u64, LogError> {
        kind.validate()?;
        let sequence_number = {
            let mut state = lock_state(&self.state);
            let session_id = state.session_id.clone().ok_or(LogError::NotInitialized)?;
            let sequence_number = state.next_sequence;
            state.next_sequence += 1;
            state.queue.push_back(Event {
                event_id: Uuid::new_v4(),
                session_id,
                sequence_number,
                timestamp_ms: now_ms(),
                kind,
            });
            sequence_number
        };

        if self.policy.immediate_flush {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let transport = Arc::clone(&self.transport);
                let state = Arc::clone(&self.state);
                handle.spawn(async move {
                    if let Err(e) = flush_queue(transport, state).await {
                        debug!("Immediate event flush failed: {}", e);
                    }
                });
            }
        }
        Ok(sequence_number)
    }

    /// Send everything queued. Returns the number of events delivered.
    pub async fn flush(&self) -> Result<usize, TransportError> {
        flush_queue(Arc::clone(&self.transport), Arc::clone(&self.state)).await
    }

    /// Page-exit delivery: hand the queue to the beacon without waiting.
    ///
    /// Snapshots of flushes still in flight go out first, so a flush failing
    /// after teardown cannot strand its events; one that succeeds delivers
    /// them twice, which the store deduplicates. Events of a batch the beacon
    /// does not accept are restored to the queue. Returns whether every batch
    /// was accepted.
    pub fn teardown(&self) -> bool {
        self.cancel.cancel();
        let snapshot: Vec<Event> = {
            let mut state = lock_state(&self.state);
            let in_flight = std::mem::take(&mut state.in_flight);
            let mut snapshot: Vec<Event> = in_flight.into_values().flatten().collect();
            snapshot.extend(state.queue.drain(..));
            snapshot
        };
        if snapshot.is_empty() {
            return true;
        }

        let mut restored = Vec::new();
        for (session_id, events) in group_by_session(snapshot) {
            let batch = EventBatch::from_events(&session_id, &events);
            if self.transport.send_beacon(batch) {
                debug!("[{}] Beacon accepted {} events", session_id, events.len());
            } else {
                warn!("[{}] Beacon refused {} events", session_id, events.len());
                restored.extend(events);
            }
        }

        let all_accepted = restored.is_empty();
        if !all_accepted {
            let mut state = lock_state(&self.state);
            for event in restored.into_iter().rev() {
                state.queue.push_front(event);
            }
        }
        all_accepted
    }

    /// Stop the periodic flush and make a last delivery attempt
    pub async fn shutdown(&self) -> Result<usize, TransportError> {
        self.cancel.cancel();
        let ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }
        self.flush().await
    }

    pub fn pending(&self) -> usize {
        lock_state(&self.state).queue.len()
    }

    pub fn session_id(&self) -> Option<String> {
        lock_state(&self.state).session_id.clone()
    }
}

impl<T: EventTransport> Drop for EventLogger<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// Split a snapshot into per-session runs, keeping order
fn group_by_session(events: Vec<Event>) -> Vec<(String, Vec<Event>)> {
    let mut groups: Vec<(String, Vec<Event>)> = Vec::new();
    for event in events {
        match groups.last_mut() {
            Some((session_id, group)) if *session_id == event.session_id => group.push(event),
            _ => groups.push((event.session_id.clone(), vec![event])),
        }
    }
    groups
}

async fn flush_queue<T: EventTransport>(
    transport: Arc<T>,
    state: Arc<Mutex<LoggerState>>,
) -> Result<usize, TransportError> {
    let (flush_id, snapshot) = {
        let mut guard = lock_state(&state);
        let snapshot: Vec<Event> = guard.queue.drain(..).collect();
        if snapshot.is_empty() {
            return Ok(0);
        }
        let flush_id = guard.next_flush_id;
        guard.next_flush_id += 1;
        guard.in_flight.insert(flush_id, snapshot.clone());
        (flush_id, snapshot)
    };

    let mut groups = group_by_session(snapshot).into_iter();
    let mut sent = 0;
    while let Some((session_id, events)) = groups.next() {
        let batch = EventBatch::from_events(&session_id, &events);
        match transport.send_batch(batch).await {
            Ok(()) => sent += events.len(),
            Err(e) => {
                let unsent: Vec<Event> = events
                    .into_iter()
                    .chain(groups.flat_map(|(_, rest)| rest))
                    .collect();
                let mut state = lock_state(&state);
                // Teardown already took this snapshot
                if state.in_flight.remove(&flush_id).is_some() {
                    for event in unsent.into_iter().rev() {
                        state.queue.push_front(event);
                    }
                }
                return Err(e);
            }
        }
    }
    lock_state(&state).in_flight.remove(&flush_id);
    Ok(sent)
}
