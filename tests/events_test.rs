use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use session_capture::events::{EventLogger, EventPolicy, LogError};
use session_capture::transport::{EventTransport, TransportError};
use session_capture::types::{EventBatch, EventKind, EventType};

/// Transport that records what it delivers and can fail on demand
#[derive(Default)]
struct MockTransport {
    failures_left: AtomicU32,
    refuse_beacon: AtomicBool,
    delivered: Mutex<Vec<EventBatch>>,
    beacons: Mutex<Vec<EventBatch>>,
}

impl MockTransport {
    fn fail_next(&self, times: u32) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    fn delivered_sequences(&self) -> Vec<(String, Vec<u64>)> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|batch| {
                (
                    batch.session_id.clone(),
                    batch.events.iter().map(|e| e.sequence_number).collect(),
                )
            })
            .collect()
    }
}

impl EventTransport for MockTransport {
    async fn send_batch(&self, batch: EventBatch) -> Result<(), TransportError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Network("offline".to_string()));
        }
        self.delivered.lock().unwrap().push(batch);
        Ok(())
    }

    fn send_beacon(&self, batch: EventBatch) -> bool {
        if self.refuse_beacon.load(Ordering::SeqCst) {
            return false;
        }
        self.beacons.lock().unwrap().push(batch);
        true
    }
}

/// Transport whose batch sends wait for a release and then fail
#[derive(Default)]
struct GatedTransport {
    started: Notify,
    release: Notify,
    beacons: Mutex<Vec<EventBatch>>,
}

impl EventTransport for GatedTransport {
    async fn send_batch(&self, _batch: EventBatch) -> Result<(), TransportError> {
        self.started.notify_one();
        self.release.notified().await;
        Err(TransportError::Network("connection lost".to_string()))
    }

    fn send_beacon(&self, batch: EventBatch) -> bool {
        self.beacons.lock().unwrap().push(batch);
        true
    }
}

fn manual_policy() -> EventPolicy {
    EventPolicy {
        flush_interval_ms: 60_000,
        immediate_flush: false,
    }
}

fn ui(name: &str) -> EventKind {
    EventKind::UiEvent {
        name: name.to_string(),
        target: None,
    }
}

#[tokio::test]
async fn test_log_requires_initialize() {
    let logger = EventLogger::new(Arc::new(MockTransport::default()), manual_policy());
    assert!(matches!(logger.log_event(ui("click")), Err(LogError::NotInitialized)));
}

#[tokio::test]
async fn test_invalid_payload_is_rejected_at_log_time() {
    let logger = EventLogger::new(Arc::new(MockTransport::default()), manual_policy());
    logger.initialize("sess").await;

    let result = logger.log_event(EventKind::BackendDecision {
        check: "liveness".to_string(),
        passed: true,
        score: Some(1.5),
    });
    assert!(matches!(result, Err(LogError::Invalid(_))));
    assert!(matches!(logger.log_event(ui("  ")), Err(LogError::Invalid(_))));
    assert_eq!(logger.pending(), 0);

    // Rejected events do not consume sequence numbers
    assert_eq!(logger.log_event(ui("click")).unwrap(), 0);
}

#[tokio::test]
async fn test_failed_flush_requeues_in_order() {
    let transport = Arc::new(MockTransport::default());
    let logger = EventLogger::new(Arc::clone(&transport), manual_policy());
    logger.initialize("sess").await;

    assert_eq!(logger.log_event(ui("a")).unwrap(), 0);
    assert_eq!(logger.log_event(ui("b")).unwrap(), 1);

    transport.fail_next(1);
    assert!(logger.flush().await.is_err());
    assert_eq!(logger.pending(), 2);

    assert_eq!(logger.log_event(ui("c")).unwrap(), 2);
    assert_eq!(logger.flush().await.unwrap(), 3);
    assert_eq!(logger.pending(), 0);

    assert_eq!(
        transport.delivered_sequences(),
        vec![("sess".to_string(), vec![0, 1, 2])]
    );
    // Nothing left to send
    assert_eq!(logger.flush().await.unwrap(), 0);
}

#[tokio::test]
async fn test_switching_sessions_keeps_prior_events_under_their_own_id() {
    let transport = Arc::new(MockTransport::default());
    let logger = EventLogger::new(Arc::clone(&transport), manual_policy());
    logger.initialize("a").await;
    for name in ["x", "y", "z"] {
        logger.log_event(ui(name)).unwrap();
    }

    // Offline while switching: flush of "a" fails, its events stay queued
    transport.fail_next(1);
    logger.initialize("b").await;
    assert_eq!(logger.session_id().as_deref(), Some("b"));
    assert_eq!(logger.pending(), 3);

    assert_eq!(logger.log_event(ui("first")).unwrap(), 0);
    assert_eq!(logger.flush().await.unwrap(), 4);

    assert_eq!(
        transport.delivered_sequences(),
        vec![
            ("a".to_string(), vec![0, 1, 2]),
            ("b".to_string(), vec![0]),
        ]
    );
}

#[tokio::test]
async fn test_initialize_same_session_is_noop() {
    let transport = Arc::new(MockTransport::default());
    let logger = EventLogger::new(Arc::clone(&transport), manual_policy());
    logger.initialize("sess").await;
    logger.log_event(ui("a")).unwrap();

    logger.initialize("sess").await;
    assert_eq!(logger.log_event(ui("b")).unwrap(), 1);
    assert!(transport.delivered.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_teardown_restores_refused_events() {
    let transport = Arc::new(MockTransport::default());
    let logger = EventLogger::new(Arc::clone(&transport), manual_policy());
    logger.initialize("sess").await;
    logger.log_event(ui("a")).unwrap();
    logger
        .log_event(EventKind::SessionCompleted {
            outcome: session_capture::types::SessionOutcome::Abandoned,
        })
        .unwrap();

    transport.refuse_beacon.store(true, Ordering::SeqCst);
    assert!(!logger.teardown());
    assert_eq!(logger.pending(), 2);

    transport.refuse_beacon.store(false, Ordering::SeqCst);
    assert!(logger.teardown());
    assert_eq!(logger.pending(), 0);

    let beacons = transport.beacons.lock().unwrap();
    assert_eq!(beacons.len(), 1);
    let types: Vec<EventType> = beacons[0].events.iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![EventType::UiEvent, EventType::SessionCompleted]);
}

#[tokio::test]
async fn test_periodic_flush_delivers_without_explicit_flush() {
    let transport = Arc::new(MockTransport::default());
    let policy = EventPolicy {
        flush_interval_ms: 20,
        immediate_flush: false,
    };
    let logger = EventLogger::new(Arc::clone(&transport), policy);
    logger.initialize("sess").await;
    logger.start_periodic_flush();

    transport.fail_next(1);
    logger.log_event(ui("a")).unwrap();
    logger.log_event(ui("b")).unwrap();

    // First tick fails, a later one delivers
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(logger.pending(), 0);
    assert_eq!(
        transport.delivered_sequences(),
        vec![("sess".to_string(), vec![0, 1])]
    );

    assert_eq!(logger.shutdown().await.unwrap(), 0);
}

#[tokio::test]
async fn test_immediate_flush_sends_on_log() {
    let transport = Arc::new(MockTransport::default());
    let policy = EventPolicy {
        flush_interval_ms: 60_000,
        immediate_flush: true,
    };
    let logger = EventLogger::new(Arc::clone(&transport), policy);
    logger.initialize("sess").await;
    logger.log_event(ui("a")).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(logger.pending(), 0);
    assert_eq!(transport.delivered.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_teardown_includes_batches_still_in_flight() {
    let transport = Arc::new(GatedTransport::default());
    let logger = Arc::new(EventLogger::new(Arc::clone(&transport), manual_policy()));
    logger.initialize("sess").await;
    logger.log_event(ui("a")).unwrap();
    logger.log_event(ui("b")).unwrap();

    let flushing = {
        let logger = Arc::clone(&logger);
        tokio::spawn(async move { logger.flush().await })
    };
    transport.started.notified().await;
    logger.log_event(ui("c")).unwrap();

    assert!(logger.teardown());
    // The in-flight flush fails after teardown; nothing is requeued
    transport.release.notify_one();
    assert!(flushing.await.unwrap().is_err());
    assert_eq!(logger.pending(), 0);

    let beacons = transport.beacons.lock().unwrap();
    assert_eq!(beacons.len(), 1);
    let sequences: Vec<u64> = beacons[0].events.iter().map(|e| e.sequence_number).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
}
