use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use funnel_inbound::{
    ConfigPatch, DebounceConfig, Error, FixedJitter, FlushPayload, FlushPhase, FlushReason,
    HistoryExtra, InboundEngine, InboundEvent, InboundText, Result, Role, SeenStatus, TurnHandler,
};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep, sleep_until, timeout};

/// What the handler saw, and when.
struct Turn {
    payload: FlushPayload,
    invoked_at: Instant,
}

/// Handler that records turns, optionally taking time or failing.
struct RecordingHandler {
    tx: mpsc::UnboundedSender<Turn>,
    work: Duration,
    fail_first: AtomicUsize,
    panic_first: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingHandler {
    fn new(work: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<Turn>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            tx,
            work,
            fail_first: AtomicUsize::new(0),
            panic_first: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        (handler, rx)
    }
}

#[async_trait]
impl TurnHandler for RecordingHandler {
    async fn on_flush_block(&self, payload: FlushPayload) -> Result<()> {
        let invoked_at = Instant::now();
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.work.is_zero() {
            sleep(self.work).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let _ = self.tx.send(Turn {
            payload,
            invoked_at,
        });

        if self
            .panic_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            panic!("reply engine exploded");
        }
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Handler("gateway timeout".into()));
        }
        Ok(())
    }
}

fn timing(debounce_ms: u64, max_wait_ms: u64, late_join_ms: u64) -> DebounceConfig {
    DebounceConfig::default().apply(&ConfigPatch {
        debounce_min_ms: Some(debounce_ms),
        debounce_max_ms: Some(debounce_ms),
        max_wait_ms: Some(max_wait_ms),
        late_join_ms: Some(late_join_ms),
        ..Default::default()
    })
}

fn engine(config: DebounceConfig, handler: &Arc<RecordingHandler>) -> InboundEngine {
    InboundEngine::with_jitter(config, handler.clone(), Arc::new(FixedJitter(0))).unwrap()
}

fn ms_since(start: Instant, at: Instant) -> u64 {
    at.duration_since(start).as_millis() as u64
}

async fn next_turn(rx: &mut mpsc::UnboundedReceiver<Turn>) -> Turn {
    timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("no turn flushed")
        .expect("handler dropped")
}

async fn assert_no_turn(rx: &mut mpsc::UnboundedReceiver<Turn>, within: Duration) {
    if let Ok(Some(turn)) = timeout(within, rx.recv()).await {
        panic!("unexpected turn: {:?}", turn.payload.texts());
    }
}

#[tokio::test(start_paused = true)]
async fn rapid_fragments_coalesce_into_one_turn() {
    let (handler, mut rx) = RecordingHandler::new(Duration::ZERO);
    let engine = engine(timing(50, 500, 0), &handler);
    let start = Instant::now();

    engine.enqueue_inbound_text(InboundText::new("5511", "a").with_id("m1"));
    sleep(Duration::from_millis(30)).await;
    engine.enqueue_inbound_text(InboundText::new("5511", "b").with_id("m2"));
    sleep(Duration::from_millis(30)).await;
    engine.enqueue_inbound_text(InboundText::new("5511", "c").with_id("m3"));

    let turn = next_turn(&mut rx).await;
    assert_eq!(turn.payload.texts(), vec!["a", "b", "c"]);
    assert_eq!(turn.payload.merged_text, "a\nb\nc");
    assert_eq!(turn.payload.reply_to.as_deref(), Some("m3"));
    assert_eq!(turn.payload.timing.reason, FlushReason::Debounce);
    let at = ms_since(start, turn.invoked_at);
    assert!((110..=115).contains(&at), "flushed at {}ms", at);

    assert_no_turn(&mut rx, Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn continuous_input_flushes_at_max_wait() {
    let (handler, mut rx) = RecordingHandler::new(Duration::ZERO);
    let engine = engine(timing(100, 150, 0), &handler);
    let start = Instant::now();

    let producer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                engine.enqueue_inbound_text(InboundText::new("5511", format!("x{}", i)));
                sleep(Duration::from_millis(80)).await;
            }
        })
    };

    let turn = next_turn(&mut rx).await;
    let at = ms_since(start, turn.invoked_at);
    assert!((150..=155).contains(&at), "first flush at {}ms", at);
    assert_eq!(turn.payload.texts(), vec!["x0", "x1"]);

    // Later bursts are bounded the same way.
    let turn = next_turn(&mut rx).await;
    assert!(turn.payload.timing.waited_ms <= 155);
    producer.abort();
}

#[tokio::test(start_paused = true)]
async fn one_turn_in_flight_per_key() {
    let (handler, mut rx) = RecordingHandler::new(Duration::from_millis(500));
    let engine = engine(timing(50, 1_000, 0), &handler);
    let mut events = engine.subscribe();

    engine.enqueue_inbound_text(InboundText::new("5511", "primeira"));
    sleep(Duration::from_millis(100)).await;
    // Handler is running (50ms..550ms).
    engine.enqueue_inbound_text(InboundText::new("5511", "segunda"));
    sleep(Duration::from_millis(100)).await;

    let snapshot = engine.snapshot("5511").unwrap();
    assert_eq!(snapshot.phase, FlushPhase::Invoking);
    assert!(snapshot.flush_requested);
    assert_eq!(snapshot.pending, 1);

    let first = next_turn(&mut rx).await;
    let second = next_turn(&mut rx).await;
    assert_eq!(first.payload.texts(), vec!["primeira"]);
    assert_eq!(second.payload.texts(), vec!["segunda"]);
    assert_eq!(second.payload.timing.reason, FlushReason::Rearm);
    assert!(second.invoked_at >= first.invoked_at + Duration::from_millis(500));
    assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 1);

    let mut deferred = false;
    let mut rearmed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            InboundEvent::FlushDeferred { .. } => deferred = true,
            InboundEvent::Rearmed { .. } => rearmed = true,
            _ => {}
        }
    }
    assert!(deferred, "timer firing during the turn should be deferred");
    assert!(rearmed);
}

#[tokio::test(start_paused = true)]
async fn fragments_during_failed_turn_are_not_lost() {
    let (handler, mut rx) = RecordingHandler::new(Duration::from_millis(200));
    handler.fail_first.store(1, Ordering::SeqCst);
    let engine = engine(timing(50, 1_000, 0), &handler);

    engine.enqueue_inbound_text(InboundText::new("5511", "oi"));
    sleep(Duration::from_millis(100)).await;
    engine.enqueue_inbound_text(InboundText::new("5511", "alguém aí?"));

    let first = next_turn(&mut rx).await;
    let second = next_turn(&mut rx).await;
    assert_eq!(first.payload.texts(), vec!["oi"]);
    assert_eq!(second.payload.texts(), vec!["alguém aí?"]);

    let snapshot = engine.snapshot("5511").unwrap();
    assert_eq!(snapshot.phase, FlushPhase::Idle);
    assert_eq!(snapshot.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_releases_the_key() {
    let (handler, mut rx) = RecordingHandler::new(Duration::ZERO);
    handler.panic_first.store(1, Ordering::SeqCst);
    let engine = engine(timing(50, 1_000, 0), &handler);
    let mut events = engine.subscribe();

    engine.enqueue_inbound_text(InboundText::new("5511", "um"));
    next_turn(&mut rx).await;
    // Let the flush path finish its bookkeeping.
    sleep(Duration::from_millis(1)).await;
    assert_eq!(engine.snapshot("5511").unwrap().phase, FlushPhase::Idle);

    engine.enqueue_inbound_text(InboundText::new("5511", "dois"));
    let turn = next_turn(&mut rx).await;
    assert_eq!(turn.payload.texts(), vec!["dois"]);

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if let InboundEvent::FlushFinished { ok: false, .. } = event {
            failures += 1;
        }
    }
    assert_eq!(failures, 1);
}

#[tokio::test(start_paused = true)]
async fn late_joiners_ride_along() {
    let (handler, mut rx) = RecordingHandler::new(Duration::ZERO);
    let engine = engine(timing(50, 1_000, 300), &handler);
    let start = Instant::now();

    engine.enqueue_inbound_text(InboundText::new("5511", "a"));
    // Debounce fires at 50ms, then waits out the late-join window until 350ms.
    sleep(Duration::from_millis(200)).await;
    engine.enqueue_inbound_text(InboundText::new("5511", "b"));

    let turn = next_turn(&mut rx).await;
    assert_eq!(turn.payload.texts(), vec!["a", "b"]);
    let at = ms_since(start, turn.invoked_at);
    assert!((350..=355).contains(&at), "flushed at {}ms", at);

    assert_no_turn(&mut rx, Duration::from_secs(5)).await;
}

/// Flushes scheduled after a turn completes skip the late-join window, unlike
/// timer-driven ones. This asymmetry is intentional.
#[tokio::test(start_paused = true)]
async fn rearmed_flush_skips_late_join() {
    let (handler, mut rx) = RecordingHandler::new(Duration::from_millis(200));
    let engine = engine(timing(50, 1_000, 300), &handler);
    let start = Instant::now();

    // Turn 1: debounce at 50ms, late join until 350ms, handler 350..550ms.
    engine.enqueue_inbound_text(InboundText::new("5511", "a"));
    sleep(Duration::from_millis(400)).await;
    engine.enqueue_inbound_text(InboundText::new("5511", "b"));

    let first = next_turn(&mut rx).await;
    let at = ms_since(start, first.invoked_at);
    assert!((350..=355).contains(&at), "first turn at {}ms", at);

    // Rearmed at 550ms with a 50ms debounce and no late join.
    let second = next_turn(&mut rx).await;
    assert_eq!(second.payload.texts(), vec!["b"]);
    assert_eq!(second.payload.timing.reason, FlushReason::Rearm);
    let at = ms_since(start, second.invoked_at);
    assert!((600..=605).contains(&at), "rearmed flush at {}ms", at);
}

#[tokio::test(start_paused = true)]
async fn conversations_flush_independently() {
    let (handler, mut rx) = RecordingHandler::new(Duration::from_millis(1_000));
    let engine = engine(timing(50, 500, 0), &handler);
    let start = Instant::now();

    engine.enqueue_inbound_text(InboundText::new("5511", "from A"));
    sleep(Duration::from_millis(100)).await;
    engine.enqueue_inbound_text(InboundText::new("5522", "from B"));

    let a = next_turn(&mut rx).await;
    let b = next_turn(&mut rx).await;
    assert_eq!(a.payload.key, "5511");
    assert_eq!(b.payload.key, "5522");
    // B started while A's slow turn was still running.
    let at = ms_since(start, b.invoked_at);
    assert!((150..=155).contains(&at), "B flushed at {}ms", at);
    assert_eq!(handler.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn dedup_expires_after_ttl() {
    let (handler, _rx) = RecordingHandler::new(Duration::ZERO);
    let config = DebounceConfig::default().apply(&ConfigPatch {
        dedup_ttl_ms: Some(1_000),
        ..Default::default()
    });
    let engine = engine(config, &handler);

    assert!(!engine.mark_inbound_seen("5511", "wamid.1").is_duplicate());
    assert!(engine.mark_inbound_seen("5511", "wamid.1").is_duplicate());

    tokio::time::advance(Duration::from_millis(1_001)).await;
    let status = engine.mark_inbound_seen("5511", "wamid.1");
    assert!(status.ok());
    assert!(!status.is_duplicate());
}

#[tokio::test(start_paused = true)]
async fn dedup_evicts_oldest_first() {
    let (handler, _rx) = RecordingHandler::new(Duration::ZERO);
    let config = DebounceConfig::default().apply(&ConfigPatch {
        dedup_max_entries: Some(3),
        ..Default::default()
    });
    let engine = engine(config, &handler);

    for id in ["m1", "m2", "m3", "m4"] {
        assert_eq!(engine.mark_inbound_seen("5511", id), SeenStatus::Fresh);
        tokio::time::advance(Duration::from_millis(1)).await;
    }
    assert_eq!(engine.mark_inbound_seen("5511", "m4"), SeenStatus::Duplicate);
    assert_eq!(engine.mark_inbound_seen("5511", "m1"), SeenStatus::Fresh);
}

#[tokio::test(start_paused = true)]
async fn config_updates_apply_to_next_decision_only() {
    let (handler, mut rx) = RecordingHandler::new(Duration::ZERO);
    let engine = engine(timing(500, 5_000, 0), &handler);
    let start = Instant::now();

    engine.enqueue_inbound_text(InboundText::new("5511", "a"));
    sleep(Duration::from_millis(10)).await;
    engine.update_config(&ConfigPatch {
        debounce_min_ms: Some(50),
        debounce_max_ms: Some(50),
        ..Default::default()
    });

    // The armed timer keeps its 500ms delay.
    let first = next_turn(&mut rx).await;
    let at = ms_since(start, first.invoked_at);
    assert!((500..=505).contains(&at), "first turn at {}ms", at);

    let resumed = Instant::now();
    engine.enqueue_inbound_text(InboundText::new("5511", "b"));
    let second = next_turn(&mut rx).await;
    let at = ms_since(resumed, second.invoked_at);
    assert!((50..=55).contains(&at), "second turn after {}ms", at);
}

#[tokio::test(start_paused = true)]
async fn short_state_ttl_never_drops_accepted_fragments() {
    let (handler, mut rx) = RecordingHandler::new(Duration::ZERO);
    let config = DebounceConfig::default().apply(&ConfigPatch {
        debounce_min_ms: Some(5_000),
        debounce_max_ms: Some(5_000),
        max_wait_ms: Some(10_000),
        late_join_ms: Some(350),
        state_ttl_ms: Some(1_000),
        sweep_interval_ms: Some(500),
        ..Default::default()
    });
    // Raised so a record outlives its longest burst.
    assert_eq!(config.state_ttl, Duration::from_millis(15_350));
    let engine = engine(config, &handler);
    let start = Instant::now();

    engine.enqueue_inbound_text(InboundText::new("5511", "quero comprar"));
    sleep(Duration::from_secs(30)).await;

    let turn = next_turn(&mut rx).await;
    assert_eq!(turn.payload.texts(), vec!["quero comprar"]);
    let at = ms_since(start, turn.invoked_at);
    assert!((5_350..=5_355).contains(&at), "flushed at {}ms", at);
}

#[tokio::test(start_paused = true)]
async fn expired_conversations_are_swept_once_idle() {
    let (handler, mut rx) = RecordingHandler::new(Duration::ZERO);
    let config = DebounceConfig::default().apply(&ConfigPatch {
        debounce_min_ms: Some(5_000),
        debounce_max_ms: Some(5_000),
        max_wait_ms: Some(10_000),
        late_join_ms: Some(350),
        sweep_interval_ms: Some(500),
        state_ttl_ms: Some(1_000),
        ..Default::default()
    });
    let engine = engine(config, &handler);
    let mut events = engine.subscribe();
    let start = Instant::now();

    // "idle" is last touched at 0ms and expires at 15_350ms. "pensando" is
    // touched again when its debounce fires at 5_000ms and expires at 20_350ms.
    engine.push_history("idle", Role::User, "oi", HistoryExtra::default());
    engine.enqueue_inbound_text(InboundText::new("pensando", "vou pensar"));

    let turn = next_turn(&mut rx).await;
    assert_eq!(turn.payload.texts(), vec!["vou pensar"]);

    sleep_until(start + Duration::from_millis(16_000)).await;
    assert_eq!(engine.conversations(), vec!["pensando".to_string()]);

    sleep(Duration::from_secs(5)).await;
    assert!(engine.conversations().is_empty());

    let mut swept = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let InboundEvent::Swept { key, history_len } = event {
            swept.push((key, history_len));
        }
    }
    assert_eq!(
        swept,
        vec![("idle".to_string(), 1), ("pensando".to_string(), 0)]
    );

    assert_no_turn(&mut rx, Duration::from_secs(20)).await;
}

#[tokio::test(start_paused = true)]
async fn flush_during_late_join_is_folded_into_running_flush() {
    let (handler, mut rx) = RecordingHandler::new(Duration::ZERO);
    // Debounce fires at 50ms and waits until 350ms; max-wait fires at 60ms,
    // in the middle of that wait.
    let engine = engine(timing(50, 60, 300), &handler);
    let mut events = engine.subscribe();

    engine.enqueue_inbound_text(InboundText::new("5511", "a"));
    sleep(Duration::from_millis(100)).await;

    let snapshot = engine.snapshot("5511").unwrap();
    assert_eq!(snapshot.phase, FlushPhase::Draining);
    assert!(snapshot.flush_requested);

    let turn = next_turn(&mut rx).await;
    assert_eq!(turn.payload.texts(), vec!["a"]);
    assert_eq!(turn.payload.timing.reason, FlushReason::Debounce);
    assert_no_turn(&mut rx, Duration::from_secs(5)).await;

    let mut deferred = Vec::new();
    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            InboundEvent::FlushDeferred { reason, .. } => deferred.push(reason),
            InboundEvent::FlushStarted { reason, .. } => started.push(reason),
            InboundEvent::Rearmed { .. } => panic!("request should be consumed by the batch"),
            _ => {}
        }
    }
    assert_eq!(deferred, vec![FlushReason::MaxWait]);
    assert_eq!(started, vec![FlushReason::Debounce]);

    let snapshot = engine.snapshot("5511").unwrap();
    assert_eq!(snapshot.phase, FlushPhase::Idle);
    assert!(!snapshot.flush_requested);
}

#[tokio::test(start_paused = true)]
async fn burst_id_is_shared_within_a_burst_and_advances_after_flush() {
    let (handler, mut rx) = RecordingHandler::new(Duration::ZERO);
    let engine = engine(timing(50, 500, 0), &handler);

    engine.enqueue_inbound_text(InboundText::new("5511", "a"));
    assert_eq!(engine.snapshot("5511").unwrap().burst_id, 1);
    sleep(Duration::from_millis(20)).await;
    engine.enqueue_inbound_text(InboundText::new("5511", "b"));
    assert_eq!(engine.snapshot("5511").unwrap().burst_id, 1);

    let first = next_turn(&mut rx).await;
    assert_eq!(first.payload.burst_id, 1);
    assert_eq!(first.payload.texts(), vec!["a", "b"]);

    engine.enqueue_inbound_text(InboundText::new("5511", "c"));
    assert_eq!(engine.snapshot("5511").unwrap().burst_id, 2);
    let second = next_turn(&mut rx).await;
    assert_eq!(second.payload.burst_id, 2);
    assert_eq!(second.payload.texts(), vec!["c"]);
}

#[tokio::test(start_paused = true)]
async fn payload_carries_history_and_channel() {
    let (handler, mut rx) = RecordingHandler::new(Duration::ZERO);
    let engine = engine(timing(50, 500, 0), &handler);

    engine.push_history("5511", Role::Assistant, "Oi! Quer conhecer o curso?", HistoryExtra::default());
    for (id, text) in [("m1", "quero"), ("m2", "quanto é?")] {
        engine.push_history(
            "5511",
            Role::User,
            text,
            HistoryExtra {
                external_id: Some(id.into()),
                metadata: None,
            },
        );
        engine.enqueue_inbound_text(
            InboundText::new("5511", text)
                .with_id(id)
                .with_channel("whatsapp"),
        );
    }

    let turn = next_turn(&mut rx).await;
    assert_eq!(turn.payload.history, "[Assistant]: Oi! Quer conhecer o curso?");
    assert_eq!(turn.payload.channel_hint.as_deref(), Some("whatsapp"));
    assert_eq!(turn.payload.last_text, "quanto é?");
    assert_eq!(turn.payload.items.len(), 2);
    assert_eq!(turn.payload.items[0].id.as_deref(), Some("m1"));
    assert_eq!(turn.payload.burst_id, 1);
}
