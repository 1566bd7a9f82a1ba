//! The session worker — a long-lived consumer of stimuli.
//!
//! Stimuli arrive on one mpsc queue. Each session id gets its own lane (an
//! unbounded channel drained by a dedicated task), so turns for one session
//! run strictly one after another while different sessions proceed in
//! parallel. Every finished turn is handed to the answer sink once.
//!
//! A lane that sits idle hands its receiver back to the worker. The worker
//! closes it if nothing arrived in the meantime and restarts it otherwise,
//! so idle sessions hold no task and no map entry.

use chrono::Utc;
use cortex_core::event::{DomainEvent, EventBus};
use cortex_core::stimulus::{AnswerOutcome, AnswerSink, FinalAnswer, Stimulus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::strategy::StrategyLoop;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Counts since the worker was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: usize,
    pub completed: usize,
    pub duplicates: usize,
    pub errors: usize,
    /// Lanes currently open
    pub open_lanes: usize,
    pub lanes_opened: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicUsize,
    completed: AtomicUsize,
    duplicates: AtomicUsize,
    errors: AtomicUsize,
    open_lanes: AtomicUsize,
    lanes_opened: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            received: self.received.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            duplicates: self.duplicates.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            open_lanes: self.open_lanes.load(Ordering::SeqCst),
            lanes_opened: self.lanes_opened.load(Ordering::SeqCst),
        }
    }
}

/// (session id, stimulus id) pairs queued or in flight.
type Pending = Arc<Mutex<HashSet<(String, String)>>>;

type LaneReceiver = mpsc::UnboundedReceiver<Stimulus>;
type Lanes = HashMap<String, mpsc::UnboundedSender<Stimulus>>;

pub struct SessionWorker {
    strategy: Arc<StrategyLoop>,
    sink: Arc<dyn AnswerSink>,
    events: Option<Arc<EventBus>>,
    idle_timeout: Duration,
    counters: Arc<Counters>,
    pending: Pending,
}

impl SessionWorker {
    pub fn new(strategy: Arc<StrategyLoop>, sink: Arc<dyn AnswerSink>) -> Self {
        Self {
            strategy,
            sink,
            events: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            counters: Arc::default(),
            pending: Arc::default(),
        }
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// How long a session lane waits for its next stimulus before closing.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Consume `stimuli` until the sender side closes, then wait for every
    /// session lane to drain.
    pub async fn run(&self, mut stimuli: mpsc::Receiver<Stimulus>) -> WorkerStats {
        let mut lanes: Lanes = HashMap::new();
        let mut tasks: JoinSet<(String, LaneReceiver)> = JoinSet::new();

        info!(sink = %self.sink.name(), planner = %self.strategy.planner_name(), "Session worker started");

        loop {
            tokio::select! {
                received = stimuli.recv() => {
                    let Some(stimulus) = received else { break };
                    self.accept(stimulus, &mut lanes, &mut tasks).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.lane_finished(joined, &mut lanes, &mut tasks);
                }
            }
        }

        debug!(lanes = lanes.len(), "Stimulus queue closed, draining session lanes");
        lanes.clear();
        while let Some(joined) = tasks.join_next().await {
            self.lane_finished(joined, &mut lanes, &mut tasks);
        }

        let stats = self.stats();
        info!(
            received = stats.received,
            completed = stats.completed,
            duplicates = stats.duplicates,
            errors = stats.errors,
            "Session worker stopped"
        );
        stats
    }

    async fn accept(
        &self,
        stimulus: Stimulus,
        lanes: &mut Lanes,
        tasks: &mut JoinSet<(String, LaneReceiver)>,
    ) {
        self.counters.received.fetch_add(1, Ordering::SeqCst);
        let key = (stimulus.session_id.clone(), stimulus.stimulus_id.clone());
        if !self.pending.lock().await.insert(key) {
            debug!(
                session = %stimulus.session_id,
                stimulus = %stimulus.stimulus_id,
                "Duplicate stimulus already queued, dropping"
            );
            self.counters.duplicates.fetch_add(1, Ordering::SeqCst);
            self.publish(DomainEvent::DuplicateStimulus {
                session_id: stimulus.session_id,
                stimulus_id: stimulus.stimulus_id,
                timestamp: Utc::now(),
            });
            return;
        }

        self.publish(DomainEvent::StimulusReceived {
            session_id: stimulus.session_id.clone(),
            stimulus_id: stimulus.stimulus_id.clone(),
            timestamp: Utc::now(),
        });

        let stimulus = match lanes.get(&stimulus.session_id) {
            Some(lane) => match lane.send(stimulus) {
                Ok(()) => return,
                // the lane task died; start a fresh one below
                Err(mpsc::error::SendError(stimulus)) => {
                    lanes.remove(&stimulus.session_id);
                    stimulus
                }
            },
            None => stimulus,
        };

        debug!(session = %stimulus.session_id, "Opening session lane");
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = stimulus.session_id.clone();
        if tx.send(stimulus).is_ok() {
            self.counters.lanes_opened.fetch_add(1, Ordering::SeqCst);
            self.counters.open_lanes.fetch_add(1, Ordering::SeqCst);
            self.spawn_lane(tasks, session_id.clone(), rx);
            lanes.insert(session_id, tx);
        }
    }

    fn spawn_lane(&self, tasks: &mut JoinSet<(String, LaneReceiver)>, session_id: String, rx: LaneReceiver) {
        tasks.spawn(drive_session(
            self.strategy.clone(),
            self.sink.clone(),
            self.pending.clone(),
            self.counters.clone(),
            self.idle_timeout,
            session_id,
            rx,
        ));
    }

    /// A lane task returned. Nothing else sends to a lane while this runs,
    /// so an empty receiver means the lane can be closed for good.
    fn lane_finished(
        &self,
        joined: Result<(String, LaneReceiver), JoinError>,
        lanes: &mut Lanes,
        tasks: &mut JoinSet<(String, LaneReceiver)>,
    ) {
        let (session_id, rx) = match joined {
            Ok(finished) => finished,
            Err(e) => {
                error!(error = %e, "Session lane task failed");
                lanes.retain(|_, lane| !lane.is_closed());
                self.counters.open_lanes.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };
        if rx.is_empty() {
            lanes.remove(&session_id);
            self.counters.open_lanes.fetch_sub(1, Ordering::SeqCst);
            debug!(session = %session_id, "Session lane closed");
        } else {
            self.spawn_lane(tasks, session_id, rx);
        }
    }
}

/// Run turns for one session until the lane closes or stays idle for
/// `idle`; the receiver goes back to the worker.
async fn drive_session(
    strategy: Arc<StrategyLoop>,
    sink: Arc<dyn AnswerSink>,
    pending: Pending,
    counters: Arc<Counters>,
    idle: Duration,
    session_id: String,
    mut lane: LaneReceiver,
) -> (String, LaneReceiver) {
    while let Ok(Some(stimulus)) = tokio::time::timeout(idle, lane.recv()).await {
        let answer = match strategy.run_turn(&stimulus).await {
            Ok(report) if report.duplicate => {
                counters.duplicates.fetch_add(1, Ordering::SeqCst);
                None
            }
            Ok(report) => {
                counters.completed.fetch_add(1, Ordering::SeqCst);
                Some(report.to_final_answer())
            }
            Err(e) => {
                error!(
                    session = %stimulus.session_id,
                    stimulus = %stimulus.stimulus_id,
                    error = %e,
                    "Turn could not be recorded"
                );
                counters.errors.fetch_add(1, Ordering::SeqCst);
                Some(FinalAnswer {
                    session_id: stimulus.session_id.clone(),
                    stimulus_id: stimulus.stimulus_id.clone(),
                    outcome: AnswerOutcome::Failure(format!("internal error: {e}")),
                })
            }
        };

        if let Some(answer) = answer
            && let Err(e) = sink.deliver(answer).await
        {
            warn!(sink = %sink.name(), session = %stimulus.session_id, error = %e, "Answer delivery failed");
        }

        pending
            .lock()
            .await
            .remove(&(stimulus.session_id, stimulus.stimulus_id));
    }
    (session_id, lane)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedPlanner, StubDispatcher};
    use async_trait::async_trait;
    use cortex_core::error::ChannelError;
    use cortex_core::plan::{Plan, PlanStep};
    use cortex_memory::{InMemoryStorage, SessionStore};
    use serde_json::json;
    use std::time::Duration;

    struct CollectingSink {
        tx: mpsc::UnboundedSender<FinalAnswer>,
    }

    #[async_trait]
    impl AnswerSink for CollectingSink {
        fn name(&self) -> &str {
            "collect"
        }

        async fn deliver(&self, answer: FinalAnswer) -> Result<(), ChannelError> {
            self.tx.send(answer).map_err(|e| ChannelError::DeliveryFailed {
                sink: "collect".into(),
                reason: e.to_string(),
            })
        }
    }

    struct BrokenSink {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl AnswerSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn deliver(&self, _answer: FinalAnswer) -> Result<(), ChannelError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ChannelError::DeliveryFailed {
                sink: "broken".into(),
                reason: "endpoint down".into(),
            })
        }
    }

    fn echo_plan(text: &str) -> Plan {
        Plan::new(vec![PlanStep::call("s1", "echo").arg("text", json!(text)).into()])
    }

    fn strategy(plans: Vec<Plan>) -> (Arc<StrategyLoop>, Arc<StubDispatcher>) {
        let dispatcher = Arc::new(StubDispatcher::new());
        let store = SessionStore::new(Arc::new(InMemoryStorage::new()));
        let strategy = StrategyLoop::new(Arc::new(ScriptedPlanner::new(plans)), dispatcher.clone(), store);
        (Arc::new(strategy), dispatcher)
    }

    fn collecting() -> (Arc<CollectingSink>, mpsc::UnboundedReceiver<FinalAnswer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(CollectingSink { tx }), rx)
    }

    #[tokio::test]
    async fn answers_arrive_in_session_order() {
        let (strategy, _) = strategy(vec![echo_plan("first"), echo_plan("second")]);
        let (sink, mut answers) = collecting();
        let (tx, rx) = mpsc::channel(8);

        tx.send(Stimulus::with_id("1", "chat-1", "a")).await.unwrap();
        tx.send(Stimulus::with_id("2", "chat-1", "b")).await.unwrap();
        drop(tx);

        let stats = SessionWorker::new(strategy.clone(), sink).run(rx).await;
        assert_eq!(stats.completed, 2);

        let first = answers.recv().await.unwrap();
        let second = answers.recv().await.unwrap();
        assert_eq!((first.stimulus_id.as_str(), first.text()), ("1", "first"));
        assert_eq!((second.stimulus_id.as_str(), second.text()), ("2", "second"));

        let session = strategy.store().load("chat-1").await.unwrap();
        assert_eq!(session.turns.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_stimulus_produces_one_turn() {
        let (strategy, dispatcher) = strategy(vec![echo_plan("once"), echo_plan("twice")]);
        let (sink, mut answers) = collecting();
        let (tx, rx) = mpsc::channel(8);

        let stimulus = Stimulus::with_id("update-9", "chat-1", "hello");
        tx.send(stimulus.clone()).await.unwrap();
        tx.send(stimulus).await.unwrap();
        drop(tx);

        let stats = SessionWorker::new(strategy.clone(), sink).run(rx).await;
        assert_eq!(stats.received, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.duplicates, 1);

        assert_eq!(answers.recv().await.unwrap().text(), "once");
        assert!(answers.try_recv().is_err());
        assert_eq!(dispatcher.calls().len(), 1);
        assert_eq!(strategy.store().load("chat-1").await.unwrap().turns.len(), 1);
    }

    #[tokio::test]
    async fn redelivery_after_commit_is_not_answered_again() {
        let (strategy, _) = strategy(vec![echo_plan("once")]);
        let stimulus = Stimulus::with_id("update-3", "chat-1", "hello");
        strategy.run_turn(&stimulus).await.unwrap();

        let (sink, mut answers) = collecting();
        let (tx, rx) = mpsc::channel(8);
        tx.send(stimulus).await.unwrap();
        drop(tx);

        let stats = SessionWorker::new(strategy, sink).run(rx).await;
        assert_eq!(stats.duplicates, 1);
        assert!(answers.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_run_concurrently() {
        let (strategy, dispatcher) = strategy(vec![echo_plan("a"), echo_plan("b")]);
        dispatcher.set_delay(Duration::from_millis(100));
        let (sink, _answers) = collecting();
        let (tx, rx) = mpsc::channel(8);

        tx.send(Stimulus::new("chat-1", "x")).await.unwrap();
        tx.send(Stimulus::new("chat-2", "y")).await.unwrap();
        drop(tx);

        let stats = SessionWorker::new(strategy, sink).run(rx).await;
        assert_eq!(stats.completed, 2);
        assert_eq!(dispatcher.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_lanes_are_closed() {
        let (strategy, _) = strategy(vec![echo_plan("a"), echo_plan("b"), echo_plan("c")]);
        let (sink, mut answers) = collecting();
        let (tx, rx) = mpsc::channel(8);
        let worker = Arc::new(SessionWorker::new(strategy, sink).with_idle_timeout(Duration::from_secs(5)));
        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(rx).await })
        };

        tx.send(Stimulus::new("chat-1", "x")).await.unwrap();
        tx.send(Stimulus::new("chat-2", "y")).await.unwrap();
        answers.recv().await.unwrap();
        answers.recv().await.unwrap();
        assert_eq!(worker.stats().open_lanes, 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(worker.stats().open_lanes, 0);

        // a returning session gets a fresh lane
        tx.send(Stimulus::new("chat-1", "z")).await.unwrap();
        assert_eq!(answers.recv().await.unwrap().text(), "c");
        drop(tx);

        let stats = running.await.unwrap();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.lanes_opened, 3);
        assert_eq!(stats.open_lanes, 0);
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_the_worker() {
        let (strategy, _) = strategy(vec![echo_plan("a"), echo_plan("b")]);
        let sink = Arc::new(BrokenSink {
            attempts: AtomicUsize::new(0),
        });
        let events = Arc::new(EventBus::default());
        let mut rx_events = events.subscribe();
        let (tx, rx) = mpsc::channel(8);

        tx.send(Stimulus::new("chat-1", "x")).await.unwrap();
        tx.send(Stimulus::new("chat-1", "y")).await.unwrap();
        drop(tx);

        let stats = SessionWorker::new(strategy, sink.clone())
            .with_event_bus(events)
            .run(rx)
            .await;
        assert_eq!(stats.completed, 2);
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
        assert!(matches!(
            rx_events.recv().await.unwrap().as_ref(),
            DomainEvent::StimulusReceived { .. }
        ));
    }
}
