//! Sequential FIFO executor for actions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Action, ActionId, Completion};

/// Commands delivered to the processor's driver task.
pub(crate) enum Message {
    Enqueue { id: ActionId, action: Box<dyn Action> },
    Start,
    Stop,
    Finished { id: ActionId, success: bool },
}

/// Lifecycle notifications published by a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    /// An action was added to the queue.
    Enqueued { id: ActionId, name: String },
    /// Processing began from an idle state.
    Started,
    /// An action is about to be performed.
    Starting { id: ActionId, name: String },
    /// An action completed.
    Finished {
        id: ActionId,
        name: String,
        success: bool,
    },
    /// The queue drained and the processor is idle.
    Done,
    /// Processing was stopped and the queue discarded.
    Stopped,
}

/// Processor tuning.
#[derive(Debug, Clone, Default)]
pub struct ProcessorConfig {
    /// Terminate and fail any action running longer than this.
    pub action_timeout: Option<Duration>,
    /// Discard the rest of the queue when an action fails.
    pub halt_on_failure: bool,
}

struct Shared {
    next_id: AtomicU64,
    queued: AtomicUsize,
    completed: AtomicUsize,
    /// `Start` and `Stop` messages sent but not yet handled by the driver.
    pending_starts: AtomicUsize,
    pending_stops: AtomicUsize,
    current: Mutex<Option<String>>,
    processing: watch::Sender<bool>,
}

impl Shared {
    fn set_current(&self, name: Option<String>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = name;
    }
}

/// Runs enqueued actions one at a time, in order.
///
/// Cloning yields another handle to the same queue. The driver task exits
/// once every handle is dropped.
#[derive(Clone)]
pub struct ActionProcessor {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
}

impl ActionProcessor {
    /// Create a processor with default settings. Must be called inside a
    /// Tokio runtime.
    pub fn new() -> Self {
        Self::spawn(ProcessorConfig::default(), None)
    }

    pub fn with_config(config: ProcessorConfig) -> Self {
        Self::spawn(config, None)
    }

    /// Create a processor that publishes [`ProcessorEvent`]s on the returned
    /// channel.
    pub fn with_events(
        config: ProcessorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ProcessorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (Self::spawn(config, Some(events_tx)), events_rx)
    }

    fn spawn(config: ProcessorConfig, events: Option<mpsc::UnboundedSender<ProcessorEvent>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (processing, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            queued: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            pending_starts: AtomicUsize::new(0),
            pending_stops: AtomicUsize::new(0),
            current: Mutex::new(None),
            processing,
        });

        let driver = Driver {
            rx,
            tx: tx.downgrade(),
            shared: Arc::clone(&shared),
            events,
            config,
            queue: VecDeque::new(),
            current: None,
        };
        tokio::spawn(driver.run());

        Self { tx, shared }
    }

    /// Append an action to the queue. Does not start processing.
    pub fn enqueue(&self, action: Box<dyn Action>) -> ActionId {
        enqueue_on(&self.tx, &self.shared, action)
    }

    /// Begin processing if there is queued work. Idempotent.
    pub fn start(&self) {
        if self.shared.queued.load(Ordering::SeqCst) == 0 {
            return;
        }
        self.shared.pending_starts.fetch_add(1, Ordering::SeqCst);
        self.shared.processing.send_replace(true);
        if self.tx.send(Message::Start).is_err() {
            self.shared.pending_starts.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Terminate the current action, discard the queue and go idle.
    pub fn stop(&self) {
        self.shared.pending_stops.fetch_add(1, Ordering::SeqCst);
        self.shared.processing.send_replace(false);
        if self.tx.send(Message::Stop).is_err() {
            self.shared.pending_stops.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn is_processing(&self) -> bool {
        *self.shared.processing.borrow()
    }

    /// Number of actions that have finished, successfully or not.
    pub fn actions_completed(&self) -> usize {
        self.shared.completed.load(Ordering::SeqCst)
    }

    /// Number of actions waiting in the queue, excluding the current one.
    pub fn queued_count(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Name of the action currently being performed.
    pub fn current_action(&self) -> Option<String> {
        self.shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve once the processor is no longer processing.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.shared.processing.subscribe();
        let _ = rx.wait_for(|processing| !processing).await;
    }

    /// A non-owning handle that lets actions enqueue follow-up work.
    pub fn handle(&self) -> ProcessorHandle {
        ProcessorHandle {
            tx: self.tx.downgrade(),
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Default for ActionProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionProcessor")
            .field("processing", &self.is_processing())
            .field("queued", &self.queued_count())
            .field("completed", &self.actions_completed())
            .finish()
    }
}

/// Weak reference to a processor's queue.
#[derive(Clone)]
pub struct ProcessorHandle {
    tx: mpsc::WeakUnboundedSender<Message>,
    shared: Weak<Shared>,
}

impl ProcessorHandle {
    /// Enqueue an action if the processor is still alive.
    pub fn enqueue(&self, action: Box<dyn Action>) -> Option<ActionId> {
        let tx = self.tx.upgrade()?;
        let shared = self.shared.upgrade()?;
        Some(enqueue_on(&tx, &shared, action))
    }

    pub fn upgrade(&self) -> Option<ActionProcessor> {
        Some(ActionProcessor {
            tx: self.tx.upgrade()?,
            shared: self.shared.upgrade()?,
        })
    }
}

fn enqueue_on(tx: &mpsc::UnboundedSender<Message>, shared: &Shared, action: Box<dyn Action>) -> ActionId {
    let id = ActionId(shared.next_id.fetch_add(1, Ordering::SeqCst));
    shared.queued.fetch_add(1, Ordering::SeqCst);
    if tx.send(Message::Enqueue { id, action }).is_err() {
        shared.queued.fetch_sub(1, Ordering::SeqCst);
        warn!(action = %id, "Processor driver has exited, dropping action");
    }
    id
}

struct Queued {
    id: ActionId,
    action: Box<dyn Action>,
}

struct Running {
    id: ActionId,
    name: String,
    action: Box<dyn Action>,
    deadline: Option<Instant>,
}

/// Owns the queue and the current action. Every state change happens here.
struct Driver {
    rx: mpsc::UnboundedReceiver<Message>,
    tx: mpsc::WeakUnboundedSender<Message>,
    shared: Arc<Shared>,
    events: Option<mpsc::UnboundedSender<ProcessorEvent>>,
    config: ProcessorConfig,
    queue: VecDeque<Queued>,
    current: Option<Running>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let deadline = self.current.as_ref().and_then(|running| running.deadline);
            let message = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        message = self.rx.recv() => message,
                        _ = tokio::time::sleep_until(deadline) => {
                            self.expire_current();
                            continue;
                        }
                    }
                }
                None => self.rx.recv().await,
            };

            match message {
                Some(Message::Enqueue { id, action }) => self.handle_enqueue(id, action),
                Some(Message::Start) => self.handle_start(),
                Some(Message::Stop) => self.handle_stop(),
                Some(Message::Finished { id, success }) => self.handle_finished(id, success),
                None => break,
            }
        }

        debug!("Action processor released");
    }

    fn emit(&self, event: ProcessorEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn handle_enqueue(&mut self, id: ActionId, action: Box<dyn Action>) {
        let name = action.name().to_string();
        debug!(action = %name, %id, "Enqueued action");
        self.queue.push_back(Queued { id, action });
        self.emit(ProcessorEvent::Enqueued { id, name });
    }

    fn handle_start(&mut self) {
        self.shared.pending_starts.fetch_sub(1, Ordering::SeqCst);
        if self.current.is_some() {
            return;
        }
        if self.queue.is_empty() {
            if self.shared.pending_starts.load(Ordering::SeqCst) == 0 {
                self.shared.processing.send_replace(false);
            }
            return;
        }
        self.emit(ProcessorEvent::Started);
        self.start_next();
    }

    fn start_next(&mut self) {
        let Some(Queued { id, mut action }) = self.queue.pop_front() else {
            self.go_idle();
            return;
        };
        self.shared.queued.fetch_sub(1, Ordering::SeqCst);

        let Some(tx) = self.tx.upgrade() else {
            debug!(action = %id, "Processor handles dropped, abandoning queue");
            self.discard_queue();
            self.go_idle();
            return;
        };

        let name = action.name().to_string();
        self.shared.set_current(Some(name.clone()));
        self.shared.processing.send_replace(true);
        self.emit(ProcessorEvent::Starting {
            id,
            name: name.clone(),
        });
        debug!(action = %name, %id, "Starting action");

        action.perform(Completion::for_processor(id, tx));

        self.current = Some(Running {
            id,
            name,
            action,
            deadline: self.config.action_timeout.map(|timeout| Instant::now() + timeout),
        });
    }

    fn handle_finished(&mut self, id: ActionId, success: bool) {
        match self.current.take() {
            Some(running) if running.id == id => {
                // Release the action before moving on; its pipes stay shared.
                let Running { id, name, .. } = running;
                self.complete(id, name, success);
            }
            other => {
                self.current = other;
                debug!(action = %id, "Ignoring completion from detached action");
            }
        }
    }

    fn complete(&mut self, id: ActionId, name: String, success: bool) {
        self.shared.completed.fetch_add(1, Ordering::SeqCst);
        self.shared.set_current(None);
        debug!(action = %name, %id, success, "Action finished");
        self.emit(ProcessorEvent::Finished { id, name: name.clone(), success });

        if !success && self.config.halt_on_failure {
            self.discard_queue();
            self.shared.processing.send_replace(false);
            self.emit(ProcessorEvent::Stopped);
            return;
        }

        // A queued stop owns the transition to idle and reports `Stopped`.
        if self.shared.pending_stops.load(Ordering::SeqCst) > 0 {
            debug!(action = %name, %id, "Stop pending, not continuing");
            return;
        }
        if self.queue.is_empty() {
            self.go_idle();
        } else {
            self.start_next();
        }
    }

    fn handle_stop(&mut self) {
        self.shared.pending_stops.fetch_sub(1, Ordering::SeqCst);
        if let Some(mut running) = self.current.take() {
            info!(action = %running.name, id = %running.id, "Terminating action");
            running.action.terminate();
        }
        self.discard_queue();
        self.shared.set_current(None);
        if self.shared.pending_starts.load(Ordering::SeqCst) == 0 {
            self.shared.processing.send_replace(false);
        }
        self.emit(ProcessorEvent::Stopped);
    }

    fn expire_current(&mut self) {
        if let Some(mut running) = self.current.take() {
            warn!(action = %running.name, id = %running.id, "Action timed out, terminating");
            running.action.terminate();
            let Running { id, name, .. } = running;
            self.complete(id, name, false);
        }
    }

    fn discard_queue(&mut self) {
        let discarded = self.queue.len();
        self.queue.clear();
        self.shared.queued.fetch_sub(discarded, Ordering::SeqCst);
        if discarded > 0 {
            debug!(discarded, "Discarded queued actions");
        }
    }

    fn go_idle(&mut self) {
        self.shared.set_current(None);
        self.shared.processing.send_replace(false);
        self.emit(ProcessorEvent::Done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{bond, ActionPipes, PipeContents};
    use crate::testing::{ActionLog, TestAction, TestBehavior};

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ProcessorEvent>) -> ProcessorEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<ProcessorEvent>, mut matches: F) -> Vec<ProcessorEvent>
    where
        F: FnMut(&ProcessorEvent) -> bool,
    {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let hit = matches(&event);
            seen.push(event);
            if hit {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_runs_actions_in_fifo_order_one_at_a_time() {
        let log = ActionLog::new();
        let (processor, mut events) = ActionProcessor::with_events(ProcessorConfig::default());

        for name in ["a", "b", "c"] {
            processor.enqueue(Box::new(TestAction::new(
                name,
                TestBehavior::SucceedAfter(Duration::from_millis(10)),
                log.clone(),
            )));
        }
        assert_eq!(processor.queued_count(), 3);
        processor.start();

        wait_for(&mut events, |e| *e == ProcessorEvent::Done).await;

        assert_eq!(log.started(), vec!["a", "b", "c"]);
        assert_eq!(log.finished(), vec![("a".to_string(), true), ("b".to_string(), true), ("c".to_string(), true)]);
        assert_eq!(log.max_concurrent(), 1);
        assert_eq!(processor.actions_completed(), 3);
        assert_eq!(processor.queued_count(), 0);
        assert!(!processor.is_processing());
    }

    #[tokio::test]
    async fn test_failure_does_not_halt_queue() {
        let log = ActionLog::new();
        let (processor, mut events) = ActionProcessor::with_events(ProcessorConfig::default());

        processor.enqueue(Box::new(TestAction::new("bad", TestBehavior::Fail, log.clone())));
        processor.enqueue(Box::new(TestAction::new("good", TestBehavior::Succeed, log.clone())));
        processor.start();

        let seen = wait_for(&mut events, |e| *e == ProcessorEvent::Done).await;

        let outcomes: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                ProcessorEvent::Finished { name, success, .. } => Some((name.as_str(), *success)),
                _ => None,
            })
            .collect();
        assert_eq!(outcomes, vec![("bad", false), ("good", true)]);
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let log = ActionLog::new();
        let (processor, mut events) = ActionProcessor::with_events(ProcessorConfig::default());

        let id = processor.enqueue(Box::new(TestAction::new("only", TestBehavior::Succeed, log)));
        processor.start();

        let seen = wait_for(&mut events, |e| *e == ProcessorEvent::Done).await;
        assert_eq!(
            seen,
            vec![
                ProcessorEvent::Enqueued { id, name: "only".into() },
                ProcessorEvent::Started,
                ProcessorEvent::Starting { id, name: "only".into() },
                ProcessorEvent::Finished {
                    id,
                    name: "only".into(),
                    success: true
                },
                ProcessorEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_start_without_work_is_noop() {
        let processor = ActionProcessor::new();
        processor.start();
        assert!(!processor.is_processing());
        processor.wait_until_idle().await;
    }

    #[tokio::test]
    async fn test_pipes_carry_output_downstream() {
        let log = ActionLog::new();
        let processor = ActionProcessor::new();

        let mut producer = TestAction::new("producer", TestBehavior::Succeed, log.clone())
            .with_output(PipeContents::Count(42));
        let mut consumer = TestAction::new("consumer", TestBehavior::Succeed, log.clone());
        bond(&mut producer, &mut consumer);

        processor.enqueue(Box::new(producer));
        processor.enqueue(Box::new(consumer));
        processor.start();
        processor.wait_until_idle().await;

        assert_eq!(log.inputs_seen("consumer"), vec![Some(PipeContents::Count(42))]);
    }

    #[tokio::test]
    async fn test_enqueue_during_processing_runs_after_current() {
        let log = ActionLog::new();
        let (processor, mut events) = ActionProcessor::with_events(ProcessorConfig::default());

        let x = TestAction::new("x", TestBehavior::Succeed, log.clone());
        let a = TestAction::new("a", TestBehavior::Succeed, log.clone())
            .enqueue_on_perform(processor.handle(), Box::new(x));
        let b = TestAction::new("b", TestBehavior::Succeed, log.clone());

        processor.enqueue(Box::new(a));
        processor.enqueue(Box::new(b));
        processor.start();

        wait_for(&mut events, |e| *e == ProcessorEvent::Done).await;

        assert_eq!(log.started(), vec!["a", "b", "x"]);
        assert_eq!(processor.actions_completed(), 3);
    }

    #[tokio::test]
    async fn test_stop_terminates_current_and_clears_queue() {
        let log = ActionLog::new();
        let (processor, mut events) = ActionProcessor::with_events(ProcessorConfig::default());

        processor.enqueue(Box::new(TestAction::new("hang", TestBehavior::Hang, log.clone())));
        processor.enqueue(Box::new(TestAction::new("never", TestBehavior::Succeed, log.clone())));
        processor.start();

        wait_for(&mut events, |e| matches!(e, ProcessorEvent::Starting { .. })).await;
        processor.stop();
        assert!(!processor.is_processing());

        wait_for(&mut events, |e| *e == ProcessorEvent::Stopped).await;

        assert_eq!(log.terminated(), vec!["hang"]);
        assert_eq!(log.started(), vec!["hang"]);
        assert_eq!(processor.queued_count(), 0);
        assert_eq!(processor.current_action(), None);
        // The terminated action's completion arrives late and is ignored.
        assert_eq!(processor.actions_completed(), 0);
    }

    /// Hands its completion to the test instead of finishing on its own.
    struct HeldAction {
        pipes: ActionPipes,
        completion: Arc<Mutex<Option<Completion>>>,
    }

    impl Action for HeldAction {
        fn name(&self) -> &str {
            "held"
        }

        fn pipes(&self) -> &ActionPipes {
            &self.pipes
        }

        fn pipes_mut(&mut self) -> &mut ActionPipes {
            &mut self.pipes
        }

        fn perform(&mut self, completion: Completion) {
            *self.completion.lock().unwrap() = Some(completion);
        }
    }

    #[tokio::test]
    async fn test_stop_racing_completion_reports_only_stopped() {
        let held = Arc::new(Mutex::new(None));
        let (processor, mut events) = ActionProcessor::with_events(ProcessorConfig::default());
        processor.enqueue(Box::new(HeldAction {
            pipes: ActionPipes::default(),
            completion: Arc::clone(&held),
        }));
        processor.start();
        wait_for(&mut events, |e| matches!(e, ProcessorEvent::Starting { .. })).await;

        // The completion reaches the driver ahead of the stop.
        let completion = held.lock().unwrap().take().expect("action was not performed");
        completion.finish(true);
        processor.stop();

        let seen = wait_for(&mut events, |e| *e == ProcessorEvent::Stopped).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!seen.contains(&ProcessorEvent::Done));
        assert!(events.try_recv().is_err());
        assert!(!processor.is_processing());
    }

    #[tokio::test]
    async fn test_start_right_after_stop_keeps_processing() {
        let log = ActionLog::new();
        let (processor, mut events) = ActionProcessor::with_events(ProcessorConfig::default());

        processor.enqueue(Box::new(TestAction::new("first", TestBehavior::Hang, log.clone())));
        processor.start();
        wait_for(&mut events, |e| matches!(e, ProcessorEvent::Starting { .. })).await;

        processor.stop();
        processor.enqueue(Box::new(TestAction::new(
            "second",
            TestBehavior::SucceedAfter(Duration::from_millis(50)),
            log.clone(),
        )));
        processor.start();
        assert!(processor.is_processing());

        wait_for(&mut events, |e| *e == ProcessorEvent::Stopped).await;
        assert!(processor.is_processing());

        wait_for(&mut events, |e| *e == ProcessorEvent::Done).await;
        assert!(!processor.is_processing());
        assert_eq!(log.terminated(), vec!["first"]);
        assert_eq!(log.finished(), vec![("second".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_processor_reusable_after_stop() {
        let log = ActionLog::new();
        let (processor, mut events) = ActionProcessor::with_events(ProcessorConfig::default());

        processor.enqueue(Box::new(TestAction::new("hang", TestBehavior::Hang, log.clone())));
        processor.start();
        wait_for(&mut events, |e| matches!(e, ProcessorEvent::Starting { .. })).await;
        processor.stop();
        wait_for(&mut events, |e| *e == ProcessorEvent::Stopped).await;

        processor.enqueue(Box::new(TestAction::new("again", TestBehavior::Succeed, log.clone())));
        processor.start();
        wait_for(&mut events, |e| *e == ProcessorEvent::Done).await;

        assert_eq!(log.finished().last(), Some(&("again".to_string(), true)));
    }

    #[tokio::test]
    async fn test_action_timeout_fails_and_continues() {
        let log = ActionLog::new();
        let config = ProcessorConfig {
            action_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let (processor, mut events) = ActionProcessor::with_events(config);

        processor.enqueue(Box::new(TestAction::new("slow", TestBehavior::Hang, log.clone())));
        processor.enqueue(Box::new(TestAction::new("fast", TestBehavior::Succeed, log.clone())));
        processor.start();

        let seen = wait_for(&mut events, |e| *e == ProcessorEvent::Done).await;

        assert!(seen.iter().any(|e| matches!(
            e,
            ProcessorEvent::Finished { name, success: false, .. } if name == "slow"
        )));
        assert_eq!(log.terminated(), vec!["slow"]);
        assert_eq!(log.started(), vec!["slow", "fast"]);
        assert_eq!(processor.actions_completed(), 2);
    }

    #[tokio::test]
    async fn test_halt_on_failure_discards_remaining() {
        let log = ActionLog::new();
        let config = ProcessorConfig {
            halt_on_failure: true,
            ..Default::default()
        };
        let (processor, mut events) = ActionProcessor::with_events(config);

        processor.enqueue(Box::new(TestAction::new("bad", TestBehavior::Fail, log.clone())));
        processor.enqueue(Box::new(TestAction::new("skipped", TestBehavior::Succeed, log.clone())));
        processor.start();

        wait_for(&mut events, |e| *e == ProcessorEvent::Stopped).await;

        assert_eq!(log.started(), vec!["bad"]);
        assert_eq!(processor.queued_count(), 0);
        assert!(!processor.is_processing());
    }

    #[tokio::test]
    async fn test_handle_does_not_keep_processor_alive() {
        let processor = ActionProcessor::new();
        let handle = processor.handle();
        assert!(handle.upgrade().is_some());

        drop(processor);

        let log = ActionLog::new();
        assert!(handle
            .enqueue(Box::new(TestAction::new("late", TestBehavior::Succeed, log)))
            .is_none());
    }
}
