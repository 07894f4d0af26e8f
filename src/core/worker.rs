//! Consumer unit implementation for Streamsmith.
//!
//! A unit is one polling worker bound to one store connection. Each loop
//! iteration runs the cleanup pass, picks up this identity's pending entries,
//! blocks for new work when there is none, then drains its local buffer
//! through the handler.

use crate::config::ConsumerConfig;
use crate::core::cleanup::CleanupReport;
use crate::core::handler::{self, TaskHandler};
use crate::error::{SmithError, SmithResult};
use crate::keys::QueueKeys;
use crate::outcome::{ErrorInfo, OutcomeKind, OutcomeRecord};
use crate::store::{
    CounterIncr, GroupRead, ListAppend, ReadCursor, SharedStore, StoreConnector, StreamEntry,
};
use crate::task::{RawTask, Task, TaskId};
use crate::utils::calculate_backoff;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Most pending entries claimed from one orphan per pass
const CLAIM_BATCH: usize = 1000;

/// Where a unit currently is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    /// Created, not yet connected
    Uninitialized,
    /// Loading scripts and announcing its identity
    Registering,
    /// Registered and between steps
    Idle,
    /// Running the cleanup pass
    Claiming,
    /// Reading pending or new entries
    Fetching,
    /// Running the handler and recording the outcome
    Processing,
    /// Connection released
    Disconnected,
}

/// What happened to a processed task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The handler returned a result and the task was removed
    Succeeded(Value),
    /// The attempt failed and the task was requeued under a new id
    Retried {
        /// Id of the retry entry
        new_id: TaskId,
        /// Why the attempt failed
        error: ErrorInfo,
    },
    /// The attempt failed with no retries left
    DeadLettered(ErrorInfo),
    /// The attempt failed after another consumer had claimed and settled the
    /// entry, so nothing was requeued
    Superseded(ErrorInfo),
}

/// One task run by [`ConsumerUnit::process_next`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedTask {
    /// Entry id of the attempt
    pub id: TaskId,
    /// Retry count of the attempt
    pub retry_count: u32,
    /// Result of the attempt
    pub outcome: TaskOutcome,
}

struct UnitState {
    buffer: VecDeque<Task>,
    total: u64,
}

struct UnitInner {
    name: String,
    keys: QueueKeys,
    store: SharedStore,
    handler: Arc<dyn TaskHandler>,
    config: Arc<ConsumerConfig>,
    seed: u64,
    paused: AtomicBool,
    loop_running: AtomicBool,
    phase: watch::Sender<UnitPhase>,
    state: Mutex<UnitState>,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// A single polling worker with its own connection and identity.
///
/// Cloning yields another handle to the same unit.
#[derive(Clone)]
pub struct ConsumerUnit {
    inner: Arc<UnitInner>,
}

impl std::fmt::Debug for ConsumerUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerUnit")
            .field("name", &self.inner.name)
            .field("qname", &self.inner.keys.qname)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl ConsumerUnit {
    /// Open a connection for `qname` and register on it.
    ///
    /// The unit starts paused; call [`start`](Self::start) to run its loop.
    pub async fn new(
        qname: &str,
        handler: Arc<dyn TaskHandler>,
        config: Arc<ConsumerConfig>,
        connector: &dyn StoreConnector,
    ) -> SmithResult<Self> {
        config
            .validate()
            .map_err(|errors| SmithError::config(errors.join("; ")))?;

        let store = connector.connect().await?;
        Self::with_store(qname, handler, config, store).await
    }

    /// Register on an existing connection. The connection's announced name is
    /// replaced by this unit's identity, so it must not be shared with another unit.
    pub async fn with_store(
        qname: &str,
        handler: Arc<dyn TaskHandler>,
        config: Arc<ConsumerConfig>,
        store: SharedStore,
    ) -> SmithResult<Self> {
        config
            .validate()
            .map_err(|errors| SmithError::config(errors.join("; ")))?;

        let keys = crate::keys::KeySpace::new(&config.queue.namespace).queue(qname);
        let (phase, _) = watch::channel(UnitPhase::Uninitialized);
        phase.send_replace(UnitPhase::Registering);

        store.load_scripts().await?;
        let client_id = store.client_id().await?;
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}:c:{}-{}", keys.group, client_id, &suffix[..10]);
        store.set_client_name(&name).await?;

        let unit = Self {
            inner: Arc::new(UnitInner {
                name,
                keys,
                store,
                handler,
                config,
                seed: client_id,
                paused: AtomicBool::new(true),
                loop_running: AtomicBool::new(false),
                phase,
                state: Mutex::new(UnitState {
                    buffer: VecDeque::new(),
                    total: 0,
                }),
                loop_handle: std::sync::Mutex::new(None),
            }),
        };

        unit.inner.ensure_group().await?;
        unit.inner.set_phase(UnitPhase::Idle);
        info!("🔧 Consumer {} registered", unit.inner.name);

        Ok(unit)
    }

    /// This unit's identity in the consumer group.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue name.
    pub fn qname(&self) -> &str {
        &self.inner.keys.qname
    }

    /// Current loop phase.
    pub fn phase(&self) -> UnitPhase {
        *self.inner.phase.borrow()
    }

    /// Watch phase changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<UnitPhase> {
        self.inner.phase.subscribe()
    }

    /// Whether the loop has been asked to stop.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Tasks handed to the handler so far.
    pub async fn total_processed(&self) -> u64 {
        self.inner.state.lock().await.total
    }

    /// Tasks fetched but not yet processed.
    pub async fn buffered(&self) -> usize {
        self.inner.state.lock().await.buffer.len()
    }

    /// Run the loop on a background task. No effect if it is already running.
    pub fn start(&self) {
        self.inner.paused.store(false, Ordering::Release);
        if self
            .inner
            .loop_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(inner.run());
            *self.inner.lock_handle() = Some(handle);
        }
    }

    /// Stop starting new iterations once the current task is done.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Start again after [`pause`](Self::pause).
    pub fn resume(&self) {
        self.start();
    }

    /// Pause and release the connection.
    ///
    /// In-flight work is not handed off: its pending entries stay with this
    /// identity until another unit's cleanup pass claims them.
    pub async fn disconnect(&self) -> SmithResult<()> {
        self.pause();
        let handle = self.inner.lock_handle().take();
        if let Some(handle) = handle {
            handle.abort();
        }

        self.inner.store.disconnect().await?;
        self.inner.set_phase(UnitPhase::Disconnected);
        info!("🔧 Consumer {} disconnected", self.inner.name);
        Ok(())
    }

    /// Run one cleanup pass: claim entries of dead peers and delete dead, empty ones.
    pub async fn clean_up(&self) -> SmithResult<CleanupReport> {
        self.inner.clean_up().await
    }

    /// Buffer entries delivered to this identity and not yet acknowledged.
    /// Returns the number of tasks buffered.
    pub async fn fetch_pending(&self) -> SmithResult<usize> {
        self.inner.fetch_pending().await
    }

    /// Block until a new entry is delivered to this identity or the block
    /// timeout passes. The entry becomes pending and is picked up by the next
    /// [`fetch_pending`](Self::fetch_pending).
    pub async fn wait_for_task(&self) -> SmithResult<bool> {
        self.inner.wait_for_task().await
    }

    /// Process the oldest buffered task, if any.
    pub async fn process_next(&self) -> SmithResult<Option<ProcessedTask>> {
        self.inner.process_next().await
    }
}

impl UnitInner {
    fn set_phase(&self, phase: UnitPhase) {
        if *self.phase.borrow() != UnitPhase::Disconnected {
            self.phase.send_replace(phase);
        }
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.loop_handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn log(&self, message: impl Display) {
        let logging = &self.config.logging;
        if !logging.enabled {
            return;
        }

        let prefix = format!("Streamsmith :: {}", self.name);
        match &logging.sink {
            Some(sink) => (sink.0)(&prefix, &message.to_string()),
            None => info!("{} {}", prefix, message),
        }
    }

    async fn ensure_group(&self) -> SmithResult<()> {
        self.log(format_args!(
            "Ensuring consumer group exists: {} on {}",
            self.keys.group, self.keys.stream
        ));

        match self
            .store
            .create_group(&self.keys.stream, &self.keys.group)
            .await
        {
            Ok(()) | Err(SmithError::BusyGroup) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut failures = 0u32;

        loop {
            while !self.is_paused() {
                match self.iteration().await {
                    Ok(()) => failures = 0,
                    Err(SmithError::Disconnected) => {
                        debug!("🔧 Consumer {} connection closed, stopping loop", self.name);
                        self.loop_running.store(false, Ordering::Release);
                        return;
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let backoff_ms = calculate_backoff(failures, self.seed);
                        warn!(
                            "🔧 Consumer {} store error: {}, retrying in {}ms",
                            self.name, e, backoff_ms
                        );
                        self.set_phase(UnitPhase::Idle);
                        sleep(Duration::from_millis(backoff_ms)).await;

                        // Reconnects drop the connection name
                        if let Err(e) = self.store.set_client_name(&self.name).await {
                            debug!("🔧 Consumer {} could not re-announce: {}", self.name, e);
                        }
                    }
                }
            }

            self.set_phase(UnitPhase::Idle);
            self.loop_running.store(false, Ordering::Release);

            // A start() racing with this exit found the flag still set
            if self.is_paused()
                || self
                    .loop_running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                break;
            }
        }

        debug!("🔧 Consumer {} loop paused", self.name);
    }

    async fn iteration(&self) -> SmithResult<()> {
        self.clean_up().await?;
        self.fetch_pending().await?;

        if self.state.lock().await.buffer.is_empty() {
            self.wait_for_task().await?;
        }

        while !self.is_paused() && self.process_next().await?.is_some() {}
        Ok(())
    }

    async fn clean_up(&self) -> SmithResult<CleanupReport> {
        self.set_phase(UnitPhase::Claiming);
        let options = &self.config.consumer;
        let (stream, group) = (&self.keys.stream, &self.keys.group);

        let consumers = self.store.consumers(stream, group).await?;
        let live = self.store.client_names().await?;
        let mut report =
            CleanupReport::plan(&consumers, &live, options.idle_consumer_threshold());

        for orphan in &report.orphan_workers {
            let ids: Vec<String> = self
                .store
                .pending(stream, group, orphan, CLAIM_BATCH)
                .await?
                .into_iter()
                .map(|entry| entry.id)
                .collect();

            let claimed = self
                .store
                .claim(stream, group, &self.name, options.claim_min_idle(), &ids)
                .await?;

            self.log(format_args!(
                "Claimed {} pending tasks from worker {}",
                claimed.len(),
                orphan
            ));
            report.claim_info.insert(orphan.clone(), claimed.len());
        }

        for orphan in &report.orphan_empty_workers {
            if self.store.delete_idle_consumer(&self.keys, orphan).await? {
                self.log(format_args!("Deleted old consumer {}", orphan));
                report.delete_info.push(orphan.clone());
            }
        }

        if report.claimed() > 0 || !report.delete_info.is_empty() {
            info!(
                "🔧 Consumer {} cleanup claimed {} tasks, deleted {} consumers",
                self.name,
                report.claimed(),
                report.delete_info.len()
            );
        }
        if let Ok(json) = serde_json::to_string(&report) {
            self.log(format_args!("Cleanup result: {}", json));
        }

        self.set_phase(UnitPhase::Idle);
        Ok(report)
    }

    async fn fetch_pending(&self) -> SmithResult<usize> {
        self.set_phase(UnitPhase::Fetching);
        self.log("Checking pending tasks");

        let entries = self
            .store
            .read_group(GroupRead {
                stream: &self.keys.stream,
                group: &self.keys.group,
                consumer: &self.name,
                count: self.config.consumer.task_buffer_size,
                cursor: ReadCursor::Pending,
                block: None,
            })
            .await?;

        let mut added = 0;
        for entry in entries {
            if self.is_buffered(&entry.id).await {
                continue;
            }

            match Task::from_fields(entry.id.as_str(), &entry.fields) {
                Ok(task) => {
                    self.state.lock().await.buffer.push_back(task);
                    added += 1;
                }
                Err(e) => self.reject(&entry, &e).await?,
            }
        }

        self.set_phase(UnitPhase::Idle);
        Ok(added)
    }

    async fn is_buffered(&self, id: &str) -> bool {
        self.state.lock().await.buffer.iter().any(|t| t.id == id)
    }

    async fn wait_for_task(&self) -> SmithResult<bool> {
        self.set_phase(UnitPhase::Fetching);
        let total = self.state.lock().await.total;
        self.log(format_args!(
            "Waiting for tasks. Processed so far: {}",
            total
        ));

        let entries = self
            .store
            .read_group(GroupRead {
                stream: &self.keys.stream,
                group: &self.keys.group,
                consumer: &self.name,
                count: 1,
                cursor: ReadCursor::New,
                block: Some(self.config.consumer.block_timeout()),
            })
            .await?;

        if !entries.is_empty() {
            self.log("Got new task");
        }
        self.set_phase(UnitPhase::Idle);
        Ok(!entries.is_empty())
    }

    async fn process_next(&self) -> SmithResult<Option<ProcessedTask>> {
        let task = {
            let mut state = self.state.lock().await;
            let Some(task) = state.buffer.pop_front() else {
                return Ok(None);
            };
            state.total += 1;
            task
        };

        self.set_phase(UnitPhase::Processing);
        self.log(format_args!("Starting to process task {}", task.id));

        self.store
            .record(&[], &self.counters("processed"))
            .await?;

        let metadata = task.metadata(&self.keys.qname, &self.name);
        let budget = self.config.consumer.worker_fn_timeout();
        let id = task.id.clone();
        let retry_count = task.retry_count;

        let outcome = match handler::invoke(
            Arc::clone(&self.handler),
            task.data.clone(),
            metadata,
            budget,
        )
        .await
        {
            Ok(result) => self.on_success(&task, result).await?,
            Err(e) => {
                if matches!(e, SmithError::Timeout { .. }) {
                    self.log(format_args!("Worker {} timed out", task.id));
                } else {
                    self.log(format_args!("Worker {} crashed: {}", task.id, e));
                }
                self.on_failure(task, e).await?
            }
        };

        self.set_phase(UnitPhase::Idle);
        Ok(Some(ProcessedTask {
            id,
            retry_count,
            outcome,
        }))
    }

    async fn on_success(&self, task: &Task, result: Value) -> SmithResult<TaskOutcome> {
        self.log(format_args!("Worker {} returned {}", task.id, result));

        let record = OutcomeRecord::success(task, &self.keys.qname, result.clone());
        let payload = serde_json::to_string(&record)?;

        self.store
            .dequeue(&self.keys, &task.id, &task.dedup_key)
            .await?;
        self.store
            .record(&self.lists(OutcomeKind::Success, &payload), &[])
            .await?;

        debug!("🔧 Task {} completed on {}", task.id, self.keys.qname);
        Ok(TaskOutcome::Succeeded(result))
    }

    async fn on_failure(&self, mut task: Task, err: SmithError) -> SmithResult<TaskOutcome> {
        // Recorded with the retry count of the failed attempt
        let record = OutcomeRecord::failure(&task, &self.keys.qname, &err);
        let payload = serde_json::to_string(&record)?;
        let info = ErrorInfo::from(&err);

        let mut lists = self.lists(OutcomeKind::Failure, &payload);
        let mut counters = self.counters("failed");

        let outcome = if task.retry_count < self.config.consumer.max_retry {
            let old_id = task.id.clone();
            task.incr_retry();
            let raw = RawTask {
                data: task.data_string.clone(),
                dedup_key: task.dedup_key.clone(),
                retry_count: task.retry_count,
            };
            match self.store.requeue(&self.keys, &old_id, &raw).await? {
                Some(new_id) => {
                    counters.extend(self.counters("retries"));
                    warn!(
                        "🔧 Task {} failed ({}), requeued as {} (retry {})",
                        old_id, info.name, new_id, task.retry_count
                    );
                    TaskOutcome::Retried {
                        new_id,
                        error: info,
                    }
                }
                None => {
                    warn!(
                        "🔧 Task {} failed ({}) but was already settled by another consumer",
                        old_id, info.name
                    );
                    TaskOutcome::Superseded(info)
                }
            }
        } else {
            self.store
                .dequeue(&self.keys, &task.id, &task.dedup_key)
                .await?;
            lists.extend(self.lists(OutcomeKind::Dead, &payload));
            counters.extend(self.counters("dead"));

            error!(
                "🔧 Task {} on {} dead after {} retries: {}",
                task.id, self.keys.qname, task.retry_count, err
            );
            TaskOutcome::DeadLettered(info)
        };

        self.store.record(&lists, &counters).await?;
        Ok(outcome)
    }

    /// Acknowledge and remove an entry that is not a valid task, and dead-letter it.
    async fn reject(&self, entry: &StreamEntry, err: &SmithError) -> SmithResult<()> {
        error!(
            "🔧 Malformed entry {} on {}: {}",
            entry.id, self.keys.qname, err
        );

        let record = OutcomeRecord::rejected(&entry.id, &self.keys.qname, &entry.fields, err);
        let payload = serde_json::to_string(&record)?;

        self.store
            .dequeue(&self.keys, &entry.id, &record.dedup_key)
            .await?;
        self.store
            .record(&self.lists(OutcomeKind::Dead, &payload), &self.counters("dead"))
            .await
    }

    fn lists(&self, kind: OutcomeKind, payload: &str) -> Vec<ListAppend> {
        let queue = &self.config.queue;
        let global_cap = match kind {
            OutcomeKind::Success => queue.max_result_list_size,
            OutcomeKind::Failure => queue.max_failed_list_size,
            OutcomeKind::Dead => queue.max_dead_list_size,
        };

        vec![
            ListAppend {
                key: self.keys.space().outcome_list(kind),
                value: payload.to_string(),
                cap: global_cap,
            },
            ListAppend {
                key: self.keys.outcome_list(kind),
                value: payload.to_string(),
                cap: queue.max_individual_queue_result_size,
            },
        ]
    }

    fn counters(&self, field: &'static str) -> Vec<CounterIncr> {
        vec![
            CounterIncr {
                key: self.keys.space().stats(),
                field,
                by: 1,
            },
            CounterIncr {
                key: self.keys.stats(),
                field,
                by: 1,
            },
        ]
    }
}
