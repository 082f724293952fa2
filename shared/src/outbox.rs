//! Write-behind persistence for the message log.
//!
//! New messages are visible to the UI as soon as they are created; durability
//! happens later, in batches. [`Outbox`] holds the pending queue and the flush
//! bookkeeping without doing any I/O, so the app core and the async
//! [`SyncCoordinator`] share one set of rules: at most one write is in flight,
//! a committed write removes exactly the prefix it sent, and a write that
//! straddles a clear never removes messages queued after it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::event::PageLifecycle;
use crate::model::{ChatMessage, MessageId, MessageSource};
use crate::offline_store::{ConfigError, MessageStore, StoreError, StoredRecord};
use crate::{UnixTimeMs, DEFAULT_BATCH_THRESHOLD, DEFAULT_SYNC_INTERVAL};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Outbox length that forces an immediate flush.
    pub batch_threshold: usize,
    pub sync_interval: Duration,
    /// Lifecycle notifications buffered per listener.
    pub lifecycle_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            lifecycle_buffer: 16,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "batch_threshold",
            });
        }
        if self.sync_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "sync_interval",
            });
        }
        if self.lifecycle_buffer == 0 {
            return Err(ConfigError::Zero {
                field: "lifecycle_buffer",
            });
        }
        Ok(())
    }
}

// ============================================================================
// Outbox state
// ============================================================================

/// One flush attempt: the outbox generation it snapshotted and how many
/// leading messages it sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushTicket {
    generation: u64,
    sent: usize,
}

impl FlushTicket {
    pub fn sent(&self) -> usize {
        self.sent
    }
}

#[derive(Debug)]
pub struct FlushBatch {
    pub ticket: FlushTicket,
    pub records: Vec<StoredRecord>,
}

/// Pending messages and the id counter.
///
/// `generation` moves on every [`Outbox::clear`]; a flush that finishes under
/// a newer generation leaves the queue alone.
#[derive(Clone, Debug)]
pub struct Outbox {
    pending: VecDeque<ChatMessage>,
    next_id: u64,
    generation: u64,
    in_flight: Option<FlushTicket>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            next_id: MessageId::FIRST.get(),
            generation: 0,
            in_flight: None,
        }
    }
}

impl Outbox {
    /// Allocates the next id and stamps the current time. Does not enqueue.
    pub fn create_message(
        &mut self,
        text: impl Into<String>,
        source: MessageSource,
        is_inappropriate: Option<bool>,
    ) -> ChatMessage {
        let id = MessageId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        ChatMessage::new(id, text, source, UnixTimeMs::now(), is_inappropriate)
    }

    pub fn peek_next_id(&self) -> MessageId {
        MessageId(self.next_id)
    }

    /// Appends and returns the new pending count.
    pub fn push(&mut self, message: ChatMessage) -> usize {
        self.pending.push_back(message);
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_flushing(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Snapshots the queue for one write. `None` while another flush is
    /// running or when nothing is pending.
    pub fn begin_flush(&mut self) -> Option<FlushBatch> {
        if self.in_flight.is_some() || self.pending.is_empty() {
            return None;
        }
        let ticket = FlushTicket {
            generation: self.generation,
            sent: self.pending.len(),
        };
        self.in_flight = Some(ticket);
        Some(FlushBatch {
            ticket,
            records: self.pending.iter().map(StoredRecord::from).collect(),
        })
    }

    /// False once the queue the ticket was cut from has been cleared.
    pub fn is_current(&self, ticket: FlushTicket) -> bool {
        ticket.generation == self.generation
    }

    /// Ends a flush attempt and returns how many messages it removed.
    pub fn finish_flush(&mut self, ticket: FlushTicket, committed: bool) -> usize {
        if self.in_flight == Some(ticket) {
            self.in_flight = None;
        }
        if !committed || !self.is_current(ticket) {
            return 0;
        }
        let removed = ticket.sent.min(self.pending.len());
        self.pending.drain(..removed);
        removed
    }

    /// Drops pending messages and restarts ids at 1. A flush already in
    /// flight keeps its slot but can no longer trim the queue.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.next_id = MessageId::FIRST.get();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Decodes stored records and moves the id counter past the largest one,
    /// never backwards.
    pub fn restore(&mut self, records: Vec<StoredRecord>) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = records
            .into_iter()
            .map(ChatMessage::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(max) = messages.iter().map(ChatMessage::id).max() {
            self.next_id = self.next_id.max(max.next().get());
        }
        Ok(messages)
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
struct SyncMetrics {
    flushes_committed: AtomicU64,
    flushes_failed: AtomicU64,
    flushes_skipped: AtomicU64,
    flushes_abandoned: AtomicU64,
    messages_persisted: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    pub flushes_committed: u64,
    pub flushes_failed: u64,
    /// Flush attempts that found another flush already running.
    pub flushes_skipped: u64,
    /// Snapshots dropped unwritten because the outbox was cleared first.
    pub flushes_abandoned: u64,
    pub messages_persisted: u64,
}

impl SyncMetrics {
    fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            flushes_committed: self.flushes_committed.load(Ordering::Relaxed),
            flushes_failed: self.flushes_failed.load(Ordering::Relaxed),
            flushes_skipped: self.flushes_skipped.load(Ordering::Relaxed),
            flushes_abandoned: self.flushes_abandoned.load(Ordering::Relaxed),
            messages_persisted: self.messages_persisted.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Lifecycle subscription
// ============================================================================

/// Page-lifecycle triggers installed by [`SyncCoordinator::start_background_sync`].
/// Dropping it (or calling [`SyncSubscription::teardown`]) removes them.
#[must_use = "dropping the subscription detaches the lifecycle triggers"]
#[derive(Debug)]
pub struct SyncSubscription {
    listener: JoinHandle<()>,
}

impl SyncSubscription {
    /// Stops reacting to lifecycle notifications. The periodic timer keeps
    /// running until [`SyncCoordinator::stop_background_sync`].
    pub fn teardown(self) {
        self.listener.abort();
        debug!("lifecycle triggers detached");
    }

    pub fn is_active(&self) -> bool {
        !self.listener.is_finished()
    }
}

impl Drop for SyncSubscription {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

// Hands the ticket back on every exit path, including cancellation.
struct FlushAttempt<'a> {
    outbox: &'a Mutex<Outbox>,
    ticket: FlushTicket,
    finished: bool,
}

impl FlushAttempt<'_> {
    /// Returns (removed, still pending).
    fn finish(&mut self, committed: bool) -> (usize, usize) {
        self.finished = true;
        let mut outbox = lock(self.outbox);
        let removed = outbox.finish_flush(self.ticket, committed);
        (removed, outbox.len())
    }
}

impl Drop for FlushAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            lock(self.outbox).finish_flush(self.ticket, false);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Coordinator
// ============================================================================

/// Drives an [`Outbox`] against a [`MessageStore`] on the tokio runtime.
pub struct SyncCoordinator<S> {
    store: Arc<S>,
    config: SyncConfig,
    outbox: Mutex<Outbox>,
    // Store transactions run one at a time, in the order they were requested.
    transactions: tokio::sync::Mutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
    lifecycle: broadcast::Sender<PageLifecycle>,
    metrics: SyncMetrics,
}

impl<S: MessageStore + 'static> SyncCoordinator<S> {
    pub fn new(store: Arc<S>, config: SyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (lifecycle, _) = broadcast::channel(config.lifecycle_buffer);
        Ok(Self {
            store,
            config,
            outbox: Mutex::new(Outbox::default()),
            transactions: tokio::sync::Mutex::new(()),
            timer: Mutex::new(None),
            lifecycle,
            metrics: SyncMetrics::default(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        lock(&self.outbox)
    }

    fn timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        lock(&self.timer)
    }

    /// Allocates the next id and stamps the current time. Neither persists
    /// nor enqueues the message.
    pub fn create_message(
        &self,
        text: impl Into<String>,
        source: MessageSource,
        is_inappropriate: Option<bool>,
    ) -> ChatMessage {
        self.outbox().create_message(text, source, is_inappropriate)
    }

    /// The id the next [`Self::create_message`] will hand out.
    pub fn peek_next_id(&self) -> MessageId {
        self.outbox().peek_next_id()
    }

    /// Appends to the outbox; reaching the batch threshold kicks off a flush
    /// without waiting for it.
    pub fn queue_message(self: &Arc<Self>, message: ChatMessage) {
        let pending = self.outbox().push(message);
        debug!(pending, "message queued");

        if pending >= self.config.batch_threshold {
            self.spawn_flush("threshold");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.outbox().len()
    }

    pub fn is_flushing(&self) -> bool {
        self.outbox().is_flushing()
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn spawn_flush(self: &Arc<Self>, trigger: &'static str) {
        match Handle::try_current() {
            Ok(handle) => {
                let this = Arc::clone(self);
                handle.spawn(async move {
                    debug!(trigger, "flush triggered");
                    this.flush().await;
                });
            }
            Err(_) => warn!(trigger, "no async runtime, flush deferred to the next trigger"),
        }
    }

    /// Writes the current outbox contents in one transaction.
    ///
    /// Returns immediately when another flush is running or nothing is
    /// pending. On success exactly the snapshotted prefix is removed, so
    /// messages queued meanwhile wait for the next round; on failure the
    /// outbox is left as it was. A snapshot overtaken by
    /// [`Self::clear_messages`] is never written.
    #[instrument(skip(self))]
    pub async fn flush(&self) {
        let batch = {
            let mut outbox = self.outbox();
            if outbox.is_flushing() {
                self.metrics.flushes_skipped.fetch_add(1, Ordering::Relaxed);
                debug!("flush already in progress");
                return;
            }
            match outbox.begin_flush() {
                Some(batch) => batch,
                None => return,
            }
        };
        let mut attempt = FlushAttempt {
            outbox: &self.outbox,
            ticket: batch.ticket,
            finished: false,
        };
        let sent = batch.records.len();

        let _transaction = self.transactions.lock().await;
        if !self.outbox().is_current(batch.ticket) {
            self.metrics.flushes_abandoned.fetch_add(1, Ordering::Relaxed);
            debug!(sent, "outbox cleared before the write started");
            return;
        }

        match self.store.put_batch(&batch.records).await {
            Ok(()) => {
                let (removed, remaining) = attempt.finish(true);
                self.metrics.flushes_committed.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .messages_persisted
                    .fetch_add(sent as u64, Ordering::Relaxed);
                info!(sent, removed, remaining, "flushed messages");
            }
            Err(e) => {
                attempt.finish(false);
                self.metrics.flushes_failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, pending = sent, "failed to sync messages");
            }
        }
    }

    pub async fn force_sync(&self) {
        self.flush().await;
    }

    /// Starts the periodic flush and the page-lifecycle triggers.
    ///
    /// Returns `None` when background sync is already running or there is no
    /// runtime to run it on.
    pub fn start_background_sync(self: &Arc<Self>) -> Option<SyncSubscription> {
        let Ok(handle) = Handle::try_current() else {
            warn!("no async runtime, background sync not started");
            return None;
        };

        let mut timer = self.timer();
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("background sync already running");
            return None;
        }

        let period = self.config.sync_interval;
        *timer = Some(handle.spawn(Self::run_timer(Arc::downgrade(self), period)));

        let events = self.lifecycle.subscribe();
        let listener = handle.spawn(Self::run_lifecycle(Arc::downgrade(self), events));

        info!(interval = ?period, "background sync started");
        Some(SyncSubscription { listener })
    }

    /// Cancels the periodic flush. A flush already running is left to finish.
    pub fn stop_background_sync(&self) {
        if let Some(timer) = self.timer().take() {
            timer.abort();
            info!("background sync stopped");
        }
    }

    pub fn is_background_sync_active(&self) -> bool {
        self.timer().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Forwards a page lifecycle change to the installed triggers.
    pub fn notify_lifecycle(&self, event: PageLifecycle) {
        if self.lifecycle.send(event).is_err() {
            debug!(?event, "no lifecycle listeners");
        }
    }

    // Each tick spawns its flush, so aborting the timer never cuts one short.
    async fn run_timer(coordinator: Weak<Self>, period: Duration) {
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(this) = coordinator.upgrade() else {
                break;
            };
            this.spawn_flush("interval");
        }
    }

    async fn run_lifecycle(coordinator: Weak<Self>, mut events: broadcast::Receiver<PageLifecycle>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "lifecycle events dropped");
                    PageLifecycle::Visible
                }
                Err(RecvError::Closed) => break,
            };
            let Some(this) = coordinator.upgrade() else {
                break;
            };
            match event {
                PageLifecycle::Visible => this.spawn_flush("visible"),
                PageLifecycle::BeforeUnload if this.pending_count() > 0 => {
                    this.spawn_flush("unload");
                }
                PageLifecycle::BeforeUnload | PageLifecycle::Hidden => {}
            }
        }
    }

    /// Reads every stored message in timestamp order and reseeds the id
    /// counter past the largest stored id. Any failure yields an empty log.
    #[instrument(skip(self))]
    pub async fn load_messages(&self) -> Vec<ChatMessage> {
        let records = match self.store.get_all_by_time().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "failed to load messages");
                return Vec::new();
            }
        };

        let restored = self.outbox().restore(records);
        match restored {
            Ok(messages) => {
                info!(count = messages.len(), next_id = %self.peek_next_id(), "loaded messages");
                messages
            }
            Err(e) => {
                error!(error = %e, "failed to load messages");
                Vec::new()
            }
        }
    }

    /// One write transaction for all of `messages`; used to seed an empty store.
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub async fn bulk_add_messages(&self, messages: &[ChatMessage]) {
        let records: Vec<StoredRecord> = messages.iter().map(StoredRecord::from).collect();
        let _transaction = self.transactions.lock().await;
        if let Err(e) = self.store.put_batch(&records).await {
            error!(error = %e, "failed to bulk add messages");
        }
    }

    /// Drops pending messages, restarts ids at 1 and empties the store.
    ///
    /// The in-memory part takes effect before this first awaits; the store
    /// clear queues behind any write already under way.
    #[instrument(skip(self))]
    pub async fn clear_messages(&self) {
        self.outbox().clear();

        let _transaction = self.transactions.lock().await;
        if let Err(e) = self.store.clear().await {
            error!(error = %e, "failed to clear messages");
        }
    }
}

impl<S> Drop for SyncCoordinator<S> {
    fn drop(&mut self) {
        if let Some(timer) = self
            .timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline_store::MemoryStore;

    fn coordinator() -> (Arc<MemoryStore>, Arc<SyncCoordinator<MemoryStore>>) {
        let store = Arc::new(MemoryStore::new());
        let coordinator =
            Arc::new(SyncCoordinator::new(Arc::clone(&store), SyncConfig::default()).unwrap());
        (store, coordinator)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    fn queue_n(coordinator: &Arc<SyncCoordinator<MemoryStore>>, n: usize) {
        for i in 0..n {
            let msg = coordinator.create_message(format!("msg {i}"), MessageSource::You, None);
            coordinator.queue_message(msg);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(SyncConfig::default().validate().is_ok());

        let bad = SyncConfig {
            batch_threshold: 0,
            ..SyncConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad2 = SyncConfig {
            sync_interval: Duration::ZERO,
            ..SyncConfig::default()
        };
        assert!(bad2.validate().is_err());
    }

    #[test]
    fn test_outbox_single_flight_and_prefix_trim() {
        let mut outbox = Outbox::default();
        for text in ["a", "b"] {
            let msg = outbox.create_message(text, MessageSource::You, None);
            outbox.push(msg);
        }
        let batch = outbox.begin_flush().unwrap();
        assert_eq!(batch.ticket.sent(), 2);
        assert!(outbox.begin_flush().is_none());

        let late = outbox.create_message("c", MessageSource::You, None);
        outbox.push(late);
        assert_eq!(outbox.finish_flush(batch.ticket, true), 2);
        assert_eq!(outbox.len(), 1);
        assert!(!outbox.is_flushing());
    }

    #[test]
    fn test_outbox_failed_or_stale_flush_keeps_queue() {
        let mut outbox = Outbox::default();
        let msg = outbox.create_message("a", MessageSource::You, None);
        outbox.push(msg);

        let failed = outbox.begin_flush().unwrap();
        assert_eq!(outbox.finish_flush(failed.ticket, false), 0);
        assert_eq!(outbox.len(), 1);

        let stale = outbox.begin_flush().unwrap();
        outbox.clear();
        assert!(!outbox.is_current(stale.ticket));
        let fresh = outbox.create_message("b", MessageSource::You, None);
        assert_eq!(fresh.id(), MessageId(1));
        outbox.push(fresh);

        assert_eq!(outbox.finish_flush(stale.ticket, true), 0);
        assert_eq!(outbox.len(), 1);
        assert!(outbox.begin_flush().is_some());
    }

    #[test]
    fn test_outbox_restore_never_moves_ids_back() {
        let mut outbox = Outbox::default();
        for _ in 0..9 {
            outbox.create_message("x", MessageSource::You, None);
        }
        let records = vec![StoredRecord::from(&ChatMessage::new(
            MessageId(4),
            "old",
            MessageSource::Other,
            UnixTimeMs(1),
            None,
        ))];
        assert_eq!(outbox.restore(records).unwrap().len(), 1);
        assert_eq!(outbox.peek_next_id(), MessageId(10));
    }

    #[test]
    fn test_ids_are_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = SyncCoordinator::new(store, SyncConfig::default()).unwrap();
        let a = coordinator.create_message("a", MessageSource::You, None);
        let b = coordinator.create_message("b", MessageSource::Other, Some(false));
        assert_eq!(a.id(), MessageId(1));
        assert_eq!(b.id(), MessageId(2));
        assert_eq!(b.is_inappropriate(), Some(false));
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[test]
    fn test_queue_without_runtime_keeps_messages() {
        let store = Arc::new(MemoryStore::new());
        let coordinator =
            Arc::new(SyncCoordinator::new(store, SyncConfig::default()).unwrap());
        queue_n(&coordinator, 12);
        assert_eq!(coordinator.pending_count(), 12);
        assert!(coordinator.start_background_sync().is_none());
    }

    #[tokio::test]
    async fn test_below_threshold_stays_pending() {
        let (store, coordinator) = coordinator();
        queue_n(&coordinator, 9);
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.pending_count(), 9);
        assert_eq!(store.committed_batches(), 0);
    }

    #[tokio::test]
    async fn test_threshold_triggers_flush() {
        let (store, coordinator) = coordinator();
        queue_n(&coordinator, 10);
        wait_until(|| coordinator.pending_count() == 0).await;
        assert_eq!(store.len().await, 10);
        assert_eq!(store.committed_batches(), 1);
    }

    #[tokio::test]
    async fn test_flush_persists_in_time_order() {
        let (_store, coordinator) = coordinator();
        queue_n(&coordinator, 3);
        coordinator.force_sync().await;
        assert_eq!(coordinator.pending_count(), 0);

        let loaded = coordinator.load_messages().await;
        let texts: Vec<&str> = loaded.iter().map(ChatMessage::text).collect();
        assert_eq!(texts, vec!["msg 0", "msg 1", "msg 2"]);
        assert!(loaded
            .windows(2)
            .all(|w| w[0].time_stamp() <= w[1].time_stamp()));
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_outbox() {
        let (store, coordinator) = coordinator();
        queue_n(&coordinator, 3);
        store.set_fail_writes(true);

        coordinator.flush().await;
        assert_eq!(coordinator.pending_count(), 3);
        assert_eq!(coordinator.metrics().flushes_failed, 1);
        assert!(!coordinator.is_flushing());

        store.set_fail_writes(false);
        coordinator.flush().await;
        assert_eq!(coordinator.pending_count(), 0);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let (store, coordinator) = coordinator();
        coordinator.flush().await;
        assert_eq!(store.committed_batches(), 0);
        assert_eq!(coordinator.metrics(), SyncMetricsSnapshot::default());
    }

    #[tokio::test]
    async fn test_concurrent_flush_is_guarded_and_keeps_late_messages() {
        let (store, coordinator) = coordinator();
        queue_n(&coordinator, 2);
        store.pause_writes();

        let first = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.flush().await }
        });
        wait_until(|| coordinator.is_flushing()).await;

        // Second trigger while the first transaction is open collapses into it.
        coordinator.flush().await;
        assert_eq!(coordinator.metrics().flushes_skipped, 1);

        queue_n(&coordinator, 1);
        store.resume_writes();
        first.await.unwrap();

        assert_eq!(store.committed_batches(), 1);
        assert_eq!(store.len().await, 2);
        assert_eq!(coordinator.pending_count(), 1);

        coordinator.flush().await;
        assert_eq!(coordinator.pending_count(), 0);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_clear_during_flush_keeps_messages_queued_after_it() {
        let (store, coordinator) = coordinator();
        queue_n(&coordinator, 2);
        store.pause_writes();

        let flush = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.flush().await }
        });
        wait_until(|| coordinator.is_flushing()).await;

        let clear = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.clear_messages().await }
        });
        wait_until(|| coordinator.pending_count() == 0).await;

        let after = coordinator.create_message("after clear", MessageSource::You, None);
        assert_eq!(after.id(), MessageId(1));
        coordinator.queue_message(after);

        store.resume_writes();
        flush.await.unwrap();
        clear.await.unwrap();

        assert_eq!(coordinator.pending_count(), 1);
        assert!(store.is_empty().await, "old batch wiped by the clear behind it");

        coordinator.flush().await;
        let loaded = coordinator.load_messages().await;
        let texts: Vec<&str> = loaded.iter().map(ChatMessage::text).collect();
        assert_eq!(texts, vec!["after clear"]);
    }

    #[tokio::test]
    async fn test_snapshot_overtaken_by_clear_is_never_written() {
        let (store, coordinator) = coordinator();
        store.pause_writes();

        // Holds the store while the flush below is still waiting its turn.
        let seed = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move {
                let old = ChatMessage::new(MessageId(50), "seed", MessageSource::Other, UnixTimeMs(1), None);
                c.bulk_add_messages(&[old]).await
            }
        });
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        queue_n(&coordinator, 2);
        let flush = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.flush().await }
        });
        wait_until(|| coordinator.is_flushing()).await;

        let clear = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.clear_messages().await }
        });
        wait_until(|| coordinator.pending_count() == 0).await;

        store.resume_writes();
        seed.await.unwrap();
        flush.await.unwrap();
        clear.await.unwrap();

        assert_eq!(store.committed_batches(), 1);
        assert!(store.is_empty().await);
        assert!(!coordinator.is_flushing());
        assert_eq!(coordinator.metrics().flushes_abandoned, 1);
        assert_eq!(coordinator.metrics().flushes_committed, 0);
    }

    #[tokio::test]
    async fn test_load_reseeds_ids() {
        let (_store, coordinator) = coordinator();
        let seeded: Vec<ChatMessage> = [(3, 10), (7, 20), (2, 30)]
            .into_iter()
            .map(|(id, at)| ChatMessage::new(MessageId(id), "x", MessageSource::Other, UnixTimeMs(at), None))
            .collect();
        coordinator.bulk_add_messages(&seeded).await;

        let loaded = coordinator.load_messages().await;
        let ids: Vec<u64> = loaded.iter().map(|m| m.id().get()).collect();
        assert_eq!(ids, vec![3, 7, 2]);

        let next = coordinator.create_message("next", MessageSource::You, None);
        assert_eq!(next.id(), MessageId(8));
    }

    #[tokio::test]
    async fn test_load_empty_store() {
        let (_store, coordinator) = coordinator();
        assert!(coordinator.load_messages().await.is_empty());
        assert_eq!(coordinator.peek_next_id(), MessageId(1));
    }

    #[tokio::test]
    async fn test_load_failure_returns_empty() {
        let (store, coordinator) = coordinator();
        queue_n(&coordinator, 1);
        coordinator.flush().await;

        store.set_fail_reads(true);
        assert!(coordinator.load_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_returns_empty() {
        let (store, coordinator) = coordinator();
        store
            .put_batch(&[StoredRecord {
                id: 1,
                text: "bad".into(),
                source: 9,
                time_stamp: 1,
                inappropriate: None,
            }])
            .await
            .unwrap();
        assert!(coordinator.load_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let (store, coordinator) = coordinator();
        queue_n(&coordinator, 2);
        coordinator.flush().await;
        queue_n(&coordinator, 1);

        coordinator.clear_messages().await;
        assert_eq!(coordinator.pending_count(), 0);
        assert_eq!(coordinator.peek_next_id(), MessageId(1));
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_timer_flushes() {
        let (store, coordinator) = coordinator();
        let _subscription = coordinator.start_background_sync().unwrap();
        queue_n(&coordinator, 1);

        time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(coordinator.pending_count(), 1);

        time::sleep(Duration::from_millis(200)).await;
        wait_until(|| coordinator.pending_count() == 0).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_cancels_timer() {
        let (_store, coordinator) = coordinator();
        let subscription = coordinator.start_background_sync();
        assert!(subscription.is_some());
        assert!(coordinator.start_background_sync().is_none());
        assert!(coordinator.is_background_sync_active());

        coordinator.stop_background_sync();
        coordinator.stop_background_sync();
        assert!(!coordinator.is_background_sync_active());

        queue_n(&coordinator, 1);
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(coordinator.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_flush_finish() {
        let (store, coordinator) = coordinator();
        let _subscription = coordinator.start_background_sync().unwrap();
        queue_n(&coordinator, 1);
        store.pause_writes();

        time::sleep(Duration::from_millis(2_100)).await;
        wait_until(|| coordinator.is_flushing()).await;

        coordinator.stop_background_sync();
        store.resume_writes();
        wait_until(|| coordinator.pending_count() == 0).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_visibility_triggers_flush() {
        let (store, coordinator) = coordinator();
        let subscription = coordinator.start_background_sync().unwrap();
        queue_n(&coordinator, 2);

        coordinator.notify_lifecycle(PageLifecycle::Hidden);
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.pending_count(), 2);

        coordinator.notify_lifecycle(PageLifecycle::Visible);
        wait_until(|| coordinator.pending_count() == 0).await;
        assert_eq!(store.len().await, 2);
        assert!(subscription.is_active());
    }

    #[tokio::test]
    async fn test_unload_flushes_pending() {
        let (store, coordinator) = coordinator();
        let _subscription = coordinator.start_background_sync().unwrap();
        queue_n(&coordinator, 1);

        coordinator.notify_lifecycle(PageLifecycle::BeforeUnload);
        wait_until(|| coordinator.pending_count() == 0).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_teardown_detaches_lifecycle_triggers() {
        let (_store, coordinator) = coordinator();
        let subscription = coordinator.start_background_sync().unwrap();
        subscription.teardown();
        tokio::task::yield_now().await;

        queue_n(&coordinator, 1);
        coordinator.notify_lifecycle(PageLifecycle::Visible);
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.pending_count(), 1);
    }
}
