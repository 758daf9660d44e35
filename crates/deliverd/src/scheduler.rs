use crate::metrics;
use crate::policy::PolicyTable;
use crate::queue::{DeliveryStatus, Queue, QueueEntry, QueueState};
use crate::routing::{Destination, Relay, Router};
use crate::session::{ConnId, Session, SessionEvent};
use crate::unit::{MessageUnit, UnitRecipient};
use dns_mx::MxResolver;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How many ready recipients are pulled from the queue per batch
    #[serde(default = "SchedulerConfig::default_batch_size")]
    pub batch_size: usize,

    /// Ceiling on simultaneously open connections across all
    /// destinations; 0 = unlimited
    #[serde(default = "SchedulerConfig::default_global_connection_limit")]
    pub global_connection_limit: usize,

    /// Ceiling on simultaneously open connections to any single
    /// destination; 0 = unlimited
    #[serde(default)]
    pub destination_connection_limit: usize,

    /// Hard ceiling on batch wall clock. Connections still open when
    /// this expires are forcibly stopped, regardless of what phase
    /// they are in.
    #[serde(
        default = "SchedulerConfig::default_batch_timeout",
        with = "humantime_serde"
    )]
    pub batch_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            global_connection_limit: Self::default_global_connection_limit(),
            destination_connection_limit: 0,
            batch_timeout: Self::default_batch_timeout(),
        }
    }
}

impl SchedulerConfig {
    fn default_batch_size() -> usize {
        1024
    }

    fn default_global_connection_limit() -> usize {
        32
    }

    fn default_batch_timeout() -> Duration {
        Duration::from_secs(30 * 60)
    }
}

/// Requests the scheduler stop from another task. Stopping forcibly
/// aborts every open connection; in-flight recipients that have no
/// definitive outcome yet revert to Ready rather than being guessed
/// at.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

impl StopHandle {
    /// Returns true if no connections were active at the moment the
    /// stop was requested; otherwise the stop completes when the
    /// running batch drains and `run_batch` returns.
    pub fn stop(&self) -> bool {
        self.tx.send(true).ok();
        self.active.load(Ordering::SeqCst) == 0
    }
}

struct ActiveConnection {
    destination: Destination,
    assigned: HashSet<usize>,
}

/// All mutable state for one batch. Only the scheduler task touches
/// this; sessions interact with it exclusively through SessionEvents.
struct BatchState {
    entries: Vec<QueueEntry>,
    dests: Vec<Destination>,
    relays: Vec<Option<Arc<Relay>>>,
    /// Count of entries still in Ready state
    pending: usize,
    counts: HashMap<Destination, usize>,
    dead: HashMap<Destination, DeliveryStatus>,
    active: HashMap<ConnId, ActiveConnection>,
    task_conns: HashMap<tokio::task::Id, ConnId>,
    tasks: JoinSet<()>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    next_conn: ConnId,
    shutting_down: bool,
}

impl BatchState {
    fn new(entries: Vec<QueueEntry>, router: &Router) -> Self {
        let mut dests = Vec::with_capacity(entries.len());
        let mut relays = Vec::with_capacity(entries.len());
        for entry in &entries {
            let (dest, relay) = router.destination_for(entry);
            dests.push(dest);
            relays.push(relay);
        }
        let pending = entries.len();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            entries,
            dests,
            relays,
            pending,
            counts: HashMap::new(),
            dead: HashMap::new(),
            active: HashMap::new(),
            task_conns: HashMap::new(),
            tasks: JoinSet::new(),
            events_tx,
            events_rx,
            next_conn: 0,
            shutting_down: false,
        }
    }

    fn connections_for(&self, dest: &Destination) -> usize {
        self.counts.get(dest).copied().unwrap_or(0)
    }

    /// Drain the group of ready entries sharing the sender, message id
    /// and destination of the entry at `idx` into a unit, marking each
    /// drained entry Busy.
    fn build_unit_at(&mut self, idx: usize, max_recipients: usize) -> MessageUnit {
        let dest = self.dests[idx].clone();
        let (sender, message_id, body) = {
            let entry = &self.entries[idx];
            (
                entry.sender.clone(),
                entry.message_id.clone(),
                entry.body.clone(),
            )
        };

        let mut recipients = vec![];
        let mut j = idx;
        while j < self.entries.len() && recipients.len() < max_recipients.max(1) {
            let matches = {
                let entry = &self.entries[j];
                entry.is_ready()
                    && self.dests[j] == dest
                    && entry.message_id == message_id
                    && entry.sender == sender
            };
            if matches {
                self.entries[j].mark_busy();
                self.pending -= 1;
                recipients.push(UnitRecipient {
                    index: j,
                    mailbox: self.entries[j].recipient.clone(),
                });
            }
            j += 1;
        }

        MessageUnit::new(sender, message_id, dest, recipients, body)
    }

    /// Release the connection-count slot held by a finished connection
    fn release(&mut self, dest: &Destination) {
        if let Some(count) = self.counts.get_mut(dest) {
            *count = count.saturating_sub(1);
        }
        metrics::CONNECTION_GAUGE.dec();
    }

    /// Revert anything still Busy (aborted mid-flight) to Ready and
    /// hand the cache back for flushing
    fn finalize(mut self) -> Vec<QueueEntry> {
        for entry in &mut self.entries {
            if entry.state() == QueueState::Busy {
                entry.revert_ready();
            }
        }
        self.entries
    }
}

/// The batch orchestrator: owns the active connection set, the
/// per-destination connection counts and the batch cache, and is the
/// single writer for all of them.
pub struct Scheduler {
    queue: Arc<dyn Queue>,
    resolver: Arc<dyn MxResolver>,
    router: Arc<Router>,
    policies: Arc<PolicyTable>,
    config: SchedulerConfig,
    stop_rx: watch::Receiver<bool>,
    active_mirror: Arc<AtomicUsize>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn Queue>,
        resolver: Arc<dyn MxResolver>,
        router: Arc<Router>,
        policies: Arc<PolicyTable>,
        config: SchedulerConfig,
    ) -> (Self, StopHandle) {
        let (tx, stop_rx) = watch::channel(false);
        let active_mirror = Arc::new(AtomicUsize::new(0));
        let handle = StopHandle {
            tx: Arc::new(tx),
            active: active_mirror.clone(),
        };
        (
            Self {
                queue,
                resolver,
                router,
                policies,
                config,
                stop_rx,
                active_mirror,
            },
            handle,
        )
    }

    /// Pull one batch of ready recipients and deliver it. Returns
    /// false immediately when there is nothing to do, so the caller
    /// can back off onto a longer poll interval.
    ///
    /// Whatever happens mid-batch, every entry handed back to the
    /// queue is either Ready (to be retried by a later batch) or Done
    /// (settled, for retry scheduling or bounce generation); nothing
    /// is left Busy.
    pub async fn run_batch(&mut self) -> anyhow::Result<bool> {
        if *self.stop_rx.borrow() {
            return Ok(false);
        }

        let entries = self.queue.fetch_ready(self.config.batch_size).await?;
        if entries.is_empty() {
            return Ok(false);
        }
        metrics::BATCHES_RUN.inc();
        tracing::debug!("starting batch of {} recipients", entries.len());

        let mut batch = BatchState::new(entries, &self.router);
        self.partition(&mut batch);
        self.drive(&mut batch).await;

        let entries = batch.finalize();
        self.active_mirror.store(0, Ordering::SeqCst);
        self.queue.flush(entries).await?;
        Ok(true)
    }

    /// Single scan over the cache: group ready entries into units and
    /// open a connection per unit, respecting both ceilings. Entries
    /// for a destination at its ceiling stay Ready and are revisited
    /// by refill or by a later batch.
    fn partition(&mut self, batch: &mut BatchState) {
        let mut idx = 0;
        while idx < batch.entries.len() && batch.pending > 0 {
            if self.config.global_connection_limit != 0
                && batch.active.len() >= self.config.global_connection_limit
            {
                break;
            }
            if !batch.entries[idx].is_ready() {
                idx += 1;
                continue;
            }
            let dest = batch.dests[idx].clone();
            if batch.dead.contains_key(&dest) {
                idx += 1;
                continue;
            }
            if self.config.destination_connection_limit != 0
                && batch.connections_for(&dest) >= self.config.destination_connection_limit
            {
                idx += 1;
                continue;
            }

            let unit =
                batch.build_unit_at(idx, self.policies.default.max_recipients_per_message);
            self.dispatch(batch, unit);
            idx += 1;
        }
    }

    fn dispatch(&self, batch: &mut BatchState, unit: MessageUnit) {
        let conn = batch.next_conn;
        batch.next_conn += 1;

        let dest = unit.destination.clone();
        let assigned: HashSet<usize> = unit.recipients.iter().map(|r| r.index).collect();
        let relay = match &dest {
            Destination::Relay(_) => unit
                .recipients
                .first()
                .and_then(|r| batch.relays[r.index].clone()),
            Destination::Domain(_) => None,
        };

        *batch.counts.entry(dest.clone()).or_default() += 1;
        batch.active.insert(
            conn,
            ActiveConnection {
                destination: dest.clone(),
                assigned,
            },
        );
        self.active_mirror
            .store(batch.active.len(), Ordering::SeqCst);
        metrics::TOTAL_CONNECTIONS.inc();
        metrics::CONNECTION_GAUGE.inc();

        tracing::debug!(
            "connection {conn}: dispatching {} recipient(s) to {dest}",
            unit.recipients.len()
        );

        let session = Session::new(
            conn,
            dest,
            relay,
            unit,
            self.resolver.clone(),
            self.policies.clone(),
            batch.events_tx.clone(),
        );
        let handle = batch.tasks.spawn(session.run());
        batch.task_conns.insert(handle.id(), conn);
    }

    /// Process session events until every connection has drained,
    /// layering the watchdog and stop signal over them.
    async fn drive(&mut self, batch: &mut BatchState) {
        enum Wake {
            Event(Option<SessionEvent>),
            Joined(Option<Result<(tokio::task::Id, ()), tokio::task::JoinError>>),
            Watchdog,
            Stop(bool),
        }

        let watchdog = tokio::time::sleep(self.config.batch_timeout);
        tokio::pin!(watchdog);
        let mut watchdog_armed = true;
        let mut stop_watch_live = true;

        while !batch.active.is_empty() {
            let have_tasks = !batch.tasks.is_empty();
            let wake = tokio::select! {
                event = batch.events_rx.recv() => Wake::Event(event),
                joined = batch.tasks.join_next_with_id(), if have_tasks => {
                    Wake::Joined(joined)
                }
                _ = &mut watchdog, if watchdog_armed => Wake::Watchdog,
                changed = self.stop_rx.changed(), if stop_watch_live => {
                    Wake::Stop(changed.is_ok())
                }
            };

            match wake {
                Wake::Event(Some(event)) => self.handle_event(batch, event),
                Wake::Event(None) => {}
                Wake::Joined(Some(Ok((task_id, ())))) => {
                    // Clean exit; the session's Closed event carries
                    // the bookkeeping
                    batch.task_conns.remove(&task_id);
                }
                Wake::Joined(Some(Err(join_err))) => {
                    // Aborted by the watchdog or a stop request. No
                    // Closed event was sent: the assigned entries stay
                    // Busy and revert to Ready at finalize.
                    if let Some(conn) = batch.task_conns.remove(&join_err.id()) {
                        if let Some(active) = batch.active.remove(&conn) {
                            batch.release(&active.destination);
                            self.active_mirror
                                .store(batch.active.len(), Ordering::SeqCst);
                        }
                    }
                }
                Wake::Joined(None) => {}
                Wake::Watchdog => {
                    watchdog_armed = false;
                    tracing::warn!(
                        "batch watchdog expired; stopping {} slow connection(s)",
                        batch.active.len()
                    );
                    batch.shutting_down = true;
                    batch.tasks.abort_all();
                }
                Wake::Stop(live) => {
                    if !live {
                        stop_watch_live = false;
                    } else if *self.stop_rx.borrow() {
                        tracing::info!(
                            "stop requested; aborting {} open connection(s)",
                            batch.active.len()
                        );
                        batch.shutting_down = true;
                        batch.tasks.abort_all();
                    }
                }
            }
        }

        // Events can still be queued behind the final task exits.
        // Outcomes that were decided before a stop are still applied;
        // a confirmed result is never thrown away.
        while let Ok(event) = batch.events_rx.try_recv() {
            self.handle_event(batch, event);
        }
    }

    fn handle_event(&self, batch: &mut BatchState, event: SessionEvent) {
        match event {
            SessionEvent::Recipient {
                conn,
                index,
                status,
            } => {
                metrics::count_disposition(&status);
                if let Some(active) = batch.active.get_mut(&conn) {
                    active.assigned.remove(&index);
                }
                batch.entries[index].record(status);
            }

            SessionEvent::RequestRefill { conn, reply } => {
                match self.build_refill(batch, conn) {
                    Some(unit) => {
                        let indices: Vec<usize> =
                            unit.recipients.iter().map(|r| r.index).collect();
                        if reply.send(Some(unit)).is_err() {
                            // The session died between asking and
                            // receiving; put the entries back
                            for index in indices {
                                batch.entries[index].revert_ready();
                                batch.pending += 1;
                            }
                            if let Some(active) = batch.active.get_mut(&conn) {
                                active.assigned.clear();
                            }
                        }
                    }
                    None => {
                        reply.send(None).ok();
                    }
                }
            }

            SessionEvent::DestinationFailed { conn, status } => {
                metrics::DOMAIN_ERRORS.inc();
                let dest = match batch.active.get_mut(&conn) {
                    Some(active) => {
                        // The in-flight unit first
                        let assigned: Vec<usize> = active.assigned.drain().collect();
                        for index in assigned {
                            metrics::count_disposition(&status);
                            batch.entries[index].record_incomplete(status.clone());
                        }
                        active.destination.clone()
                    }
                    None => return,
                };

                // Then every other pending entry for the same
                // destination: no further connection attempts are made
                // to it this batch
                tracing::debug!(
                    "{dest}: applying domain error to pending entries: {}",
                    status.to_single_line()
                );
                for index in 0..batch.entries.len() {
                    if batch.entries[index].is_ready() && batch.dests[index] == dest {
                        metrics::count_disposition(&status);
                        batch.entries[index].record(status.clone());
                        batch.pending -= 1;
                    }
                }
                batch.dead.insert(dest, status);
            }

            SessionEvent::Closed { conn, error } => {
                let Some(mut active) = batch.active.remove(&conn) else {
                    return;
                };
                if let Some(error) = &error {
                    // Premature disconnect: whatever was not decided
                    // fails transiently. A confirmed success for a
                    // recipient of this unit has already been recorded
                    // and stays recorded.
                    let status = DeliveryStatus::with_code_and_message(
                        421,
                        &format!(
                            "4.4.2 connection to {} ended prematurely: {error}",
                            active.destination
                        ),
                    );
                    let assigned: Vec<usize> = active.assigned.drain().collect();
                    for index in assigned {
                        metrics::count_disposition(&status);
                        batch.entries[index].record_incomplete(status.clone());
                    }
                }
                batch.release(&active.destination);
                self.active_mirror
                    .store(batch.active.len(), Ordering::SeqCst);
            }
        }
    }

    /// Build another unit for the destination served by `conn`, if the
    /// batch is still running, the destination is still healthy, and
    /// there is anything left for it.
    fn build_refill(&self, batch: &mut BatchState, conn: ConnId) -> Option<MessageUnit> {
        if batch.shutting_down {
            return None;
        }
        let dest = batch.active.get(&conn)?.destination.clone();
        if batch.dead.contains_key(&dest) {
            return None;
        }
        let idx = (0..batch.entries.len())
            .find(|&i| batch.entries[i].is_ready() && batch.dests[i] == dest)?;

        let unit = batch.build_unit_at(idx, self.policies.default.max_recipients_per_message);
        if let Some(active) = batch.active.get_mut(&conn) {
            active.assigned = unit.recipients.iter().map(|r| r.index).collect();
        }
        tracing::debug!(
            "connection {conn}: refilled with {} recipient(s) for {dest}",
            unit.recipients.len()
        );
        Some(unit)
    }
}
