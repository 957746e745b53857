mod availability;
mod conflict;
mod error;
mod holds;
mod mutations;
mod queries;
mod reservations;

pub use availability::{check_range, effective_span, free_windows, merge_overlapping, subtract_intervals, unavailable_dates};
pub use error::EngineError;
pub use reservations::{CallbackOutcome, ReservationRequest};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotificationSink};
use crate::payment::{PaymentProvider, RetryPolicy};
use crate::wal::{Record, Wal};

pub type SharedCalendar = Arc<RwLock<Calendar>>;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Age after which a temporary block stops counting and may be reaped.
    pub hold_max_age_ms: Ms,
    pub payment: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hold_max_age_ms: HOUR_MS,
            payment: RetryPolicy::default(),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Record, oneshot::Sender<io::Result<()>>);

/// Background task that owns the journal and batches appends for group commit.
/// Every record waiting in the channel is buffered, then one fsync covers the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't ride along
    // with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let batch = vec![(record, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

/// Secondary lookups, kept in step with the calendars by `apply_to_calendar`.
#[derive(Default)]
pub(super) struct Indexes {
    /// Rental id → resource id.
    pub(super) rentals: DashMap<Ulid, Ulid>,
    /// Payment intent id → resource holding its temporary blocks.
    pub(super) intents: DashMap<String, Ulid>,
    /// Owner id → owned resources.
    pub(super) owners: DashMap<String, Vec<Ulid>>,
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedCalendar>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) notify: Arc<dyn NotificationSink>,
    pub(super) payments: Arc<dyn PaymentProvider>,
    pub(super) settings: EngineSettings,
    pub(super) indexes: Indexes,
    /// Serializes resource creation against compaction snapshots.
    pub(super) catalog: Mutex<()>,
}

/// Apply an event to a calendar. The caller holds the write lock.
pub(super) fn apply_to_calendar(cal: &mut Calendar, event: &Event, idx: &Indexes) {
    match event {
        Event::WeeklyRuleSet { rule, .. } => cal.set_rule(rule.clone()),
        Event::BlockPlaced { block } => {
            if let Some(intent) = block.reason.payment_intent_id() {
                idx.intents.insert(intent.to_string(), cal.id);
            }
            cal.insert_block(block.clone());
        }
        Event::BlockRetagged { id, reason, .. } => {
            let Some(block) = cal.block_mut(*id) else { return };
            let previous = std::mem::replace(&mut block.reason, reason.clone());
            if let BlockReason::Confirmed { rental_id } = reason {
                block.rental_id.get_or_insert(*rental_id);
            }
            if let Some(intent) = reason.payment_intent_id() {
                idx.intents.insert(intent.to_string(), cal.id);
            }
            if let Some(intent) = previous.payment_intent_id() {
                forget_intent_if_unused(cal, intent, idx);
            }
        }
        Event::BlockRemoved { id, .. } => {
            if let Some(block) = cal.remove_block(*id)
                && let Some(intent) = block.reason.payment_intent_id()
            {
                forget_intent_if_unused(cal, intent, idx);
            }
        }
        Event::RentalCreated { rental } => {
            idx.rentals.insert(rental.id, cal.id);
            cal.insert_rental(rental.clone());
        }
        Event::RentalUpdated { rental } => cal.replace_rental(rental.clone()),
        // Handled at the DashMap level, not here
        Event::ResourceCreated { .. } => {}
    }
}

fn forget_intent_if_unused(cal: &Calendar, intent: &str, idx: &Indexes) {
    if cal.blocks_for_intent(intent).next().is_none() {
        idx.intents.remove_if(intent, |_, rid| *rid == cal.id);
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<dyn NotificationSink>,
        payments: Arc<dyn PaymentProvider>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let indexes = Indexes::default();
        let mut calendars: HashMap<Ulid, Calendar> = HashMap::new();
        for event in &events {
            match event {
                Event::ResourceCreated { id, owner_id, name } => {
                    calendars.insert(*id, Calendar::new(*id, owner_id.clone(), name.clone()));
                    indexes.owners.entry(owner_id.clone()).or_default().push(*id);
                }
                other => {
                    if let Some(cal) = calendars.get_mut(&other.resource_id()) {
                        apply_to_calendar(cal, other, &indexes);
                    } else {
                        warn!("replay: event for unknown resource {}", other.resource_id());
                    }
                }
            }
        }

        let state = DashMap::new();
        for (id, cal) in calendars {
            state.insert(id, Arc::new(RwLock::new(cal)));
        }

        Ok(Self {
            state,
            wal_tx,
            notify,
            payments,
            settings,
            indexes,
            catalog: Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Write one transaction record via the background group-commit writer.
    pub(super) async fn wal_append(&self, record: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record: record.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedCalendar> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub(super) fn resource_or_not_found(&self, id: Ulid) -> Result<SharedCalendar, EngineError> {
        self.get_resource(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn resource_for_rental(&self, rental_id: &Ulid) -> Option<Ulid> {
        self.indexes.rentals.get(rental_id).map(|e| *e.value())
    }

    pub fn resource_for_intent(&self, payment_intent_id: &str) -> Option<Ulid> {
        self.indexes.intents.get(payment_intent_id).map(|e| *e.value())
    }

    /// Journal one record, then apply it. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(&self, cal: &mut Calendar, record: Vec<Event>) -> Result<(), EngineError> {
        if record.is_empty() {
            return Ok(());
        }
        self.wal_append(&record).await?;
        for event in &record {
            apply_to_calendar(cal, event, &self.indexes);
        }
        Ok(())
    }

    /// Lookup rental → resource, get the calendar, acquire its write lock.
    pub(super) async fn resolve_rental_write(
        &self,
        rental_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Calendar>, EngineError> {
        let resource_id = self
            .resource_for_rental(rental_id)
            .ok_or(EngineError::NotFound(*rental_id))?;
        let cal = self.resource_or_not_found(resource_id)?;
        Ok(cal.write_owned().await)
    }

    /// Lookup intent → resource and acquire its write lock. `None` when no block carries the intent.
    pub(super) async fn resolve_intent_write(&self, payment_intent_id: &str) -> Option<OwnedRwLockWriteGuard<Calendar>> {
        let resource_id = self.resource_for_intent(payment_intent_id)?;
        let cal = self.get_resource(&resource_id)?;
        Some(cal.write_owned().await)
    }

    /// Fire-and-forget delivery. Failures are logged, never surfaced.
    pub(super) fn send_notification(&self, notification: Notification) {
        let user = notification.user_id.clone();
        let kind = notification.kind;
        match self.notify.notify(notification) {
            Ok(()) => metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "sent").increment(1),
            Err(e) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "failed").increment(1);
                warn!("notification {kind:?} to {user} failed: {e}");
            }
        }
    }
}
