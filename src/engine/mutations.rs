use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{RwLock, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Record;

use super::conflict::{ensure_no_bookings, now_ms, validate_id, validate_note, validate_rule, validate_span};
use super::{Engine, EngineError, WalCommand, apply_to_calendar};

fn date_span(first: NaiveDate, last: NaiveDate) -> Result<Span, EngineError> {
    let span = Span::from_dates(first, last)
        .ok_or_else(|| EngineError::Validation(format!("end date {last} is before start date {first}")))?;
    validate_span(&span)?;
    Ok(span)
}

fn manual_block(resource_id: Ulid, span: Span, note: Option<String>, now: Ms) -> BlockedPeriod {
    BlockedPeriod {
        id: Ulid::new(),
        resource_id,
        span,
        reason: BlockReason::Manual { note },
        created_at: now,
        rental_id: None,
    }
}

fn ensure_owner(cal: &Calendar, actor_id: &str) -> Result<(), EngineError> {
    if cal.owner_id == actor_id {
        Ok(())
    } else {
        Err(EngineError::Unauthorized {
            actor: actor_id.to_string(),
            target: cal.id,
        })
    }
}

impl Engine {
    pub async fn create_resource(&self, id: Ulid, owner_id: &str, name: Option<String>) -> Result<(), EngineError> {
        validate_id("owner_id", owner_id)?;
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        let _catalog = self.catalog.lock().await;
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated {
            id,
            owner_id: owner_id.to_string(),
            name: name.clone(),
        };
        self.wal_append(&[event]).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(Calendar::new(id, owner_id.to_string(), name))));
        self.indexes.owners.entry(owner_id.to_string()).or_default().push(id);
        info!("resource {id} created for {owner_id}");
        Ok(())
    }

    /// Replace the rule for `rule.weekday`. Owner only.
    pub async fn set_weekly_rule(&self, resource_id: Ulid, actor_id: &str, rule: WeeklyRule) -> Result<(), EngineError> {
        validate_rule(&rule)?;
        let cal = self.resource_or_not_found(resource_id)?;
        let mut guard = cal.write().await;
        ensure_owner(&guard, actor_id)?;
        self.persist_and_apply(&mut guard, vec![Event::WeeklyRuleSet { resource_id, rule }])
            .await
    }

    /// Owner blocks the inclusive dates `first..=last`. Rentals and live holds
    /// in the way make this a conflict; other manual blocks do not.
    pub async fn block_dates(
        &self,
        resource_id: Ulid,
        actor_id: &str,
        first: NaiveDate,
        last: NaiveDate,
        note: Option<String>,
    ) -> Result<BlockedPeriod, EngineError> {
        let span = date_span(first, last)?;
        validate_note(note.as_deref())?;
        let cal = self.resource_or_not_found(resource_id)?;
        let mut guard = cal.write().await;
        ensure_owner(&guard, actor_id)?;
        if guard.blocks.len() >= MAX_BLOCKS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many blocks on resource"));
        }
        let now = now_ms();
        ensure_no_bookings(&guard, &span, now, self.settings.hold_max_age_ms)?;

        let block = manual_block(resource_id, span, note, now);
        self.persist_and_apply(&mut guard, vec![Event::BlockPlaced { block: block.clone() }])
            .await?;
        info!("resource {resource_id} blocked {first}..={last} by owner");
        Ok(block)
    }

    /// Block `first..=last` on every resource of `owner_id`, all or nothing.
    pub async fn block_owner_dates(
        &self,
        owner_id: &str,
        first: NaiveDate,
        last: NaiveDate,
        note: Option<String>,
    ) -> Result<Vec<BlockedPeriod>, EngineError> {
        validate_id("owner_id", owner_id)?;
        let span = date_span(first, last)?;
        validate_note(note.as_deref())?;

        let mut resource_ids = self
            .indexes
            .owners
            .get(owner_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        if resource_ids.is_empty() {
            return Ok(Vec::new());
        }
        // Acquire write locks in sorted order to prevent deadlocks.
        resource_ids.sort();
        resource_ids.dedup();

        let mut guards = Vec::with_capacity(resource_ids.len());
        for rid in &resource_ids {
            let cal = self.resource_or_not_found(*rid)?;
            guards.push(cal.write_owned().await);
        }

        // Phase 1: validate every calendar.
        let now = now_ms();
        for guard in &guards {
            if guard.blocks.len() >= MAX_BLOCKS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("too many blocks on resource"));
            }
            ensure_no_bookings(guard, &span, now, self.settings.hold_max_age_ms)?;
        }

        // Phase 2: one journal record for the whole batch, then apply.
        let blocks: Vec<BlockedPeriod> = resource_ids
            .iter()
            .map(|rid| manual_block(*rid, span, note.clone(), now))
            .collect();
        let record: Record = blocks
            .iter()
            .map(|b| Event::BlockPlaced { block: b.clone() })
            .collect();
        self.wal_append(&record).await?;
        for (guard, event) in guards.iter_mut().zip(&record) {
            apply_to_calendar(guard, event, &self.indexes);
        }
        info!("owner {owner_id} blocked {first}..={last} on {} resources", blocks.len());
        Ok(blocks)
    }

    /// Remove an owner block. Holds and rental records cannot be removed this way.
    pub async fn unblock(&self, resource_id: Ulid, block_id: Ulid, actor_id: &str) -> Result<BlockedPeriod, EngineError> {
        let cal = self.resource_or_not_found(resource_id)?;
        let mut guard = cal.write().await;
        ensure_owner(&guard, actor_id)?;
        let block = guard
            .blocks
            .iter()
            .find(|b| b.id == block_id)
            .cloned()
            .ok_or(EngineError::NotFound(block_id))?;
        if !block.reason.is_manual() {
            return Err(EngineError::Validation(format!("block {block_id} is {} and cannot be unblocked", block.reason)));
        }
        self.persist_and_apply(&mut guard, vec![Event::BlockRemoved { id: block_id, resource_id }])
            .await?;
        info!("resource {resource_id} unblocked {block_id}");
        Ok(block)
    }

    /// Rewrite the journal with only the events needed to recreate the current
    /// state, one record per resource. Holds every calendar's read lock and the
    /// catalog lock until the swap completes, so no commit can slip past the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();

        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(cal) = self.get_resource(id) {
                guards.push(cal.read_owned().await);
            }
        }

        let records: Vec<Record> = guards
            .iter()
            .map(|cal| {
                let mut record = vec![Event::ResourceCreated {
                    id: cal.id,
                    owner_id: cal.owner_id.clone(),
                    name: cal.name.clone(),
                }];
                record.extend(cal.rules.iter().flatten().map(|rule| Event::WeeklyRuleSet {
                    resource_id: cal.id,
                    rule: rule.clone(),
                }));
                record.extend(cal.blocks.iter().map(|b| Event::BlockPlaced { block: b.clone() }));
                record.extend(cal.rentals.iter().map(|r| Event::RentalCreated { rental: r.clone() }));
                record
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
