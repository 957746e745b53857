use std::time::Instant;

use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::observability::{HOLDS_TOTAL, RESERVATIONS_TOTAL, SWEEP_DURATION_SECONDS};

use super::conflict::{ensure_available, now_ms, validate_id, validate_span};
use super::reservations::cancelled_copy;
use super::{Engine, EngineError, forget_intent_if_unused};

/// Retag every block held by `payment_intent_id` as confirmed for `rental_id`.
/// Empty when nothing carries the intent any more.
pub(super) fn finalize_events(cal: &Calendar, payment_intent_id: &str, rental_id: Ulid) -> Vec<Event> {
    cal.blocks_for_intent(payment_intent_id)
        .map(|b| Event::BlockRetagged {
            id: b.id,
            resource_id: cal.id,
            reason: BlockReason::Confirmed { rental_id },
        })
        .collect()
}

fn removal_events<'a>(cal: &Calendar, blocks: impl Iterator<Item = &'a BlockedPeriod>) -> Vec<Event> {
    blocks
        .map(|b| Event::BlockRemoved {
            id: b.id,
            resource_id: cal.id,
        })
        .collect()
}

/// Remove every block standing for `rental`: its hold, and its confirmed record.
pub(super) fn release_events(cal: &Calendar, rental: &Rental) -> Vec<Event> {
    let intent = rental.payment.payment_intent_id.as_str();
    removal_events(
        cal,
        cal.blocks.iter().filter(|b| {
            b.rental_id == Some(rental.id)
                || b.reason.payment_intent_id() == Some(intent)
                || b.reason == BlockReason::Confirmed { rental_id: rental.id }
        }),
    )
}

impl Engine {
    /// Hold `span` for an in-flight payment. Re-checks availability under the
    /// resource's write lock, so overlapping holds cannot both succeed.
    ///
    /// Placing the same intent on the same span again returns the existing hold.
    pub async fn place_temporary_block(
        &self,
        resource_id: Ulid,
        span: Span,
        payment_intent_id: &str,
    ) -> Result<BlockedPeriod, EngineError> {
        validate_span(&span)?;
        validate_id("payment_intent_id", payment_intent_id)?;
        let cal = self.resource_or_not_found(resource_id)?;
        let mut guard = cal.write().await;
        let now = now_ms();
        let ttl = self.settings.hold_max_age_ms;

        if let Some(existing) = guard
            .blocks_for_intent(payment_intent_id)
            .find(|b| b.span == span && b.occupies(now, ttl))
        {
            return Ok(existing.clone());
        }
        // Claim the intent for this resource before checking anything else, so
        // the same intent racing onto two resources cannot land on both.
        match self.indexes.intents.entry(payment_intent_id.to_string()) {
            Entry::Occupied(claimed) if *claimed.get() != resource_id => {
                return Err(EngineError::Validation(format!(
                    "payment intent {payment_intent_id} already holds resource {}",
                    claimed.get()
                )));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(resource_id);
            }
        }

        let placed = self.insert_hold(&mut guard, resource_id, span, payment_intent_id, now).await;
        if placed.is_err() {
            forget_intent_if_unused(&guard, payment_intent_id, &self.indexes);
        }
        placed
    }

    async fn insert_hold(
        &self,
        cal: &mut Calendar,
        resource_id: Ulid,
        span: Span,
        payment_intent_id: &str,
        now: Ms,
    ) -> Result<BlockedPeriod, EngineError> {
        if cal.blocks.len() >= MAX_BLOCKS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many blocks on resource"));
        }
        ensure_available(cal, &span, None, now, self.settings.hold_max_age_ms)?;

        let block = BlockedPeriod {
            id: Ulid::new(),
            resource_id,
            span,
            reason: BlockReason::temporary(payment_intent_id),
            created_at: now,
            rental_id: None,
        };
        self.persist_and_apply(cal, vec![Event::BlockPlaced { block: block.clone() }])
            .await?;
        metrics::counter!(HOLDS_TOTAL, "action" => "placed").increment(1);
        info!("hold {} placed on {resource_id} for {payment_intent_id}", block.id);
        Ok(block)
    }

    /// Turn the intent's holds into permanent records. Returns how many blocks
    /// were rewritten; zero (logged) when the hold is already gone.
    pub async fn finalize_temporary_block(&self, payment_intent_id: &str, rental_id: Ulid) -> Result<usize, EngineError> {
        validate_id("payment_intent_id", payment_intent_id)?;
        let Some(mut guard) = self.resolve_intent_write(payment_intent_id).await else {
            warn!("finalize: no hold found for {payment_intent_id} (rental {rental_id})");
            return Ok(0);
        };
        // Compare-and-rewrite: only blocks still tagged with the intent qualify.
        let events = finalize_events(&guard, payment_intent_id, rental_id);
        if events.is_empty() {
            warn!("finalize: hold for {payment_intent_id} disappeared before rewrite");
            return Ok(0);
        }
        let count = events.len();
        self.persist_and_apply(&mut guard, events).await?;
        metrics::counter!(HOLDS_TOTAL, "action" => "finalized").increment(count as u64);
        info!("finalized {count} hold(s) for {payment_intent_id} as rental {rental_id}");
        Ok(count)
    }

    /// Delete the intent's holds. `true` if anything was removed.
    pub async fn remove_temporary_block(&self, payment_intent_id: &str) -> Result<bool, EngineError> {
        if payment_intent_id.is_empty() {
            return Ok(false);
        }
        let Some(mut guard) = self.resolve_intent_write(payment_intent_id).await else {
            return Ok(false);
        };
        let events = removal_events(&guard, guard.blocks_for_intent(payment_intent_id));
        if events.is_empty() {
            return Ok(false);
        }
        let count = events.len();
        self.persist_and_apply(&mut guard, events).await?;
        metrics::counter!(HOLDS_TOTAL, "action" => "removed").increment(count as u64);
        debug!("removed {count} hold(s) for {payment_intent_id}");
        Ok(true)
    }

    pub async fn sweep_expired_holds(&self, max_age_ms: Ms) -> Result<SweepReport, EngineError> {
        self.sweep_expired_holds_at(max_age_ms, now_ms()).await
    }

    /// Delete temporary blocks created at least `max_age_ms` before `now`, and
    /// expire PENDING rentals of the same age that no longer have a live hold.
    ///
    /// Deletion is decided under each resource's write lock against the
    /// current reason, so a block finalized first is never touched.
    pub async fn sweep_expired_holds_at(&self, max_age_ms: Ms, now: Ms) -> Result<SweepReport, EngineError> {
        if max_age_ms <= 0 {
            return Err(EngineError::Validation(format!(
                "max_age_ms must be positive, got {max_age_ms}"
            )));
        }
        let started = Instant::now();
        let mut report = SweepReport::default();
        let calendars: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();

        for cal in calendars {
            let is_stale = |created_at: Ms| now - created_at >= max_age_ms;
            {
                let guard = cal.read().await;
                let anything = guard.blocks.iter().any(|b| b.reason.is_temporary() && is_stale(b.created_at))
                    || guard
                        .rentals
                        .iter()
                        .any(|r| r.status == RentalStatus::Pending && is_stale(r.created_at));
                if !anything {
                    continue;
                }
            }

            let mut guard = cal.write().await;
            let expired_blocks: Vec<BlockedPeriod> = guard
                .blocks
                .iter()
                .filter(|b| b.reason.is_temporary() && is_stale(b.created_at))
                .cloned()
                .collect();

            let live_hold = |rental: &Rental| {
                guard.blocks.iter().any(|b| {
                    b.reason.is_temporary()
                        && (b.rental_id == Some(rental.id)
                            || b.reason.payment_intent_id() == Some(rental.payment.payment_intent_id.as_str()))
                        && !is_stale(b.created_at)
                })
            };
            let expired_rentals: Vec<Rental> = guard
                .rentals
                .iter()
                .filter(|r| r.status == RentalStatus::Pending && is_stale(r.created_at) && !live_hold(r))
                .map(|r| cancelled_copy(r, "system", Some("payment hold expired".into()), now))
                .collect();

            if expired_blocks.is_empty() && expired_rentals.is_empty() {
                continue;
            }

            let mut record = removal_events(&guard, expired_blocks.iter());
            record.extend(
                expired_rentals
                    .iter()
                    .map(|r| Event::RentalUpdated { rental: r.clone() }),
            );
            self.persist_and_apply(&mut guard, record).await?;
            drop(guard);

            for block in &expired_blocks {
                info!("reaped expired hold {} ({}) on {}", block.id, block.reason, block.resource_id);
            }
            metrics::counter!(HOLDS_TOTAL, "action" => "reaped").increment(expired_blocks.len() as u64);
            metrics::counter!(RESERVATIONS_TOTAL, "transition" => "expired").increment(expired_rentals.len() as u64);
            for rental in &expired_rentals {
                info!("rental {} expired: payment never completed", rental.id);
                self.send_notification(Notification {
                    user_id: rental.renter_id.clone(),
                    kind: NotificationKind::HoldExpired,
                    message: "Your reservation hold expired before payment completed".into(),
                    action_url: format!("/rentals/{}", rental.id),
                });
            }

            report.removed_count += expired_blocks.len();
            report.removed_blocks.extend(expired_blocks);
            report.expired_rentals.extend(expired_rentals.iter().map(|r| r.id));
        }

        metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(report)
    }
}
