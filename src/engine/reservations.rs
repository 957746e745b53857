use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::observability::RESERVATIONS_TOTAL;
use crate::payment::{PaymentCallback, map_provider_status, with_retry};

use super::conflict::{ensure_available, now_ms, validate_id, validate_note, validate_span};
use super::holds::{finalize_events, release_events};
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub resource_id: Ulid,
    pub renter_id: String,
    pub span: Span,
    pub amount_cents: i64,
    /// Provider-side customer reference.
    pub customer_ref: String,
}

/// What a payment callback did to its rental.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Confirmed,
    Cancelled,
    /// Payment still in progress; nothing to do yet.
    Pending,
    /// Redelivery, or the rental already moved on.
    Unchanged,
}

/// `rental` moved to CANCELLED. A payment that never completed is marked failed.
pub(super) fn cancelled_copy(rental: &Rental, by: &str, reason: Option<String>, now: Ms) -> Rental {
    let mut next = rental.clone();
    next.status = RentalStatus::Cancelled;
    if next.payment.status == PaymentStatus::Pending {
        next.payment.status = PaymentStatus::Failed;
    }
    next.cancelled_by = Some(by.to_string());
    next.cancel_reason = reason;
    next.updated_at = now;
    next
}

fn rental_url(id: Ulid) -> String {
    format!("/rentals/{id}")
}

impl Engine {
    /// Open a reservation: PENDING rental, PENDING payment, and a hold on the
    /// calendar tagged with the new payment intent.
    pub async fn create_reservation(&self, req: ReservationRequest) -> Result<ReservationTicket, EngineError> {
        validate_span(&req.span)?;
        validate_id("renter_id", &req.renter_id)?;
        validate_id("customer_ref", &req.customer_ref)?;
        if req.amount_cents <= 0 {
            return Err(EngineError::Validation("amount must be positive".into()));
        }
        let cal = self.resource_or_not_found(req.resource_id)?;
        let ttl = self.settings.hold_max_age_ms;

        // Fail fast before talking to the payment provider.
        {
            let guard = cal.read().await;
            if guard.owner_id == req.renter_id {
                return Err(EngineError::Validation("owners cannot rent their own resource".into()));
            }
            ensure_available(&guard, &req.span, None, now_ms(), ttl)?;
        }

        let rental_id = Ulid::new();
        let idempotency_key = rental_id.to_string();
        let payments = &self.payments;
        let (amount, customer, key) = (req.amount_cents, req.customer_ref.as_str(), idempotency_key.as_str());
        let intent = with_retry(&self.settings.payment, "create_payment_intent", move || {
            payments.create_payment_intent(amount, customer, key)
        })
        .await?;

        let mut guard = cal.write().await;
        if guard.rentals.len() >= MAX_RENTALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many rentals on resource"));
        }
        if guard.blocks.len() >= MAX_BLOCKS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many blocks on resource"));
        }
        let now = now_ms();
        if let Err(e) = ensure_available(&guard, &req.span, None, now, ttl) {
            debug!("reservation for {} lost the race; intent {} left unused", req.resource_id, intent.id);
            return Err(e);
        }

        let rental = Rental {
            id: rental_id,
            resource_id: req.resource_id,
            renter_id: req.renter_id,
            owner_id: guard.owner_id.clone(),
            span: req.span,
            status: RentalStatus::Pending,
            payment: Payment {
                status: PaymentStatus::Pending,
                amount_cents: req.amount_cents,
                payment_intent_id: intent.id.clone(),
                completed_at: None,
            },
            created_at: now,
            updated_at: now,
            cancelled_by: None,
            cancel_reason: None,
        };
        let hold = BlockedPeriod {
            id: Ulid::new(),
            resource_id: req.resource_id,
            span: req.span,
            reason: BlockReason::temporary(intent.id.clone()),
            created_at: now,
            rental_id: Some(rental_id),
        };
        self.persist_and_apply(
            &mut guard,
            vec![Event::RentalCreated { rental: rental.clone() }, Event::BlockPlaced { block: hold }],
        )
        .await?;
        drop(guard);

        metrics::counter!(RESERVATIONS_TOTAL, "transition" => "created").increment(1);
        info!("rental {rental_id} requested on {} by {}", rental.resource_id, rental.renter_id);
        self.send_notification(Notification {
            user_id: rental.owner_id.clone(),
            kind: NotificationKind::BookingRequested,
            message: format!("New booking request from {}", rental.renter_id),
            action_url: rental_url(rental_id),
        });

        Ok(ReservationTicket {
            rental,
            payment_intent_id: intent.id,
            client_secret: intent.client_secret,
        })
    }

    /// PENDING → CONFIRMED once the provider has reported success. The hold is
    /// finalized in the same transaction. Confirming again is a no-op.
    pub async fn confirm_reservation(&self, rental_id: Ulid, payment_intent_id: &str) -> Result<Rental, EngineError> {
        validate_id("payment_intent_id", payment_intent_id)?;
        let mut guard = self.resolve_rental_write(&rental_id).await?;
        let rental = guard.rental(rental_id).cloned().ok_or(EngineError::NotFound(rental_id))?;
        if rental.payment.payment_intent_id != payment_intent_id {
            return Err(EngineError::Validation(format!(
                "payment intent {payment_intent_id} does not belong to rental {rental_id}"
            )));
        }
        match rental.status {
            RentalStatus::Pending => {}
            RentalStatus::Confirmed | RentalStatus::Active | RentalStatus::Completed => return Ok(rental),
            RentalStatus::Cancelled => {
                return Err(EngineError::InvalidState {
                    id: rental_id,
                    status: rental.status,
                    action: "confirm",
                });
            }
        }

        let now = now_ms();
        let mut confirmed = rental;
        confirmed.status = RentalStatus::Confirmed;
        confirmed.payment.status = PaymentStatus::Completed;
        confirmed.payment.completed_at = Some(now);
        confirmed.updated_at = now;

        let finalize = finalize_events(&guard, payment_intent_id, rental_id);
        if finalize.is_empty() {
            warn!("confirm: no hold left for {payment_intent_id}, confirming rental {rental_id} anyway");
        }
        let mut record = vec![Event::RentalUpdated { rental: confirmed.clone() }];
        record.extend(finalize);
        self.persist_and_apply(&mut guard, record).await?;
        drop(guard);

        metrics::counter!(RESERVATIONS_TOTAL, "transition" => "confirmed").increment(1);
        info!("rental {rental_id} confirmed");
        for user in [&confirmed.renter_id, &confirmed.owner_id] {
            self.send_notification(Notification {
                user_id: user.clone(),
                kind: NotificationKind::BookingConfirmed,
                message: "Booking confirmed".into(),
                action_url: rental_url(rental_id),
            });
        }
        Ok(confirmed)
    }

    /// Cancel on behalf of the renter or the owner. Every block standing for the
    /// rental is released in the same transaction.
    pub async fn cancel_reservation(
        &self,
        rental_id: Ulid,
        reason: Option<String>,
        actor_id: &str,
    ) -> Result<Cancellation, EngineError> {
        validate_id("actor_id", actor_id)?;
        validate_note(reason.as_deref())?;
        let mut guard = self.resolve_rental_write(&rental_id).await?;
        let rental = guard.rental(rental_id).cloned().ok_or(EngineError::NotFound(rental_id))?;
        if actor_id != rental.renter_id && actor_id != rental.owner_id {
            return Err(EngineError::Unauthorized {
                actor: actor_id.to_string(),
                target: rental_id,
            });
        }
        if !matches!(rental.status, RentalStatus::Pending | RentalStatus::Confirmed) {
            return Err(EngineError::InvalidState {
                id: rental_id,
                status: rental.status,
                action: "cancel",
            });
        }

        let now = now_ms();
        let cancelled = cancelled_copy(&rental, actor_id, reason.clone(), now);
        let release = release_events(&guard, &rental);
        let removed_hold = !release.is_empty();
        let mut record = vec![Event::RentalUpdated { rental: cancelled.clone() }];
        record.extend(release);
        self.persist_and_apply(&mut guard, record).await?;
        drop(guard);

        metrics::counter!(RESERVATIONS_TOTAL, "transition" => "cancelled").increment(1);
        info!("rental {rental_id} cancelled by {actor_id}");
        let other_party = if actor_id == cancelled.renter_id {
            &cancelled.owner_id
        } else {
            &cancelled.renter_id
        };
        self.send_notification(Notification {
            user_id: other_party.clone(),
            kind: NotificationKind::BookingCancelled,
            message: match &reason {
                Some(r) => format!("Booking cancelled: {r}"),
                None => "Booking cancelled".into(),
            },
            action_url: rental_url(rental_id),
        });

        Ok(Cancellation {
            rental_id,
            cancelled_by: actor_id.to_string(),
            reason,
            cancelled_at: now,
            removed_hold,
        })
    }

    /// CONFIRMED → ACTIVE at pickup. Owner only.
    pub async fn activate_rental(&self, rental_id: Ulid, actor_id: &str) -> Result<Rental, EngineError> {
        self.owner_transition(rental_id, actor_id, RentalStatus::Confirmed, RentalStatus::Active, "activate")
            .await
    }

    /// ACTIVE → COMPLETED at return. Owner only.
    pub async fn complete_rental(&self, rental_id: Ulid, actor_id: &str) -> Result<Rental, EngineError> {
        self.owner_transition(rental_id, actor_id, RentalStatus::Active, RentalStatus::Completed, "complete")
            .await
    }

    async fn owner_transition(
        &self,
        rental_id: Ulid,
        actor_id: &str,
        from: RentalStatus,
        to: RentalStatus,
        action: &'static str,
    ) -> Result<Rental, EngineError> {
        validate_id("actor_id", actor_id)?;
        let mut guard = self.resolve_rental_write(&rental_id).await?;
        let rental = guard.rental(rental_id).cloned().ok_or(EngineError::NotFound(rental_id))?;
        if actor_id != rental.owner_id {
            return Err(EngineError::Unauthorized {
                actor: actor_id.to_string(),
                target: rental_id,
            });
        }
        if rental.status == to {
            return Ok(rental);
        }
        if rental.status != from {
            return Err(EngineError::InvalidState {
                id: rental_id,
                status: rental.status,
                action,
            });
        }
        let mut next = rental;
        next.status = to;
        next.updated_at = now_ms();
        self.persist_and_apply(&mut guard, vec![Event::RentalUpdated { rental: next.clone() }])
            .await?;
        info!("rental {rental_id} is now {to}");
        Ok(next)
    }

    /// The renter walked away from checkout: drop the intent's hold. The
    /// PENDING rental is left for a late confirmation or the reaper. Never
    /// fails; returns whether a hold was removed.
    pub async fn abandon_checkout(&self, payment_intent_id: &str) -> bool {
        match self.remove_temporary_block(payment_intent_id).await {
            Ok(removed) => {
                if removed {
                    info!("checkout {payment_intent_id} abandoned, hold released");
                }
                removed
            }
            Err(e) => {
                warn!("abandon checkout {payment_intent_id}: {e}");
                false
            }
        }
    }

    /// Apply a provider callback. Safe under redelivery: the rental's current
    /// state decides, and the provider is asked for the authoritative status
    /// before anything is committed.
    pub async fn handle_payment_callback(&self, callback: PaymentCallback) -> Result<CallbackOutcome, EngineError> {
        let PaymentCallback {
            rental_id,
            payment_intent_id,
            status,
        } = callback;
        validate_id("payment_intent_id", &payment_intent_id)?;

        let before = {
            let resource_id = self
                .resource_for_rental(&rental_id)
                .ok_or(EngineError::NotFound(rental_id))?;
            let cal = self.resource_or_not_found(resource_id)?;
            let guard = cal.read().await;
            let rental = guard.rental(rental_id).ok_or(EngineError::NotFound(rental_id))?;
            if rental.payment.payment_intent_id != payment_intent_id {
                return Err(EngineError::Validation(format!(
                    "payment intent {payment_intent_id} does not belong to rental {rental_id}"
                )));
            }
            rental.status
        };

        if map_provider_status(&status) == PaymentStatus::Pending {
            return Ok(CallbackOutcome::Pending);
        }
        if before != RentalStatus::Pending {
            return Ok(CallbackOutcome::Unchanged);
        }

        let payments = &self.payments;
        let intent = payment_intent_id.as_str();
        let verified = with_retry(&self.settings.payment, "retrieve_payment_intent", move || {
            payments.retrieve_payment_intent(intent)
        })
        .await?;

        match map_provider_status(&verified) {
            PaymentStatus::Pending => Ok(CallbackOutcome::Pending),
            PaymentStatus::Completed => {
                self.confirm_reservation(rental_id, &payment_intent_id).await?;
                Ok(CallbackOutcome::Confirmed)
            }
            PaymentStatus::Failed => self.fail_payment(rental_id, &verified).await,
        }
    }

    async fn fail_payment(&self, rental_id: Ulid, provider_status: &str) -> Result<CallbackOutcome, EngineError> {
        let mut guard = self.resolve_rental_write(&rental_id).await?;
        let rental = guard.rental(rental_id).cloned().ok_or(EngineError::NotFound(rental_id))?;
        if rental.status != RentalStatus::Pending {
            return Ok(CallbackOutcome::Unchanged);
        }
        let cancelled = cancelled_copy(
            &rental,
            "payment_provider",
            Some(format!("payment {provider_status}")),
            now_ms(),
        );
        let mut record = vec![Event::RentalUpdated { rental: cancelled.clone() }];
        record.extend(release_events(&guard, &rental));
        self.persist_and_apply(&mut guard, record).await?;
        drop(guard);

        metrics::counter!(RESERVATIONS_TOTAL, "transition" => "payment_failed").increment(1);
        info!("rental {rental_id} cancelled: payment {provider_status}");
        self.send_notification(Notification {
            user_id: cancelled.renter_id.clone(),
            kind: NotificationKind::BookingCancelled,
            message: "Payment failed; your booking was cancelled".into(),
            action_url: rental_url(rental_id),
        });
        Ok(CallbackOutcome::Cancelled)
    }
}
