use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Weekday};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, ReservationRequest};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability::{COMMAND_DURATION_SECONDS, COMMANDS_TOTAL};
use crate::payment::PaymentCallback;

#[derive(Debug, Clone, Deserialize)]
pub struct WireSlot {
    pub start: String,
    pub end: String,
}

/// Weekly rule as clients send it: slots as `"HH:MM"` strings.
#[derive(Debug, Clone, Deserialize)]
pub struct WireRule {
    pub weekday: Weekday,
    pub available: bool,
    #[serde(default)]
    pub slots: Vec<WireSlot>,
}

impl TryFrom<WireRule> for WeeklyRule {
    type Error = EngineError;

    fn try_from(rule: WireRule) -> Result<Self, Self::Error> {
        let slots = rule
            .slots
            .iter()
            .map(|s| TimeSlot::parse(&s.start, &s.end))
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::Validation)?;
        Ok(WeeklyRule {
            weekday: rule.weekday,
            available: rule.available,
            slots,
        })
    }
}

/// One request per line: `{"op": "...", ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateResource {
        id: Option<Ulid>,
        owner_id: String,
        name: Option<String>,
    },
    GetResource {
        resource_id: Ulid,
    },
    SetWeeklyRule {
        resource_id: Ulid,
        actor_id: String,
        rule: WireRule,
    },
    CheckAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_rental: Option<Ulid>,
    },
    UnavailableDates {
        resource_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    },
    FreeWindows {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    CreateReservation {
        resource_id: Ulid,
        renter_id: String,
        start: Ms,
        end: Ms,
        amount_cents: i64,
        customer_ref: String,
    },
    ConfirmReservation {
        rental_id: Ulid,
        payment_intent_id: String,
    },
    CancelReservation {
        rental_id: Ulid,
        actor_id: String,
        reason: Option<String>,
    },
    ActivateRental {
        rental_id: Ulid,
        actor_id: String,
    },
    CompleteRental {
        rental_id: Ulid,
        actor_id: String,
    },
    AbandonCheckout {
        payment_intent_id: String,
    },
    PaymentCallback {
        rental_id: Ulid,
        payment_intent_id: String,
        status: String,
    },
    PlaceTemporaryBlock {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        payment_intent_id: String,
    },
    FinalizeTemporaryBlock {
        payment_intent_id: String,
        rental_id: Ulid,
    },
    RemoveTemporaryBlock {
        payment_intent_id: String,
    },
    BlockDates {
        resource_id: Ulid,
        actor_id: String,
        start_date: NaiveDate,
        end_date: NaiveDate,
        note: Option<String>,
    },
    BlockOwnerDates {
        owner_id: String,
        start_date: NaiveDate,
        end_date: NaiveDate,
        note: Option<String>,
    },
    Unblock {
        resource_id: Ulid,
        block_id: Ulid,
        actor_id: String,
    },
    SweepExpiredHolds {
        max_age_ms: Option<Ms>,
    },
    GetRental {
        rental_id: Ulid,
    },
    ListBlocks {
        resource_id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    ListRentals {
        resource_id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
    },
}

impl Request {
    /// Short label for metrics.
    pub fn op(&self) -> &'static str {
        match self {
            Request::CreateResource { .. } => "create_resource",
            Request::GetResource { .. } => "get_resource",
            Request::SetWeeklyRule { .. } => "set_weekly_rule",
            Request::CheckAvailability { .. } => "check_availability",
            Request::UnavailableDates { .. } => "unavailable_dates",
            Request::FreeWindows { .. } => "free_windows",
            Request::CreateReservation { .. } => "create_reservation",
            Request::ConfirmReservation { .. } => "confirm_reservation",
            Request::CancelReservation { .. } => "cancel_reservation",
            Request::ActivateRental { .. } => "activate_rental",
            Request::CompleteRental { .. } => "complete_rental",
            Request::AbandonCheckout { .. } => "abandon_checkout",
            Request::PaymentCallback { .. } => "payment_callback",
            Request::PlaceTemporaryBlock { .. } => "place_temporary_block",
            Request::FinalizeTemporaryBlock { .. } => "finalize_temporary_block",
            Request::RemoveTemporaryBlock { .. } => "remove_temporary_block",
            Request::BlockDates { .. } => "block_dates",
            Request::BlockOwnerDates { .. } => "block_owner_dates",
            Request::Unblock { .. } => "unblock",
            Request::SweepExpiredHolds { .. } => "sweep_expired_holds",
            Request::GetRental { .. } => "get_rental",
            Request::ListBlocks { .. } => "list_blocks",
            Request::ListRentals { .. } => "list_rentals",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(code: &str, message: String, conflicts: Option<Value>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message,
                conflicts,
            }),
        }
    }

    fn from_error(e: &EngineError) -> Self {
        let conflicts = match e {
            EngineError::Conflict(list) => serde_json::to_value(list).ok(),
            _ => None,
        };
        Self::failure(e.code(), e.to_string(), conflicts)
    }
}

fn span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    Span::checked(start, end).ok_or_else(|| EngineError::Validation("range end must be after start".into()))
}

fn optional_window(start: Option<Ms>, end: Option<Ms>) -> Result<Option<Span>, EngineError> {
    match (start, end) {
        (Some(s), Some(e)) => span(s, e).map(Some),
        (None, None) => Ok(None),
        _ => Err(EngineError::Validation("give both start and end, or neither".into())),
    }
}

fn data<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Validation(format!("unencodable result: {e}")))
}

/// Run one request against the engine.
pub async fn execute(engine: &Engine, request: Request) -> Result<Value, EngineError> {
    match request {
        Request::CreateResource { id, owner_id, name } => {
            let id = id.unwrap_or_else(Ulid::new);
            engine.create_resource(id, &owner_id, name).await?;
            data(serde_json::json!({ "id": id }))
        }
        Request::GetResource { resource_id } => data(engine.get_resource_info(resource_id).await?),
        Request::SetWeeklyRule {
            resource_id,
            actor_id,
            rule,
        } => {
            engine
                .set_weekly_rule(resource_id, &actor_id, WeeklyRule::try_from(rule)?)
                .await?;
            Ok(Value::Null)
        }
        Request::CheckAvailability {
            resource_id,
            start,
            end,
            exclude_rental,
        } => data(
            engine
                .check_availability(resource_id, span(start, end)?, exclude_rental)
                .await?,
        ),
        Request::UnavailableDates { resource_id, from, to } => {
            data(engine.list_unavailable_dates(resource_id, from, to).await?)
        }
        Request::FreeWindows { resource_id, start, end } => {
            data(engine.free_windows(resource_id, span(start, end)?).await?)
        }
        Request::CreateReservation {
            resource_id,
            renter_id,
            start,
            end,
            amount_cents,
            customer_ref,
        } => {
            let request = ReservationRequest {
                resource_id,
                renter_id,
                span: span(start, end)?,
                amount_cents,
                customer_ref,
            };
            data(engine.create_reservation(request).await?)
        }
        Request::ConfirmReservation {
            rental_id,
            payment_intent_id,
        } => data(engine.confirm_reservation(rental_id, &payment_intent_id).await?),
        Request::CancelReservation {
            rental_id,
            actor_id,
            reason,
        } => data(engine.cancel_reservation(rental_id, reason, &actor_id).await?),
        Request::ActivateRental { rental_id, actor_id } => data(engine.activate_rental(rental_id, &actor_id).await?),
        Request::CompleteRental { rental_id, actor_id } => data(engine.complete_rental(rental_id, &actor_id).await?),
        Request::AbandonCheckout { payment_intent_id } => {
            let released = engine.abandon_checkout(&payment_intent_id).await;
            data(serde_json::json!({ "released": released }))
        }
        Request::PaymentCallback {
            rental_id,
            payment_intent_id,
            status,
        } => data(
            engine
                .handle_payment_callback(PaymentCallback {
                    rental_id,
                    payment_intent_id,
                    status,
                })
                .await?,
        ),
        Request::PlaceTemporaryBlock {
            resource_id,
            start,
            end,
            payment_intent_id,
        } => data(
            engine
                .place_temporary_block(resource_id, span(start, end)?, &payment_intent_id)
                .await?,
        ),
        Request::FinalizeTemporaryBlock {
            payment_intent_id,
            rental_id,
        } => {
            let finalized = engine.finalize_temporary_block(&payment_intent_id, rental_id).await?;
            data(serde_json::json!({ "finalized": finalized }))
        }
        Request::RemoveTemporaryBlock { payment_intent_id } => {
            let removed = engine.remove_temporary_block(&payment_intent_id).await?;
            data(serde_json::json!({ "removed": removed }))
        }
        Request::BlockDates {
            resource_id,
            actor_id,
            start_date,
            end_date,
            note,
        } => data(
            engine
                .block_dates(resource_id, &actor_id, start_date, end_date, note)
                .await?,
        ),
        Request::BlockOwnerDates {
            owner_id,
            start_date,
            end_date,
            note,
        } => data(engine.block_owner_dates(&owner_id, start_date, end_date, note).await?),
        Request::Unblock {
            resource_id,
            block_id,
            actor_id,
        } => data(engine.unblock(resource_id, block_id, &actor_id).await?),
        Request::SweepExpiredHolds { max_age_ms } => {
            let max_age = max_age_ms.unwrap_or(engine.settings().hold_max_age_ms);
            data(engine.sweep_expired_holds(max_age).await?)
        }
        Request::GetRental { rental_id } => data(engine.get_rental(rental_id).await?),
        Request::ListBlocks { resource_id, start, end } => {
            data(engine.list_blocks(resource_id, optional_window(start, end)?).await?)
        }
        Request::ListRentals { resource_id, start, end } => {
            data(engine.list_rentals(resource_id, optional_window(start, end)?).await?)
        }
    }
}

/// Parse, execute and time one line.
pub async fn handle_line(engine: &Engine, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            metrics::counter!(COMMANDS_TOTAL, "op" => "unparsed", "status" => "error").increment(1);
            return Response::failure("validation", format!("bad request: {e}"), None);
        }
    };
    let op = request.op();
    let start = Instant::now();
    let result = execute(engine, request).await;
    metrics::histogram!(COMMAND_DURATION_SECONDS, "op" => op).record(start.elapsed().as_secs_f64());
    match result {
        Ok(value) => {
            metrics::counter!(COMMANDS_TOTAL, "op" => op, "status" => "ok").increment(1);
            Response::success(value)
        }
        Err(e) => {
            metrics::counter!(COMMANDS_TOTAL, "op" => op, "status" => e.code()).increment(1);
            debug!("{op} failed: {e}");
            Response::from_error(&e)
        }
    }
}

/// Serve one client: newline-delimited JSON requests, one response line each, in order.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    while let Some(frame) = framed.next().await {
        let response = match frame {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&engine, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                Response::failure("limit_exceeded", format!("request line longer than {MAX_LINE_LEN} bytes"), None)
            }
            Err(e) => return Err(e.into()),
        };
        framed.send(serde_json::to_string(&response)?).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_requests() {
        let req: Request = serde_json::from_str(
            r#"{"op":"check_availability","resource_id":"01ARZ3NDEKTSV4RRFFQ69G5FAV","start":1000,"end":2000}"#,
        )
        .unwrap();
        assert_eq!(req.op(), "check_availability");
        match req {
            Request::CheckAvailability { start, end, exclude_rental, .. } => {
                assert_eq!((start, end), (1000, 2000));
                assert!(exclude_rental.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(serde_json::from_str::<Request>(r#"{"op":"drop_tables"}"#).is_err());
    }

    #[test]
    fn wire_rule_converts_slots() {
        let rule: WireRule = serde_json::from_str(
            r#"{"weekday":"Mon","available":true,"slots":[{"start":"09:00","end":"18:00"}]}"#,
        )
        .unwrap();
        let rule = WeeklyRule::try_from(rule).unwrap();
        assert_eq!(rule.weekday, Weekday::Mon);
        assert_eq!(rule.slots, vec![TimeSlot { start_min: 540, end_min: 1080 }]);

        let bad: WireRule =
            serde_json::from_str(r#"{"weekday":"Tue","available":true,"slots":[{"start":"18:00","end":"09:00"}]}"#)
                .unwrap();
        assert!(matches!(WeeklyRule::try_from(bad), Err(EngineError::Validation(_))));
    }

    #[test]
    fn conflict_errors_carry_the_conflict_list() {
        let err = EngineError::Conflict(vec![Conflict {
            kind: ConflictKind::OutsideSlots { at: 5 },
            span: Span::new(5, 10),
        }]);
        let resp = Response::from_error(&err);
        assert!(!resp.ok);
        let body = resp.error.unwrap();
        assert_eq!(body.code, "conflict");
        assert_eq!(body.conflicts.unwrap()[0]["kind"]["kind"], "outside_slots");
    }

    #[test]
    fn window_needs_both_ends() {
        assert!(optional_window(Some(1), None).is_err());
        assert_eq!(optional_window(None, None).unwrap(), None);
        assert_eq!(optional_window(Some(1), Some(2)).unwrap(), Some(Span::new(1, 2)));
        assert!(span(5, 5).is_err());
    }
}
