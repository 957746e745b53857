use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::availability::{check_range, occupying_conflicts};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation("range end must be after start".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_window(span: &Span) -> Result<(), EngineError> {
    validate_span(span)?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

pub(crate) fn validate_id(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("identifier too long"));
    }
    Ok(())
}

pub(crate) fn validate_note(note: Option<&str>) -> Result<(), EngineError> {
    if note.is_some_and(|n| n.len() > MAX_REASON_LEN) {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}

/// At most three ordered, non-overlapping slots.
pub(crate) fn validate_rule(rule: &WeeklyRule) -> Result<(), EngineError> {
    if rule.slots.len() > MAX_SLOTS_PER_DAY {
        return Err(EngineError::Validation(format!(
            "{:?} has {} slots, at most {MAX_SLOTS_PER_DAY} allowed",
            rule.weekday,
            rule.slots.len()
        )));
    }
    for slot in &rule.slots {
        if slot.start_min >= slot.end_min || slot.end_min > 24 * 60 {
            return Err(EngineError::Validation(format!("bad slot {slot}")));
        }
    }
    for pair in rule.slots.windows(2) {
        if pair[1].start_min < pair[0].end_min {
            return Err(EngineError::Validation(format!(
                "slots {} and {} overlap or are out of order",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

/// Full availability check; the conflict list becomes the error.
pub(crate) fn ensure_available(
    cal: &Calendar,
    span: &Span,
    exclude_rental: Option<Ulid>,
    now: Ms,
    hold_max_age: Ms,
) -> Result<(), EngineError> {
    let result = check_range(cal, span, exclude_rental, now, hold_max_age);
    if result.available {
        Ok(())
    } else {
        metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
        Err(EngineError::Conflict(result.conflicts))
    }
}

/// Owner blocks may stack on other manual blocks but never on bookings or live holds.
pub(crate) fn ensure_no_bookings(cal: &Calendar, span: &Span, now: Ms, hold_max_age: Ms) -> Result<(), EngineError> {
    let conflicts: Vec<Conflict> = occupying_conflicts(cal, span, None, now, hold_max_age)
        .into_iter()
        .filter(|c| !matches!(&c.kind, ConflictKind::Block { reason, .. } if reason.is_manual()))
        .collect();
    if conflicts.is_empty() {
        Ok(())
    } else {
        metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
        Err(EngineError::Conflict(conflicts))
    }
}
