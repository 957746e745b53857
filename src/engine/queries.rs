use std::collections::BTreeSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{check_range, free_windows, unavailable_dates};
use super::conflict::{now_ms, validate_span, validate_window};
use super::{Engine, EngineError};

impl Engine {
    /// Can `span` be booked? Conflicts come back as data, not as an error.
    /// `exclude_rental` ignores one rental and its blocks (e.g. when rescheduling).
    pub async fn check_availability(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude_rental: Option<Ulid>,
    ) -> Result<Availability, EngineError> {
        validate_span(&span)?;
        let cal = self.resource_or_not_found(resource_id)?;
        let guard = cal.read().await;
        Ok(check_range(&guard, &span, exclude_rental, now_ms(), self.settings.hold_max_age_ms))
    }

    /// Dates in `from..=to` that cannot take any booking.
    pub async fn list_unavailable_dates(
        &self,
        resource_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>, EngineError> {
        let window = Span::from_dates(from, to)
            .ok_or_else(|| EngineError::Validation(format!("horizon end {to} is before start {from}")))?;
        validate_window(&window)?;
        let cal = self.resource_or_not_found(resource_id)?;
        let guard = cal.read().await;
        Ok(unavailable_dates(&guard, from, to, now_ms(), self.settings.hold_max_age_ms))
    }

    pub async fn free_windows(&self, resource_id: Ulid, query: Span) -> Result<Vec<Span>, EngineError> {
        validate_window(&query)?;
        let cal = self.resource_or_not_found(resource_id)?;
        let guard = cal.read().await;
        Ok(free_windows(&guard, &query, now_ms(), self.settings.hold_max_age_ms))
    }

    pub async fn get_resource_info(&self, resource_id: Ulid) -> Result<ResourceInfo, EngineError> {
        let cal = self.resource_or_not_found(resource_id)?;
        let guard = cal.read().await;
        Ok(ResourceInfo {
            id: guard.id,
            owner_id: guard.owner_id.clone(),
            name: guard.name.clone(),
            rules: guard.rules.iter().flatten().cloned().collect(),
        })
    }

    pub async fn get_rental(&self, rental_id: Ulid) -> Result<Rental, EngineError> {
        let resource_id = self
            .resource_for_rental(&rental_id)
            .ok_or(EngineError::NotFound(rental_id))?;
        let cal = self.resource_or_not_found(resource_id)?;
        let guard = cal.read().await;
        guard.rental(rental_id).cloned().ok_or(EngineError::NotFound(rental_id))
    }

    /// Blocks overlapping `window`, or all of them.
    pub async fn list_blocks(&self, resource_id: Ulid, window: Option<Span>) -> Result<Vec<BlockedPeriod>, EngineError> {
        let cal = self.resource_or_not_found(resource_id)?;
        let guard = cal.read().await;
        Ok(match window {
            Some(w) => guard.overlapping_blocks(&w).cloned().collect(),
            None => guard.blocks.clone(),
        })
    }

    pub async fn list_rentals(&self, resource_id: Ulid, window: Option<Span>) -> Result<Vec<Rental>, EngineError> {
        let cal = self.resource_or_not_found(resource_id)?;
        let guard = cal.read().await;
        Ok(match window {
            Some(w) => guard.overlapping_rentals(&w).cloned().collect(),
            None => guard.rentals.clone(),
        })
    }
}
