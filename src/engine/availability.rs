use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────
//
// Granularity: on days whose rule has time slots, occupancy is exact to the
// millisecond. On slot-less days any entry touching the day takes the whole
// day, so span edges landing on such days are widened to midnight before the
// half-open overlap test.

/// Bookable windows for `date`, or `None` if the day is closed.
pub fn day_windows(cal: &Calendar, date: NaiveDate) -> Option<Vec<Span>> {
    let rule = cal.open_rule(date)?;
    if rule.slots.is_empty() {
        let base = midnight(date);
        Some(vec![Span::new(base, base + DAY_MS)])
    } else {
        Some(rule.slots.iter().map(|s| s.span_on(date)).collect())
    }
}

/// Slot windows for `date`, only when the day is open and slotted.
fn slot_windows(cal: &Calendar, date: NaiveDate) -> Option<Vec<Span>> {
    cal.open_rule(date)
        .filter(|r| r.has_slots())
        .map(|r| r.slots.iter().map(|s| s.span_on(date)).collect())
}

fn day_has_slots(cal: &Calendar, date: NaiveDate) -> bool {
    cal.open_rule(date).is_some_and(|r| r.has_slots())
}

/// The span an entry effectively occupies once slot-less days are rounded out.
pub fn effective_span(cal: &Calendar, span: &Span) -> Span {
    let start = if day_has_slots(cal, date_of(span.start)) {
        span.start
    } else {
        day_floor(span.start)
    };
    let end = if day_has_slots(cal, date_of(span.end - 1)) {
        span.end
    } else {
        day_ceil(span.end)
    };
    Span::new(start, end)
}

/// Conflicts with blocks and rentals, earliest-created entry first.
///
/// Expired temporary blocks and non-occupying rentals are ignored, as is
/// `exclude_rental` together with any block linked to it.
pub fn occupying_conflicts(
    cal: &Calendar,
    span: &Span,
    exclude_rental: Option<Ulid>,
    now: Ms,
    hold_max_age: Ms,
) -> Vec<Conflict> {
    let candidate = effective_span(cal, span);
    // Entries get widened too, so look one day further on each side.
    let search = Span::new(candidate.start - DAY_MS, candidate.end + DAY_MS);

    let mut found: Vec<(Ulid, Conflict)> = Vec::new();
    let mut reported_rentals = HashSet::new();

    for block in cal.overlapping_blocks(&search) {
        if !block.occupies(now, hold_max_age) {
            continue;
        }
        if exclude_rental.is_some() && block.rental_id == exclude_rental {
            continue;
        }
        if effective_span(cal, &block.span).overlaps(&candidate) {
            if let Some(rental_id) = block.rental_id {
                reported_rentals.insert(rental_id);
            }
            found.push((
                block.id,
                Conflict {
                    kind: ConflictKind::Block {
                        id: block.id,
                        reason: block.reason.clone(),
                    },
                    span: block.span,
                },
            ));
        }
    }

    for rental in cal.overlapping_rentals(&search) {
        if !rental.status.occupies()
            || Some(rental.id) == exclude_rental
            || reported_rentals.contains(&rental.id)
        {
            continue;
        }
        if effective_span(cal, &rental.span).overlaps(&candidate) {
            found.push((
                rental.id,
                Conflict {
                    kind: ConflictKind::Rental {
                        id: rental.id,
                        status: rental.status,
                    },
                    span: rental.span,
                },
            ));
        }
    }

    found.sort_by_key(|(id, _)| *id);
    found.into_iter().map(|(_, c)| c).collect()
}

/// Decide whether `span` can be booked on `cal`.
///
/// Every touched date must be open. On slotted boundary days the pickup and
/// return instants must sit inside a slot (same-day spans inside one slot).
/// Then nothing occupying may overlap.
pub fn check_range(
    cal: &Calendar,
    span: &Span,
    exclude_rental: Option<Ulid>,
    now: Ms,
    hold_max_age: Ms,
) -> Availability {
    let mut conflicts = Vec::new();

    for date in span.dates() {
        if cal.open_rule(date).is_none() {
            let base = midnight(date);
            conflicts.push(Conflict {
                kind: ConflictKind::ClosedDay { date },
                span: Span::new(base, base + DAY_MS),
            });
        }
    }

    let first = span.first_date();
    let last = span.last_date();
    if first == last {
        if let Some(windows) = slot_windows(cal, first)
            && !windows.iter().any(|w| w.contains_span(span))
        {
            conflicts.push(Conflict {
                kind: ConflictKind::OutsideSlots { at: span.start },
                span: *span,
            });
        }
    } else {
        if let Some(windows) = slot_windows(cal, first)
            && !windows.iter().any(|w| w.contains_instant(span.start))
        {
            conflicts.push(Conflict {
                kind: ConflictKind::OutsideSlots { at: span.start },
                span: Span::new(span.start, day_ceil(span.start + 1)),
            });
        }
        if let Some(windows) = slot_windows(cal, last)
            && !windows.iter().any(|w| w.start < span.end && span.end <= w.end)
        {
            conflicts.push(Conflict {
                kind: ConflictKind::OutsideSlots { at: span.end },
                span: Span::new(day_floor(span.end - 1), span.end),
            });
        }
    }

    conflicts.extend(occupying_conflicts(cal, span, exclude_rental, now, hold_max_age));

    Availability {
        available: conflicts.is_empty(),
        conflicts,
    }
}

/// Effective occupied spans inside `window`, sorted and merged.
fn occupied_spans(cal: &Calendar, window: &Span, now: Ms, hold_max_age: Ms) -> Vec<Span> {
    let search = Span::new(window.start - DAY_MS, window.end + DAY_MS);
    let mut occupied: Vec<Span> = cal
        .overlapping_blocks(&search)
        .filter(|b| b.occupies(now, hold_max_age))
        .map(|b| effective_span(cal, &b.span))
        .chain(
            cal.overlapping_rentals(&search)
                .filter(|r| r.status.occupies())
                .map(|r| effective_span(cal, &r.span)),
        )
        .collect();
    occupied.sort_by_key(|s| s.start);
    merge_overlapping(&occupied)
}

/// Dates in `[from, to]` that cannot take any booking.
///
/// A date is unavailable when it is closed by the weekly rules or when its
/// bookable windows are entirely covered by blocks and rentals.
pub fn unavailable_dates(
    cal: &Calendar,
    from: NaiveDate,
    to: NaiveDate,
    now: Ms,
    hold_max_age: Ms,
) -> BTreeSet<NaiveDate> {
    let mut out = BTreeSet::new();
    let Some(window) = Span::from_dates(from, to) else {
        return out;
    };
    let occupied = occupied_spans(cal, &window, now, hold_max_age);

    for date in window.dates() {
        match day_windows(cal, date) {
            None => {
                out.insert(date);
            }
            Some(windows) => {
                if subtract_intervals(&windows, &occupied).is_empty() {
                    out.insert(date);
                }
            }
        }
    }
    out
}

/// Free bookable windows inside `query`: open days and slots minus occupancy.
pub fn free_windows(cal: &Calendar, query: &Span, now: Ms, hold_max_age: Ms) -> Vec<Span> {
    let mut open: Vec<Span> = Vec::new();
    for date in query.dates() {
        if let Some(windows) = day_windows(cal, date) {
            for w in windows {
                let clamped_start = w.start.max(query.start);
                let clamped_end = w.end.min(query.end);
                if clamped_start < clamped_end {
                    open.push(Span::new(clamped_start, clamped_end));
                }
            }
        }
    }
    let open = merge_overlapping(&open);
    let occupied = occupied_spans(cal, query, now, hold_max_age);
    subtract_intervals(&open, &occupied)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove `to_remove` from `base`. Both inputs sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
