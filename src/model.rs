use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Milliseconds on the resource's local wall clock. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but for untrusted input.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// `[midnight(first), midnight(last + 1))` for an inclusive date range.
    pub fn from_dates(first: NaiveDate, last: NaiveDate) -> Option<Self> {
        Self::checked(midnight(first), midnight(last) + DAY_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn first_date(&self) -> NaiveDate {
        date_of(self.start)
    }

    /// Date of the last instant inside the span (`end` itself is excluded).
    pub fn last_date(&self) -> NaiveDate {
        date_of(self.end - 1)
    }

    /// Every date the span touches, in order.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let last = self.last_date();
        self.first_date().iter_days().take_while(move |d| *d <= last)
    }
}

pub fn date_of(t: Ms) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(t)
        .unwrap_or_default()
        .date_naive()
}

pub fn midnight(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// Start of the day containing `t`.
pub fn day_floor(t: Ms) -> Ms {
    t - t.rem_euclid(DAY_MS)
}

/// Smallest midnight `>= t`.
pub fn day_ceil(t: Ms) -> Ms {
    let floor = day_floor(t);
    if floor == t { t } else { floor + DAY_MS }
}

// ── Weekly availability ─────────────────────────────────────────

/// A `[start, end)` window inside one day, minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start_min: u16,
    pub end_min: u16,
}

impl TimeSlot {
    /// Parse `"HH:MM"` bounds. `"24:00"` is accepted as an end.
    pub fn parse(start: &str, end: &str) -> Result<Self, String> {
        let start_min = parse_clock(start)?;
        let end_min = parse_clock(end)?;
        if start_min >= 24 * 60 {
            return Err(format!("slot cannot start at {start}"));
        }
        if start_min >= end_min {
            return Err(format!("slot {start}-{end} is empty or inverted"));
        }
        Ok(Self { start_min, end_min })
    }

    pub fn span_on(&self, date: NaiveDate) -> Span {
        let base = midnight(date);
        Span::new(
            base + self.start_min as Ms * MINUTE_MS,
            base + self.end_min as Ms * MINUTE_MS,
        )
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start_min / 60,
            self.start_min % 60,
            self.end_min / 60,
            self.end_min % 60
        )
    }
}

fn parse_clock(s: &str) -> Result<u16, String> {
    let s = s.trim();
    if s == "24:00" {
        return Ok(24 * 60);
    }
    let t = NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| format!("bad time of day: {s:?}"))?;
    Ok((t.hour() * 60 + t.minute()) as u16)
}

/// Availability for one weekday. No slots means the whole day is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyRule {
    pub weekday: Weekday,
    pub available: bool,
    pub slots: Vec<TimeSlot>,
}

impl WeeklyRule {
    pub fn open_all_day(weekday: Weekday) -> Self {
        Self { weekday, available: true, slots: Vec::new() }
    }

    pub fn closed(weekday: Weekday) -> Self {
        Self { weekday, available: false, slots: Vec::new() }
    }

    pub fn has_slots(&self) -> bool {
        self.available && !self.slots.is_empty()
    }
}

// ── Blocked periods ─────────────────────────────────────────────

/// Why a calendar range is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockReason {
    /// Hold for an in-flight payment attempt.
    Temporary { payment_intent_id: String },
    /// Permanent record of a confirmed rental.
    Confirmed { rental_id: Ulid },
    /// Owner-entered block.
    Manual { note: Option<String> },
}

const TEMPORARY_TAG: &str = "PAYMENT_INTENT:";
const CONFIRMED_TAG: &str = "CONFIRMED_RENTAL:";

impl BlockReason {
    pub fn temporary(payment_intent_id: impl Into<String>) -> Self {
        BlockReason::Temporary { payment_intent_id: payment_intent_id.into() }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, BlockReason::Temporary { .. })
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, BlockReason::Manual { .. })
    }

    pub fn payment_intent_id(&self) -> Option<&str> {
        match self {
            BlockReason::Temporary { payment_intent_id } => Some(payment_intent_id),
            _ => None,
        }
    }
}

/// Legacy tag-string rendering: `PAYMENT_INTENT:<id>`, `CONFIRMED_RENTAL:<id>`, or free text.
impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Temporary { payment_intent_id } => write!(f, "{TEMPORARY_TAG}{payment_intent_id}"),
            BlockReason::Confirmed { rental_id } => write!(f, "{CONFIRMED_TAG}{rental_id}"),
            BlockReason::Manual { note } => f.write_str(note.as_deref().unwrap_or("")),
        }
    }
}

impl FromStr for BlockReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(intent) = s.strip_prefix(TEMPORARY_TAG) {
            if intent.is_empty() {
                return Err("empty payment intent tag".into());
            }
            return Ok(BlockReason::temporary(intent));
        }
        if let Some(rental) = s.strip_prefix(CONFIRMED_TAG) {
            let rental_id = Ulid::from_string(rental).map_err(|e| format!("bad rental tag {rental:?}: {e}"))?;
            return Ok(BlockReason::Confirmed { rental_id });
        }
        let note = (!s.is_empty()).then(|| s.to_string());
        Ok(BlockReason::Manual { note })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedPeriod {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub reason: BlockReason,
    pub created_at: Ms,
    /// Rental this block belongs to, when placed by a reservation.
    pub rental_id: Option<Ulid>,
}

impl BlockedPeriod {
    /// A temporary block stops occupying the calendar once it is `max_age` old.
    pub fn occupies(&self, now: Ms, hold_max_age: Ms) -> bool {
        match self.reason {
            BlockReason::Temporary { .. } => now - self.created_at < hold_max_age,
            _ => true,
        }
    }
}

// ── Rentals & payments ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RentalStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
}

impl RentalStatus {
    /// Only these statuses hold the calendar.
    pub fn occupies(self) -> bool {
        matches!(self, RentalStatus::Pending | RentalStatus::Confirmed | RentalStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RentalStatus::Pending => "PENDING",
            RentalStatus::Confirmed => "CONFIRMED",
            RentalStatus::Active => "ACTIVE",
            RentalStatus::Completed => "COMPLETED",
            RentalStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RentalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub status: PaymentStatus,
    pub amount_cents: i64,
    /// External transaction reference used to correlate provider callbacks.
    pub payment_intent_id: String,
    pub completed_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rental {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub renter_id: String,
    pub owner_id: String,
    pub span: Span,
    pub status: RentalStatus,
    pub payment: Payment,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub cancelled_by: Option<String>,
    pub cancel_reason: Option<String>,
}

// ── Per-resource calendar ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Calendar {
    pub id: Ulid,
    pub owner_id: String,
    pub name: Option<String>,
    /// Indexed by `Weekday::num_days_from_monday`.
    pub rules: [Option<WeeklyRule>; 7],
    /// Sorted by `span.start`.
    pub blocks: Vec<BlockedPeriod>,
    /// Sorted by `span.start`. Cancelled and completed rentals stay here.
    pub rentals: Vec<Rental>,
}

impl Calendar {
    pub fn new(id: Ulid, owner_id: String, name: Option<String>) -> Self {
        Self {
            id,
            owner_id,
            name,
            rules: Default::default(),
            blocks: Vec::new(),
            rentals: Vec::new(),
        }
    }

    pub fn rule_for(&self, weekday: Weekday) -> Option<&WeeklyRule> {
        self.rules[weekday.num_days_from_monday() as usize].as_ref()
    }

    pub fn set_rule(&mut self, rule: WeeklyRule) {
        let idx = rule.weekday.num_days_from_monday() as usize;
        self.rules[idx] = Some(rule);
    }

    /// The rule governing `date`, if it is an open day.
    pub fn open_rule(&self, date: NaiveDate) -> Option<&WeeklyRule> {
        self.rule_for(date.weekday()).filter(|r| r.available)
    }

    pub fn insert_block(&mut self, block: BlockedPeriod) {
        let pos = self
            .blocks
            .partition_point(|b| b.span.start <= block.span.start);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<BlockedPeriod> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    pub fn block_mut(&mut self, id: Ulid) -> Option<&mut BlockedPeriod> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    pub fn blocks_for_intent<'a>(&'a self, payment_intent_id: &'a str) -> impl Iterator<Item = &'a BlockedPeriod> {
        self.blocks
            .iter()
            .filter(move |b| b.reason.payment_intent_id() == Some(payment_intent_id))
    }

    /// Blocks whose span overlaps `query`.
    pub fn overlapping_blocks(&self, query: &Span) -> impl Iterator<Item = &BlockedPeriod> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.blocks.partition_point(|b| b.span.start < query.end);
        self.blocks[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn insert_rental(&mut self, rental: Rental) {
        let pos = self
            .rentals
            .partition_point(|r| r.span.start <= rental.span.start);
        self.rentals.insert(pos, rental);
    }

    /// Replace a rental in place (spans never change after creation).
    pub fn replace_rental(&mut self, rental: Rental) {
        match self.rentals.iter_mut().find(|r| r.id == rental.id) {
            Some(slot) => *slot = rental,
            None => self.insert_rental(rental),
        }
    }

    pub fn rental(&self, id: Ulid) -> Option<&Rental> {
        self.rentals.iter().find(|r| r.id == id)
    }

    pub fn overlapping_rentals(&self, query: &Span) -> impl Iterator<Item = &Rental> {
        let right_bound = self.rentals.partition_point(|r| r.span.start < query.end);
        self.rentals[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// Journal record payloads. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        owner_id: String,
        name: Option<String>,
    },
    WeeklyRuleSet {
        resource_id: Ulid,
        rule: WeeklyRule,
    },
    BlockPlaced {
        block: BlockedPeriod,
    },
    BlockRetagged {
        id: Ulid,
        resource_id: Ulid,
        reason: BlockReason,
    },
    BlockRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    RentalCreated {
        rental: Rental,
    },
    RentalUpdated {
        rental: Rental,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ResourceCreated { id, .. } => *id,
            Event::WeeklyRuleSet { resource_id, .. }
            | Event::BlockRetagged { resource_id, .. }
            | Event::BlockRemoved { resource_id, .. } => *resource_id,
            Event::BlockPlaced { block } => block.resource_id,
            Event::RentalCreated { rental } | Event::RentalUpdated { rental } => rental.resource_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub owner_id: String,
    pub name: Option<String>,
    pub rules: Vec<WeeklyRule>,
}

/// What stands in the way of a candidate range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKind {
    /// No rule for the weekday, or the rule is closed.
    ClosedDay { date: NaiveDate },
    /// Pickup or return time falls outside the day's slots.
    OutsideSlots { at: Ms },
    Block { id: Ulid, reason: BlockReason },
    Rental { id: Ulid, status: RentalStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub available: bool,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationTicket {
    pub rental: Rental,
    pub payment_intent_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cancellation {
    pub rental_id: Ulid,
    pub cancelled_by: String,
    pub reason: Option<String>,
    pub cancelled_at: Ms,
    pub removed_hold: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed_count: usize,
    pub removed_blocks: Vec<BlockedPeriod>,
    pub expired_rentals: Vec<Ulid>,
}
