use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Monday-first weekday order, used wherever the template is iterated.
pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

pub fn weekday_index(day: Weekday) -> usize {
    day.num_days_from_monday() as usize
}

/// Half-open time-of-day window `[start, end)` within a single date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }
}

/// Role as mirrored from the identity collaborator. Only experts may
/// publish availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    Member,
    Expert,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Member => "member",
            UserRole::Expert => "expert",
        }
    }
}

/// Lifecycle of one user's claim on a slot. Pending is the only
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ClaimStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Pending => "pending",
            ClaimStatus::Accepted => "accepted",
            ClaimStatus::Rejected => "rejected",
        }
    }
}

/// The expert's verdict on a claim. Two variants only — there is no
/// "both" or "neither".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Accept,
    Reject,
}

/// One user's request to occupy a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingClaim {
    pub user_id: Ulid,
    pub status: ClaimStatus,
    pub created_at: Ms,
}

/// Wire/journal shape of a slot before any claims exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub message: Option<String>,
}

/// A concrete bookable window on a specific date. Identity within a date
/// is the `(start, end)` pair — two slots with equal times must never
/// coexist in one override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub message: Option<String>,
    pub claims: Vec<BookingClaim>,
}

impl Slot {
    pub fn from_spec(spec: &SlotSpec) -> Self {
        Self {
            start: spec.start,
            end: spec.end,
            message: spec.message.clone(),
            claims: Vec::new(),
        }
    }

    pub fn matches(&self, start: NaiveTime, end: NaiveTime) -> bool {
        self.start == start && self.end == end
    }

    /// Bookable iff no claim is Pending or Accepted.
    pub fn is_bookable(&self) -> bool {
        self.claims.iter().all(|c| c.status == ClaimStatus::Rejected)
    }

    pub fn accepted(&self) -> Option<&BookingClaim> {
        self.claims.iter().find(|c| c.status == ClaimStatus::Accepted)
    }

    pub fn claim_of(&self, user_id: Ulid) -> Option<&BookingClaim> {
        self.claims.iter().find(|c| c.user_id == user_id)
    }

    pub fn claim_of_mut(&mut self, user_id: Ulid) -> Option<&mut BookingClaim> {
        self.claims.iter_mut().find(|c| c.user_id == user_id)
    }

    /// Display status for the slot as a whole.
    pub fn status_label(&self) -> &'static str {
        if self.accepted().is_some() {
            "booked"
        } else if self.claims.iter().any(|c| c.status == ClaimStatus::Pending) {
            "requested"
        } else {
            "open"
        }
    }
}

/// Default recurring availability, Monday-indexed. Display data only —
/// a date becomes bookable when the expert materializes an override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyTemplate {
    days: [Vec<TimeRange>; 7],
}

impl WeeklyTemplate {
    pub fn ranges_for(&self, day: Weekday) -> &[TimeRange] {
        &self.days[weekday_index(day)]
    }

    pub fn set_day(&mut self, day: Weekday, ranges: Vec<TimeRange>) {
        self.days[weekday_index(day)] = ranges;
    }

    pub fn is_empty(&self) -> bool {
        self.days.iter().all(Vec::is_empty)
    }

    pub fn iter_days(&self) -> impl Iterator<Item = (Weekday, &[TimeRange])> {
        WEEKDAYS.iter().map(|day| (*day, self.ranges_for(*day)))
    }
}

/// Date-specific replacement for the weekly template. Soft-deleted by
/// clearing `is_active`; the record (and its claim history) stays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOverride {
    pub date: NaiveDate,
    pub slots: Vec<Slot>,
    pub is_active: bool,
}

impl DateOverride {
    pub fn slot(&self, start: NaiveTime, end: NaiveTime) -> Option<&Slot> {
        self.slots.iter().find(|s| s.matches(start, end))
    }

    pub fn slot_mut(&mut self, start: NaiveTime, end: NaiveTime) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.matches(start, end))
    }
}

/// Root aggregate: everything one expert has published. Created lazily on
/// the expert's first write; the engine is the only writer afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityState {
    pub expert_id: Ulid,
    pub weekly: WeeklyTemplate,
    /// At most one record per date, sorted by date.
    pub overrides: Vec<DateOverride>,
    pub blocked: BTreeSet<NaiveDate>,
}

impl AvailabilityState {
    pub fn new(expert_id: Ulid) -> Self {
        Self {
            expert_id,
            weekly: WeeklyTemplate::default(),
            overrides: Vec::new(),
            blocked: BTreeSet::new(),
        }
    }

    pub fn override_for(&self, date: NaiveDate) -> Option<&DateOverride> {
        self.overrides.iter().find(|o| o.date == date)
    }

    pub fn override_mut(&mut self, date: NaiveDate) -> Option<&mut DateOverride> {
        self.overrides.iter_mut().find(|o| o.date == date)
    }

    pub fn active_override(&self, date: NaiveDate) -> Option<&DateOverride> {
        self.override_for(date).filter(|o| o.is_active)
    }

    pub fn has_active_override(&self, date: NaiveDate) -> bool {
        self.active_override(date).is_some()
    }

    /// Replace any existing record for `date` outright, or insert keeping
    /// date order. Prior claim state on that date is gone — callers that
    /// need it must read-modify-write.
    pub fn upsert_override(&mut self, date: NaiveDate, slots: Vec<Slot>) {
        let record = DateOverride { date, slots, is_active: true };
        if let Some(existing) = self.override_mut(date) {
            *existing = record;
            return;
        }
        let pos = self
            .overrides
            .binary_search_by_key(&date, |o| o.date)
            .unwrap_or_else(|e| e);
        self.overrides.insert(pos, record);
    }

    pub fn slot_mut(
        &mut self,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Option<&mut Slot> {
        self.override_mut(date).and_then(|o| o.slot_mut(start, end))
    }
}

/// The journal record format — flat, no nesting. Each event carries every
/// datum needed to reapply it, so replay never consults a clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
        role: UserRole,
    },
    WeeklySet {
        expert_id: Ulid,
        template: WeeklyTemplate,
    },
    BlockedDatesSet {
        expert_id: Ulid,
        dates: BTreeSet<NaiveDate>,
    },
    OverrideSet {
        expert_id: Ulid,
        date: NaiveDate,
        slots: Vec<SlotSpec>,
    },
    OverrideRemoved {
        expert_id: Ulid,
        date: NaiveDate,
    },
    ClaimRequested {
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        user_id: Ulid,
        message: Option<String>,
        created_at: Ms,
    },
    ClaimCancelled {
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        user_id: Ulid,
    },
    ClaimDecided {
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        user_id: Ulid,
        decision: Decision,
    },
    SlotMessageSet {
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        message: Option<String>,
    },
}

// ── Query result types ───────────────────────────────────────────

/// One claim joined with display attributes from the user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingEntry {
    pub expert_id: Ulid,
    pub expert_name: Option<String>,
    pub user_id: Ulid,
    pub user_name: Option<String>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub status: ClaimStatus,
    pub message: Option<String>,
    pub created_at: Ms,
}

/// Effective schedule for one (expert, date).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaySchedule {
    /// The date is in the expert's blocked set — nothing is offered.
    Blocked,
    /// An active override is in force; slots carry claim state.
    Overridden(Vec<Slot>),
    /// No override: the weekly template for that weekday, display-only.
    Recurring(Vec<TimeRange>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn t(hhmm: &str) -> NaiveTime {
        NaiveTime::parse_from_str(hhmm, "%H:%M").unwrap()
    }

    fn d(iso: &str) -> NaiveDate {
        NaiveDate::parse_from_str(iso, "%Y-%m-%d").unwrap()
    }

    fn slot(start: &str, end: &str) -> Slot {
        Slot {
            start: t(start),
            end: t(end),
            message: None,
            claims: Vec::new(),
        }
    }

    fn claim(user_id: Ulid, status: ClaimStatus) -> BookingClaim {
        BookingClaim { user_id, status, created_at: 1_000 }
    }

    #[test]
    fn empty_slot_is_bookable() {
        assert!(slot("09:00", "10:00").is_bookable());
    }

    #[test]
    fn all_rejected_slot_is_bookable() {
        let mut s = slot("09:00", "10:00");
        s.claims.push(claim(Ulid::new(), ClaimStatus::Rejected));
        s.claims.push(claim(Ulid::new(), ClaimStatus::Rejected));
        assert!(s.is_bookable());
    }

    #[test]
    fn pending_claim_blocks_booking() {
        let mut s = slot("09:00", "10:00");
        s.claims.push(claim(Ulid::new(), ClaimStatus::Pending));
        assert!(!s.is_bookable());
        assert_eq!(s.status_label(), "requested");
    }

    #[test]
    fn accepted_claim_locks_slot() {
        let mut s = slot("09:00", "10:00");
        let winner = Ulid::new();
        s.claims.push(claim(winner, ClaimStatus::Accepted));
        assert!(!s.is_bookable());
        assert_eq!(s.status_label(), "booked");
        assert_eq!(s.accepted().unwrap().user_id, winner);
    }

    #[test]
    fn slot_identity_is_the_time_pair() {
        let s = slot("09:00", "10:00");
        assert!(s.matches(t("09:00"), t("10:00")));
        assert!(!s.matches(t("09:00"), t("10:30")));
    }

    #[test]
    fn weekly_template_indexes_by_weekday() {
        let mut w = WeeklyTemplate::default();
        w.set_day(Weekday::Mon, vec![TimeRange::new(t("09:00"), t("10:00"))]);
        assert_eq!(w.ranges_for(Weekday::Mon).len(), 1);
        assert!(w.ranges_for(Weekday::Tue).is_empty());
        assert!(!w.is_empty());
        // 2025-01-06 is a Monday
        assert_eq!(d("2025-01-06").weekday(), Weekday::Mon);
    }

    #[test]
    fn upsert_override_keeps_date_order() {
        let mut state = AvailabilityState::new(Ulid::new());
        state.upsert_override(d("2025-01-08"), vec![slot("09:00", "10:00")]);
        state.upsert_override(d("2025-01-06"), vec![slot("09:00", "10:00")]);
        state.upsert_override(d("2025-01-07"), vec![slot("09:00", "10:00")]);
        let dates: Vec<_> = state.overrides.iter().map(|o| o.date).collect();
        assert_eq!(dates, vec![d("2025-01-06"), d("2025-01-07"), d("2025-01-08")]);
    }

    #[test]
    fn upsert_override_replaces_wholesale() {
        let mut state = AvailabilityState::new(Ulid::new());
        state.upsert_override(d("2025-01-06"), vec![slot("09:00", "10:00")]);
        state
            .slot_mut(d("2025-01-06"), t("09:00"), t("10:00"))
            .unwrap()
            .claims
            .push(claim(Ulid::new(), ClaimStatus::Pending));

        // Re-submitting the date drops the prior record, claims included.
        state.upsert_override(d("2025-01-06"), vec![slot("11:00", "12:00")]);
        assert_eq!(state.overrides.len(), 1);
        let o = state.override_for(d("2025-01-06")).unwrap();
        assert_eq!(o.slots.len(), 1);
        assert!(o.slots[0].matches(t("11:00"), t("12:00")));
        assert!(o.slots[0].claims.is_empty());
    }

    #[test]
    fn soft_deleted_override_is_not_active() {
        let mut state = AvailabilityState::new(Ulid::new());
        state.upsert_override(d("2025-01-06"), vec![slot("09:00", "10:00")]);
        state.override_mut(d("2025-01-06")).unwrap().is_active = false;
        assert!(state.override_for(d("2025-01-06")).is_some());
        assert!(state.active_override(d("2025-01-06")).is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ClaimRequested {
            expert_id: Ulid::new(),
            date: d("2025-01-06"),
            start: t("09:00"),
            end: t("10:00"),
            user_id: Ulid::new(),
            message: Some("https://meet.example/abc".into()),
            created_at: 1_736_121_600_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
