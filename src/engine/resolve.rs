use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Resolve the effective schedule of one expert on one date.
///
/// Precedence: blocked date → empty; active override → its slots (with
/// claim state); otherwise the weekly template for that weekday. Template
/// ranges are display data — they carry no claim state and are not
/// bookable until the expert materializes an override for the date.
pub fn resolve_schedule(state: &AvailabilityState, date: NaiveDate) -> DaySchedule {
    if state.blocked.contains(&date) {
        return DaySchedule::Blocked;
    }
    if let Some(day) = state.active_override(date) {
        return DaySchedule::Overridden(day.slots.clone());
    }
    DaySchedule::Recurring(state.weekly.ranges_for(date.weekday()).to_vec())
}

impl Engine {
    pub async fn resolve(
        &self,
        expert_id: Ulid,
        date: NaiveDate,
    ) -> Result<DaySchedule, EngineError> {
        let rs = self
            .store
            .get(&expert_id)
            .ok_or(EngineError::ExpertNotFound(expert_id))?;
        let guard = rs.read().await;
        Ok(resolve_schedule(&guard, date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};

    fn t(hhmm: &str) -> NaiveTime {
        NaiveTime::parse_from_str(hhmm, "%H:%M").unwrap()
    }

    fn d(iso: &str) -> NaiveDate {
        NaiveDate::parse_from_str(iso, "%Y-%m-%d").unwrap()
    }

    fn state_with_monday_template() -> AvailabilityState {
        let mut state = AvailabilityState::new(Ulid::new());
        state
            .weekly
            .set_day(Weekday::Mon, vec![TimeRange::new(t("09:00"), t("10:00"))]);
        state
    }

    #[test]
    fn blocked_date_resolves_empty() {
        let mut state = state_with_monday_template();
        state.blocked.insert(d("2025-01-06"));
        assert_eq!(resolve_schedule(&state, d("2025-01-06")), DaySchedule::Blocked);
    }

    #[test]
    fn template_fallback_on_matching_weekday() {
        let state = state_with_monday_template();
        // 2025-01-06 is a Monday, no override exists
        match resolve_schedule(&state, d("2025-01-06")) {
            DaySchedule::Recurring(ranges) => {
                assert_eq!(ranges, vec![TimeRange::new(t("09:00"), t("10:00"))]);
            }
            other => panic!("expected Recurring, got {other:?}"),
        }
    }

    #[test]
    fn template_fallback_other_weekday_is_empty() {
        let state = state_with_monday_template();
        // 2025-01-07 is a Tuesday
        match resolve_schedule(&state, d("2025-01-07")) {
            DaySchedule::Recurring(ranges) => assert!(ranges.is_empty()),
            other => panic!("expected Recurring, got {other:?}"),
        }
    }

    #[test]
    fn active_override_wins_over_template() {
        let mut state = state_with_monday_template();
        state.upsert_override(
            d("2025-01-06"),
            vec![Slot {
                start: t("14:00"),
                end: t("15:00"),
                message: None,
                claims: Vec::new(),
            }],
        );
        match resolve_schedule(&state, d("2025-01-06")) {
            DaySchedule::Overridden(slots) => {
                assert_eq!(slots.len(), 1);
                assert!(slots[0].matches(t("14:00"), t("15:00")));
            }
            other => panic!("expected Overridden, got {other:?}"),
        }
    }

    #[test]
    fn soft_deleted_override_falls_back_to_template() {
        let mut state = state_with_monday_template();
        state.upsert_override(d("2025-01-06"), Vec::new());
        state.override_mut(d("2025-01-06")).unwrap().is_active = false;
        assert!(matches!(
            resolve_schedule(&state, d("2025-01-06")),
            DaySchedule::Recurring(_)
        ));
    }

    #[test]
    fn blocked_wins_over_override() {
        let mut state = state_with_monday_template();
        state.upsert_override(d("2025-01-06"), Vec::new());
        state.blocked.insert(d("2025-01-06"));
        assert_eq!(resolve_schedule(&state, d("2025-01-06")), DaySchedule::Blocked);
    }
}
