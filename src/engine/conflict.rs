use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

pub(crate) fn validate_range(start: NaiveTime, end: NaiveTime) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::InvalidArgument("start_time must be before end_time"));
    }
    Ok(())
}

pub(crate) fn validate_message(message: Option<&str>) -> Result<(), EngineError> {
    if let Some(m) = message
        && m.len() > MAX_MESSAGE_LEN {
            return Err(EngineError::LimitExceeded("message too long"));
        }
    Ok(())
}

/// Validate a wholesale override submission: ordered ranges, bounded
/// count, and no two slots sharing the same `(start, end)` identity.
pub(crate) fn validate_override_slots(slots: &[SlotSpec]) -> Result<(), EngineError> {
    if slots.len() > MAX_SLOTS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many slots on one date"));
    }
    for spec in slots {
        validate_range(spec.start, spec.end)?;
        validate_message(spec.message.as_deref())?;
    }
    for (i, a) in slots.iter().enumerate() {
        for b in &slots[i + 1..] {
            if a.start == b.start && a.end == b.end {
                return Err(EngineError::InvalidArgument(
                    "two slots with identical times on one date",
                ));
            }
        }
    }
    Ok(())
}

pub(crate) fn validate_template(template: &WeeklyTemplate) -> Result<(), EngineError> {
    for (_, ranges) in template.iter_days() {
        if ranges.len() > MAX_RANGES_PER_WEEKDAY {
            return Err(EngineError::LimitExceeded("too many ranges on one weekday"));
        }
        for range in ranges {
            validate_range(range.start, range.end)?;
        }
    }
    Ok(())
}

/// Can `user_id` place a new claim on `slot`?
///
/// A slot is claimable iff it is bookable (no Pending or Accepted claim)
/// and the user holds no claim of any status on it.
pub(crate) fn check_claimable(slot: &Slot, user_id: Ulid) -> Result<(), EngineError> {
    if slot.claim_of(user_id).is_some() {
        return Err(EngineError::DuplicateClaim { user_id });
    }
    if !slot.is_bookable() {
        return Err(EngineError::SlotTaken { start: slot.start, end: slot.end });
    }
    if slot.claims.len() >= MAX_CLAIMS_PER_SLOT {
        return Err(EngineError::LimitExceeded("too many claims on one slot"));
    }
    Ok(())
}

/// Locate a slot inside an aggregate for a booking operation, walking the
/// NotFound taxonomy in precedence order: expert → date → slot.
pub(crate) fn find_active_slot<'a>(
    state: &'a AvailabilityState,
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
) -> Result<&'a Slot, EngineError> {
    let day = state
        .active_override(date)
        .ok_or(EngineError::DateNotFound { expert_id: state.expert_id, date })?;
    day.slot(start, end)
        .ok_or(EngineError::SlotNotFound { date, start, end })
}
