use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::directory::UserProfile;
use crate::limits::*;
use crate::model::*;
use crate::notify::{booking_details, BookingNotice, NoticeAction};

use super::conflict::{
    check_claimable, find_active_slot, now_ms, validate_message, validate_override_slots,
    validate_range, validate_template,
};
use super::{Engine, EngineError};

impl Engine {
    /// Mirror a profile from the identity collaborator. Upsert: a second
    /// registration refreshes name/email/role.
    pub async fn register_user(
        &self,
        id: Ulid,
        name: String,
        email: String,
        role: UserRole,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        if email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("email too long"));
        }
        if self.directory().resolve(id).is_none()
            && self.directory().len() >= MAX_USERS_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many users"));
        }

        let event = Event::UserRegistered {
            id,
            name: name.clone(),
            email: email.clone(),
            role,
        };
        self.journal_append(&event).await?;
        self.directory().register(UserProfile { id, name, email, role });
        Ok(())
    }

    /// Replace the expert's weekly recurring template wholesale.
    pub async fn set_weekly(
        &self,
        caller: Ulid,
        expert_id: Ulid,
        template: WeeklyTemplate,
    ) -> Result<(), EngineError> {
        self.require_owning_expert(caller, expert_id)?;
        validate_template(&template)?;
        self.ensure_expert_capacity(expert_id)?;

        let rs = self.store.get_or_create(expert_id);
        let mut guard = rs.write().await;
        let event = Event::WeeklySet { expert_id, template };
        let notice = availability_notice(expert_id, "weekly_template");
        self.persist_and_apply(&mut guard, &event, Some(notice)).await
    }

    /// Replace the expert's blocked-date set wholesale.
    pub async fn set_blocked_dates(
        &self,
        caller: Ulid,
        expert_id: Ulid,
        dates: BTreeSet<NaiveDate>,
    ) -> Result<(), EngineError> {
        self.require_owning_expert(caller, expert_id)?;
        if dates.len() > MAX_BLOCKED_DATES {
            return Err(EngineError::LimitExceeded("too many blocked dates"));
        }
        self.ensure_expert_capacity(expert_id)?;

        let rs = self.store.get_or_create(expert_id);
        let mut guard = rs.write().await;
        let event = Event::BlockedDatesSet { expert_id, dates };
        let notice = availability_notice(expert_id, "blocked_dates");
        self.persist_and_apply(&mut guard, &event, Some(notice)).await
    }

    /// Create or wholesale-replace the override for one date. Any claims
    /// on that date's previous slots are destroyed — callers must
    /// read-modify-write if claims have to survive.
    pub async fn set_date_slots(
        &self,
        caller: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
        slots: Vec<SlotSpec>,
    ) -> Result<(), EngineError> {
        self.require_owning_expert(caller, expert_id)?;
        validate_override_slots(&slots)?;
        self.ensure_expert_capacity(expert_id)?;

        let rs = self.store.get_or_create(expert_id);
        let mut guard = rs.write().await;
        if guard.override_for(date).is_none()
            && guard.overrides.len() >= MAX_OVERRIDES_PER_EXPERT
        {
            return Err(EngineError::LimitExceeded("too many date overrides"));
        }

        let event = Event::OverrideSet { expert_id, date, slots };
        let notice = availability_notice(expert_id, "date_override");
        self.persist_and_apply(&mut guard, &event, Some(notice)).await
    }

    /// Soft-delete the override for one date. The record and its claims
    /// stay behind `is_active = false`.
    pub async fn remove_date_slots(
        &self,
        caller: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
    ) -> Result<(), EngineError> {
        self.require_owning_expert(caller, expert_id)?;
        let rs = self
            .store
            .get(&expert_id)
            .ok_or(EngineError::ExpertNotFound(expert_id))?;
        let mut guard = rs.write().await;
        if guard.active_override(date).is_none() {
            return Err(EngineError::DateNotFound { expert_id, date });
        }

        let event = Event::OverrideRemoved { expert_id, date };
        let notice = availability_notice(expert_id, "date_override_removed");
        self.persist_and_apply(&mut guard, &event, Some(notice)).await
    }

    /// File a Pending claim on a slot. Only slots inside an active date
    /// override are bookable; the weekly template is display data.
    ///
    /// Returns the updated aggregate.
    pub async fn request_booking(
        &self,
        caller: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        user_id: Ulid,
        message: Option<String>,
    ) -> Result<AvailabilityState, EngineError> {
        require_self(caller, user_id)?;
        validate_range(start, end)?;
        validate_message(message.as_deref())?;

        let rs = self
            .store
            .get(&expert_id)
            .ok_or(EngineError::ExpertNotFound(expert_id))?;
        let mut guard = rs.write().await;
        {
            let slot = find_active_slot(&guard, date, start, end)?;
            check_claimable(slot, user_id)?;
        }

        let created_at = now_ms();
        let event = Event::ClaimRequested {
            expert_id,
            date,
            start,
            end,
            user_id,
            message,
            created_at,
        };
        let notice = BookingNotice {
            expert_id,
            user_id: Some(user_id),
            action: NoticeAction::ExpertBooking,
            details: booking_details(date, start, end, Some(created_at)),
        };
        self.persist_and_apply(&mut guard, &event, Some(notice)).await?;
        Ok(guard.clone())
    }

    /// Withdraw a claim. Succeeds as a no-op when the user holds no claim
    /// on the slot — lenient by documented design.
    pub async fn cancel_booking(
        &self,
        caller: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        user_id: Ulid,
    ) -> Result<(), EngineError> {
        require_self(caller, user_id)?;

        let rs = self
            .store
            .get(&expert_id)
            .ok_or(EngineError::ExpertNotFound(expert_id))?;
        let mut guard = rs.write().await;
        let slot = find_active_slot(&guard, date, start, end)?;
        if slot.claim_of(user_id).is_none() {
            return Ok(());
        }

        let event = Event::ClaimCancelled { expert_id, date, start, end, user_id };
        let notice = BookingNotice {
            expert_id,
            user_id: Some(user_id),
            action: NoticeAction::ExpertBookingCancel,
            details: booking_details(date, start, end, None),
        };
        self.persist_and_apply(&mut guard, &event, Some(notice)).await
    }

    /// Accept or reject a claim. Accepting forces every sibling claim on
    /// the slot to Rejected; rejecting touches only the target.
    pub async fn set_booking_status(
        &self,
        caller: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        user_id: Ulid,
        decision: Decision,
    ) -> Result<(), EngineError> {
        self.require_owning_expert(caller, expert_id)?;

        let rs = self
            .store
            .get(&expert_id)
            .ok_or(EngineError::ExpertNotFound(expert_id))?;
        let mut guard = rs.write().await;
        {
            let slot = find_active_slot(&guard, date, start, end)?;
            if slot.claim_of(user_id).is_none() {
                return Err(EngineError::ClaimNotFound { user_id });
            }
        }

        let event = Event::ClaimDecided { expert_id, date, start, end, user_id, decision };
        let action = match decision {
            Decision::Accept => NoticeAction::BookingAccepted,
            Decision::Reject => NoticeAction::BookingRejected,
        };
        let mut details = booking_details(date, start, end, None);
        if let Some(name) = self.directory().display_name(expert_id) {
            details["expert_name"] = serde_json::json!(name);
        }
        let notice = BookingNotice {
            expert_id,
            user_id: Some(user_id),
            action,
            details,
        };
        self.persist_and_apply(&mut guard, &event, Some(notice)).await
    }

    /// Overwrite a slot's message (e.g. a meeting link) regardless of its
    /// booking status.
    pub async fn edit_slot_message(
        &self,
        caller: Ulid,
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        message: Option<String>,
    ) -> Result<(), EngineError> {
        self.require_owning_expert(caller, expert_id)?;
        validate_message(message.as_deref())?;

        let rs = self
            .store
            .get(&expert_id)
            .ok_or(EngineError::ExpertNotFound(expert_id))?;
        let mut guard = rs.write().await;
        find_active_slot(&guard, date, start, end)?;

        let event = Event::SlotMessageSet { expert_id, date, start, end, message };
        let notice = availability_notice(expert_id, "slot_message");
        self.persist_and_apply(&mut guard, &event, Some(notice)).await
    }

    // ── Gates ────────────────────────────────────────────

    /// Availability mutations are reserved for the owning expert, and the
    /// caller must be registered as a domain expert.
    fn require_owning_expert(&self, caller: Ulid, expert_id: Ulid) -> Result<(), EngineError> {
        if caller != expert_id {
            return Err(EngineError::Forbidden(
                "only the owning expert may modify this availability",
            ));
        }
        match self.directory().role(caller) {
            Some(UserRole::Expert) => Ok(()),
            _ => Err(EngineError::Forbidden("caller is not a registered domain expert")),
        }
    }

    fn ensure_expert_capacity(&self, expert_id: Ulid) -> Result<(), EngineError> {
        if !self.store.contains(&expert_id) && self.store.len() >= MAX_EXPERTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many experts"));
        }
        Ok(())
    }
}

fn require_self(caller: Ulid, user_id: Ulid) -> Result<(), EngineError> {
    if caller != user_id {
        return Err(EngineError::Forbidden(
            "a booking claim can only be filed or withdrawn by its own user",
        ));
    }
    Ok(())
}

fn availability_notice(expert_id: Ulid, change: &'static str) -> BookingNotice {
    BookingNotice {
        expert_id,
        user_id: None,
        action: NoticeAction::AvailabilityChanged,
        details: serde_json::json!({ "change": change }),
    }
}
