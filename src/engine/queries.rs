use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Whole-aggregate read: everything the expert has published.
    pub async fn availability_snapshot(
        &self,
        expert_id: Ulid,
    ) -> Result<AvailabilityState, EngineError> {
        let rs = self
            .store
            .get(&expert_id)
            .ok_or(EngineError::ExpertNotFound(expert_id))?;
        let guard = rs.read().await;
        Ok(guard.clone())
    }

    /// Experts offering bookable time on `date` (an active override
    /// exists for it).
    pub async fn experts_available_on(&self, date: NaiveDate) -> Vec<Ulid> {
        self.store.experts_available_on(date).await
    }

    /// All claims across all dates for one expert, display attributes
    /// joined from the directory. Active overrides only — claims behind a
    /// soft-deleted date are history, not bookings.
    pub async fn bookings_for_expert(
        &self,
        expert_id: Ulid,
    ) -> Result<Vec<BookingEntry>, EngineError> {
        let rs = self
            .store
            .get(&expert_id)
            .ok_or(EngineError::ExpertNotFound(expert_id))?;
        let guard = rs.read().await;
        let mut entries = Vec::new();
        self.collect_entries(&guard, None, &mut entries);
        Ok(entries)
    }

    /// All claims by one user across every expert.
    pub async fn bookings_for_user(&self, user_id: Ulid) -> Vec<BookingEntry> {
        let mut entries = Vec::new();
        let mut expert_ids = self.store.expert_ids();
        expert_ids.sort();
        for expert_id in expert_ids {
            if let Some(rs) = self.store.get(&expert_id) {
                let guard = rs.read().await;
                self.collect_entries(&guard, Some(user_id), &mut entries);
            }
        }
        entries
    }

    fn collect_entries(
        &self,
        state: &AvailabilityState,
        only_user: Option<Ulid>,
        out: &mut Vec<BookingEntry>,
    ) {
        let expert_name = self.directory().display_name(state.expert_id);
        for day in state.overrides.iter().filter(|o| o.is_active) {
            for slot in &day.slots {
                for claim in &slot.claims {
                    if only_user.is_some_and(|u| u != claim.user_id) {
                        continue;
                    }
                    out.push(BookingEntry {
                        expert_id: state.expert_id,
                        expert_name: expert_name.clone(),
                        user_id: claim.user_id,
                        user_name: self.directory().display_name(claim.user_id),
                        date: day.date,
                        start: slot.start,
                        end: slot.end,
                        status: claim.status,
                        message: slot.message.clone(),
                        created_at: claim.created_at,
                    });
                }
            }
        }
    }
}
