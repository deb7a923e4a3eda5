use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::AvailabilityState;

pub type SharedAvailability = Arc<RwLock<AvailabilityState>>;

/// One availability aggregate per expert. The per-expert `RwLock` is the
/// unit of mutual exclusion: every mutation happens under one write guard,
/// so concurrent operations on the same expert serialize and no aggregate
/// is ever observed partially mutated.
pub struct AvailabilityStore {
    experts: DashMap<Ulid, SharedAvailability>,
}

impl Default for AvailabilityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityStore {
    pub fn new() -> Self {
        Self { experts: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    pub fn contains(&self, expert_id: &Ulid) -> bool {
        self.experts.contains_key(expert_id)
    }

    pub fn get(&self, expert_id: &Ulid) -> Option<SharedAvailability> {
        self.experts.get(expert_id).map(|e| e.value().clone())
    }

    /// Lazy creation: an expert's aggregate comes into being on their
    /// first write.
    pub fn get_or_create(&self, expert_id: Ulid) -> SharedAvailability {
        self.experts
            .entry(expert_id)
            .or_insert_with(|| Arc::new(RwLock::new(AvailabilityState::new(expert_id))))
            .value()
            .clone()
    }

    pub fn expert_ids(&self) -> Vec<Ulid> {
        self.experts.iter().map(|e| *e.key()).collect()
    }

    /// Experts with an active override on `date`. Callers are async and
    /// each aggregate read takes the shared lock.
    pub async fn experts_available_on(&self, date: NaiveDate) -> Vec<Ulid> {
        let mut out = Vec::new();
        for expert_id in self.expert_ids() {
            if let Some(rs) = self.get(&expert_id) {
                let guard = rs.read().await;
                if guard.has_active_override(date) {
                    out.push(expert_id);
                }
            }
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = AvailabilityStore::new();
        let expert = Ulid::new();
        let a = store.get_or_create(expert);
        let b = store.get_or_create(expert);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = AvailabilityStore::new();
        assert!(store.get(&Ulid::new()).is_none());
    }

    #[tokio::test]
    async fn experts_available_on_filters_by_active_override() {
        let date = NaiveDate::parse_from_str("2025-01-06", "%Y-%m-%d").unwrap();
        let other = NaiveDate::parse_from_str("2025-01-07", "%Y-%m-%d").unwrap();

        let store = AvailabilityStore::new();
        let with_override = Ulid::new();
        let without = Ulid::new();

        store
            .get_or_create(with_override)
            .write()
            .await
            .upsert_override(date, Vec::new());
        store
            .get_or_create(without)
            .write()
            .await
            .upsert_override(other, Vec::new());

        assert_eq!(store.experts_available_on(date).await, vec![with_override]);
    }
}
