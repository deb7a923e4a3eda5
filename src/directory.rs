use dashmap::DashMap;
use ulid::Ulid;

use crate::model::UserRole;

/// Display attributes mirrored from the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: UserRole,
}

/// In-process mirror of the external identity service: user id → profile.
/// Read-only from the booking path; populated through `UserRegistered`
/// journal events so roles survive a restart.
pub struct UserDirectory {
    users: DashMap<Ulid, UserProfile>,
}

impl Default for UserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl UserDirectory {
    pub fn new() -> Self {
        Self { users: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Upsert — re-registering refreshes display attributes and role.
    pub fn register(&self, profile: UserProfile) {
        self.users.insert(profile.id, profile);
    }

    pub fn resolve(&self, id: Ulid) -> Option<UserProfile> {
        self.users.get(&id).map(|e| e.value().clone())
    }

    pub fn role(&self, id: Ulid) -> Option<UserRole> {
        self.users.get(&id).map(|e| e.value().role)
    }

    /// Best-effort display name for notifications and booking listings.
    pub fn display_name(&self, id: Ulid) -> Option<String> {
        self.users.get(&id).map(|e| e.value().name.clone())
    }

    pub fn snapshot(&self) -> Vec<UserProfile> {
        self.users.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(role: UserRole) -> UserProfile {
        UserProfile {
            id: Ulid::new(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            role,
        }
    }

    #[test]
    fn register_and_resolve() {
        let dir = UserDirectory::new();
        let p = profile(UserRole::Expert);
        dir.register(p.clone());
        assert_eq!(dir.resolve(p.id), Some(p.clone()));
        assert_eq!(dir.role(p.id), Some(UserRole::Expert));
        assert_eq!(dir.display_name(p.id).as_deref(), Some("Ada"));
    }

    #[test]
    fn unknown_user_resolves_to_none() {
        let dir = UserDirectory::new();
        assert!(dir.resolve(Ulid::new()).is_none());
        assert!(dir.role(Ulid::new()).is_none());
    }

    #[test]
    fn reregister_updates_profile() {
        let dir = UserDirectory::new();
        let mut p = profile(UserRole::Member);
        dir.register(p.clone());
        p.role = UserRole::Expert;
        p.name = "Ada L.".into();
        dir.register(p.clone());
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.role(p.id), Some(UserRole::Expert));
        assert_eq!(dir.display_name(p.id).as_deref(), Some("Ada L."));
    }
}
