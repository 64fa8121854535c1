use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{anyhow, Result};

/// Access levels. Full implies read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Full,
    Read,
}

/// Job access table: every job has exactly one owner with full rights;
/// superusers get blanket full or read rights on jobs that exist in
/// the table. An object that is not in the table is denied to
/// everyone, so removing a job invalidates all later checks for it.
pub struct AccessControl {
    users: RwLock<SuperUsers>,
    owners: RwLock<HashMap<String, String>>,
}

#[derive(Default)]
struct SuperUsers {
    full: HashSet<String>,
    read: HashSet<String>,
}

impl AccessControl {
    pub fn new() -> AccessControl {
        AccessControl {
            users: RwLock::new(SuperUsers::default()),
            owners: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_superusers(&self, ids: &[String], access: AccessType) {
        let mut users = self.users.write().unwrap();
        let set = match access {
            AccessType::Full => &mut users.full,
            AccessType::Read => &mut users.read,
        };
        for id in ids {
            set.insert(id.clone());
        }
    }

    pub fn set_owner(&self, object: &str, user: &str) -> Result<()> {
        let user = user.trim();
        if user.is_empty() {
            return Err(anyhow!("invalid user: {:?}", user));
        }
        let object = object.trim();
        if object.is_empty() {
            return Err(anyhow!("invalid object: {:?}", object));
        }

        self.owners
            .write()
            .unwrap()
            .insert(object.to_string(), user.to_string());
        Ok(())
    }

    pub fn remove(&self, object: &str) -> Result<()> {
        let mut owners = self.owners.write().unwrap();
        if owners.remove(object).is_none() {
            return Err(anyhow!("object not found"));
        }
        Ok(())
    }

    pub fn check(&self, subject: &str, object: &str, action: AccessType) -> bool {
        let owners = self.owners.read().unwrap();
        let owner = match owners.get(object) {
            Some(owner) => owner,
            None => return false,
        };
        if owner == subject {
            return true;
        }

        let users = self.users.read().unwrap();
        if users.full.contains(subject) {
            return true;
        }
        if action == AccessType::Read && users.read.contains(subject) {
            return true;
        }

        false
    }
}

impl Default for AccessControl {
    fn default() -> AccessControl {
        AccessControl::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl() -> AccessControl {
        let acl = AccessControl::new();
        acl.add_superusers(&["admin".to_string()], AccessType::Full);
        acl.add_superusers(&["auditor".to_string()], AccessType::Read);
        acl.set_owner("job1", "alice").unwrap();
        acl
    }

    #[test]
    fn owner_has_full_access() {
        let acl = acl();
        assert!(acl.check("alice", "job1", AccessType::Full));
        assert!(acl.check("alice", "job1", AccessType::Read));
    }

    #[test]
    fn stranger_is_denied() {
        let acl = acl();
        assert!(!acl.check("bob", "job1", AccessType::Full));
        assert!(!acl.check("bob", "job1", AccessType::Read));
    }

    #[test]
    fn full_superuser_gets_everything() {
        let acl = acl();
        assert!(acl.check("admin", "job1", AccessType::Full));
        assert!(acl.check("admin", "job1", AccessType::Read));
    }

    #[test]
    fn read_superuser_gets_read_only() {
        let acl = acl();
        assert!(acl.check("auditor", "job1", AccessType::Read));
        assert!(!acl.check("auditor", "job1", AccessType::Full));
    }

    #[test]
    fn unknown_object_is_denied_to_everyone() {
        let acl = acl();
        assert!(!acl.check("alice", "job2", AccessType::Read));
        assert!(!acl.check("admin", "job2", AccessType::Full));
    }

    #[test]
    fn remove_invalidates_later_checks() {
        let acl = acl();
        acl.remove("job1").unwrap();
        assert!(!acl.check("alice", "job1", AccessType::Full));
        assert!(!acl.check("alice", "job1", AccessType::Read));
        assert!(!acl.check("admin", "job1", AccessType::Full));
        assert!(acl.remove("job1").is_err());
    }

    #[test]
    fn owner_can_change() {
        let acl = acl();
        acl.set_owner("job1", "bob").unwrap();
        assert!(acl.check("bob", "job1", AccessType::Full));
        assert!(!acl.check("alice", "job1", AccessType::Full));
    }

    #[test]
    fn blank_ids_are_rejected() {
        let acl = acl();
        assert!(acl.set_owner("job1", "  ").is_err());
        assert!(acl.set_owner("", "alice").is_err());
    }
}
