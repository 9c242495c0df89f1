use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::User;

/// Opaque caller reference as it arrives on the wire. The engine never
/// interprets it — resolution belongs to the directory collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallerRef {
    pub user_id: Option<Ulid>,
    pub credential: Option<String>,
}

/// External identity collaborator. Implementations own the lookup fallback
/// order: primary user id first, then the auth credential.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn resolve(&self, caller: &CallerRef) -> Option<User>;
    async fn get(&self, id: &Ulid) -> Option<User>;
}

/// Directory backed by an in-process map, seeded from a JSON file of user
/// records at startup.
pub struct InMemoryDirectory {
    by_id: DashMap<Ulid, User>,
    by_credential: DashMap<String, Ulid>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_credential: DashMap::new(),
        }
    }

    pub fn insert(&self, user: User) {
        if let Some(ref cred) = user.credential {
            self.by_credential.insert(cred.clone(), user.id);
        }
        self.by_id.insert(user.id, user);
    }

    /// Load a JSON array of user records.
    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read(path)?;
        let users: Vec<User> = serde_json::from_slice(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let dir = Self::new();
        for user in users {
            dir.insert(user);
        }
        Ok(dir)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn resolve(&self, caller: &CallerRef) -> Option<User> {
        if let Some(ref id) = caller.user_id {
            if let Some(user) = self.by_id.get(id) {
                return Some(user.value().clone());
            }
        }
        let cred = caller.credential.as_ref()?;
        let id = *self.by_credential.get(cred)?.value();
        self.by_id.get(&id).map(|u| u.value().clone())
    }

    async fn get(&self, id: &Ulid) -> Option<User> {
        self.by_id.get(id).map(|u| u.value().clone())
    }
}
