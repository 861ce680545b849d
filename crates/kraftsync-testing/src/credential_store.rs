//! In-memory credential store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use kraftsync_core::{Credential, CredentialStore, Result};

#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<HashMap<String, Credential>>,
    saves: AtomicU32,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(site_id: &str, credential: Credential) -> Self {
        let store = Self::new();
        store
            .credentials
            .lock()
            .insert(site_id.to_string(), credential);
        store
    }

    pub fn get(&self, site_id: &str) -> Option<Credential> {
        self.credentials.lock().get(site_id).cloned()
    }

    pub fn saves(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, site_id: &str) -> Result<Option<Credential>> {
        Ok(self.get(site_id))
    }

    async fn save(&self, site_id: &str, credential: &Credential) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.credentials
            .lock()
            .insert(site_id.to_string(), credential.clone());
        Ok(())
    }
}
