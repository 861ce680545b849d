//! Credential store backed by a JSON file.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use kraftsync_core::{Credential, CredentialStore, Error, Result};

/// Keeps one credential per site in a single JSON document.
pub struct FileCredentialStore {
    path: PathBuf,
    /// Serializes read-modify-write of the file
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, Credential>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(HashMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, site_id: &str) -> Result<Option<Credential>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(site_id))
    }

    async fn save(&self, site_id: &str, credential: &Credential) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(site_id.to_string(), credential.clone());
        let text = serde_json::to_string_pretty(&all)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| Error::Io(format!("cannot write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
