//! Bearer credential lifecycle for one site.
//!
//! The manager hands out access tokens, refreshing them shortly before
//! expiry. Refreshes are single-flight: concurrent callers wait on the same
//! lock and reuse the refreshed token instead of spending the refresh token
//! twice. A rejected refresh moves the manager into the needs-reauth state,
//! which only a newly installed credential clears.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use kraftsync_core::{Credential, DynCredentialStore, Error, Result};

use crate::api::TokenRefresher;

/// Coarse credential state for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Missing,
    Valid,
    Expiring,
    NeedsReauth,
}

pub struct TokenManager {
    site_id: String,
    credential: Mutex<Option<Credential>>,
    refresher: Arc<dyn TokenRefresher>,
    store: Option<DynCredentialStore>,
    margin: chrono::Duration,
    needs_reauth: AtomicBool,
    refreshes: AtomicU64,
}

impl TokenManager {
    pub fn new(
        site_id: impl Into<String>,
        refresher: Arc<dyn TokenRefresher>,
        margin: chrono::Duration,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            credential: Mutex::new(None),
            refresher,
            store: None,
            margin,
            needs_reauth: AtomicBool::new(false),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn with_store(mut self, store: DynCredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Install a credential, e.g. after the user re-authorized.
    pub async fn install(&self, credential: Credential) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(&self.site_id, &credential).await?;
        }
        *self.credential.lock().await = Some(credential);
        self.needs_reauth.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Load the stored credential, if any. Returns whether one was found.
    pub async fn load_from_store(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        match store.load(&self.site_id).await? {
            Some(credential) => {
                *self.credential.lock().await = Some(credential);
                self.needs_reauth.store(false, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current access token, refreshed first when it expires within the margin.
    pub async fn get_valid_token(&self) -> Result<String> {
        if self.needs_reauth.load(Ordering::SeqCst) {
            return Err(Error::NeedsReauth(self.site_id.clone()));
        }
        let mut guard = self.credential.lock().await;
        let expiring = match guard.as_ref() {
            None => return Err(Error::NeedsReauth(self.site_id.clone())),
            Some(c) => c.expires_within(self.margin, Utc::now()),
        };
        if expiring {
            debug!(site_id = %self.site_id, "Access token expiring, refreshing");
            self.refresh_locked(&mut guard).await?;
        }
        guard
            .as_ref()
            .map(|c| c.access_token.clone())
            .ok_or_else(|| Error::NeedsReauth(self.site_id.clone()))
    }

    /// Refresh after `rejected` was refused by the cloud.
    ///
    /// If another caller already replaced that token, the newer one is
    /// returned without refreshing again.
    pub async fn refresh_after_rejection(&self, rejected: &str) -> Result<String> {
        if self.needs_reauth.load(Ordering::SeqCst) {
            return Err(Error::NeedsReauth(self.site_id.clone()));
        }
        let mut guard = self.credential.lock().await;
        match guard.as_ref() {
            None => return Err(Error::NeedsReauth(self.site_id.clone())),
            Some(c) if c.access_token != rejected => return Ok(c.access_token.clone()),
            Some(_) => {}
        }
        self.refresh_locked(&mut guard).await?;
        guard
            .as_ref()
            .map(|c| c.access_token.clone())
            .ok_or_else(|| Error::NeedsReauth(self.site_id.clone()))
    }

    async fn refresh_locked(&self, slot: &mut Option<Credential>) -> Result<()> {
        let refresh_token = match slot.as_ref() {
            Some(c) => c.refresh_token.clone(),
            None => return Err(Error::NeedsReauth(self.site_id.clone())),
        };
        match self.refresher.refresh(&refresh_token).await {
            Ok(credential) => {
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                if let Some(store) = &self.store {
                    if let Err(e) = store.save(&self.site_id, &credential).await {
                        warn!(site_id = %self.site_id, error = %e, "Failed to persist refreshed credential");
                    }
                }
                info!(site_id = %self.site_id, expires_at = %credential.expires_at, "Access token refreshed");
                *slot = Some(credential);
                Ok(())
            }
            Err(e) if e.is_auth() => {
                self.mark_needs_reauth();
                Err(Error::NeedsReauth(self.site_id.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Give up on the current credential until a new one is installed.
    pub fn mark_needs_reauth(&self) {
        if !self.needs_reauth.swap(true, Ordering::SeqCst) {
            warn!(site_id = %self.site_id, "Cloud connection needs re-authentication");
        }
    }

    pub fn needs_reauth(&self) -> bool {
        self.needs_reauth.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub async fn state(&self) -> TokenState {
        if self.needs_reauth() {
            return TokenState::NeedsReauth;
        }
        match self.credential.lock().await.as_ref() {
            None => TokenState::Missing,
            Some(c) if c.expires_within(self.margin, Utc::now()) => TokenState::Expiring,
            Some(_) => TokenState::Valid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct CountingRefresher {
        calls: AtomicU32,
        reject: bool,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<Credential> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if self.reject {
                return Err(Error::Auth("invalid_grant".into()));
            }
            Ok(Credential {
                access_token: format!("access-{}", n),
                refresh_token: "refresh".into(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    fn manager(reject: bool) -> (Arc<CountingRefresher>, TokenManager) {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
            reject,
        });
        let manager = TokenManager::new("site", refresher.clone(), chrono::Duration::seconds(60));
        (refresher, manager)
    }

    fn credential(expires_in_secs: i64) -> Credential {
        Credential {
            access_token: "access-0".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
        }
    }

    #[tokio::test]
    async fn test_valid_token_is_returned_without_refresh() {
        let (refresher, manager) = manager(false);
        manager.install(credential(3600)).await.unwrap();
        assert_eq!(manager.get_valid_token().await.unwrap(), "access-0");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state().await, TokenState::Valid);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_once_under_concurrency() {
        let (refresher, manager) = manager(false);
        manager.install(credential(10)).await.unwrap();
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = manager.clone();
                tokio::spawn(async move { m.get_valid_token().await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "access-1");
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_refresh_is_single_flight() {
        let (refresher, manager) = manager(false);
        manager.install(credential(3600)).await.unwrap();

        let first = manager.refresh_after_rejection("access-0").await.unwrap();
        let second = manager.refresh_after_rejection("access-0").await.unwrap();
        assert_eq!(first, "access-1");
        assert_eq!(second, "access-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_needs_reauth() {
        let (_, manager) = manager(true);
        manager.install(credential(10)).await.unwrap();

        let err = manager.get_valid_token().await.unwrap_err();
        assert!(matches!(err, Error::NeedsReauth(_)));
        assert_eq!(manager.state().await, TokenState::NeedsReauth);

        manager.install(credential(3600)).await.unwrap();
        assert_eq!(manager.get_valid_token().await.unwrap(), "access-0");
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let (_, manager) = manager(false);
        assert!(matches!(
            manager.get_valid_token().await,
            Err(Error::NeedsReauth(_))
        ));
        assert_eq!(manager.state().await, TokenState::Missing);
    }
}
