use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use url::Url;

use super::{CredentialVault, RegistryError};
use crate::config::SiteQuota;
use crate::db::{DbError, MonitoredSite, NewSite, SiteFilter, Store};
use crate::probe::ConnectClient;

/// A site URL in canonical form plus the scheme-less identity used for
/// duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    pub url: String,
    pub key: String,
}

/// Default to https, lowercase the host, drop query, fragment and trailing
/// slashes. `www.` is left alone.
pub fn normalize_url(raw: &str) -> Result<NormalizedUrl, RegistryError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(RegistryError::MissingUrl);
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    let mut parsed =
        Url::parse(&with_scheme).map_err(|e| RegistryError::InvalidUrl(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RegistryError::InvalidUrl(format!("unsupported scheme {}", parsed.scheme())));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(RegistryError::InvalidUrl("missing host".to_string()));
    }
    parsed.set_query(None);
    parsed.set_fragment(None);

    let url = parsed.as_str().trim_end_matches('/').to_string();
    let key = url
        .split_once("://")
        .map(|(_, rest)| rest.to_string())
        .unwrap_or_else(|| url.clone());
    Ok(NormalizedUrl { url, key })
}

/// Quota usage for one account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub used: usize,
    /// `None` when unlimited.
    pub limit: Option<u32>,
    pub can_add: bool,
}

/// CRUD and access control for monitored sites.
#[derive(Clone)]
pub struct SiteRegistry {
    store: Arc<Store>,
    vault: CredentialVault,
    connect: ConnectClient,
    quota: SiteQuota,
}

impl SiteRegistry {
    pub fn new(
        store: Arc<Store>,
        vault: CredentialVault,
        connect: ConnectClient,
        quota: SiteQuota,
    ) -> Self {
        Self {
            store,
            vault,
            connect,
            quota,
        }
    }

    /// Register a site after a successful handshake and return its ID.
    ///
    /// Duplicates within the account are rejected before any call to the
    /// remote site.
    pub async fn add(
        &self,
        user_id: i64,
        site_url: &str,
        site_key: &str,
        site_name: Option<&str>,
    ) -> Result<i64, RegistryError> {
        let normalized = normalize_url(site_url)?;
        let site_key = site_key.trim();
        if site_key.is_empty() {
            return Err(RegistryError::MissingKey);
        }

        let user_ids = self.store.account_user_ids(user_id)?;
        if self.store.find_site_by_url_key(&normalized.key, &user_ids)?.is_some() {
            return Err(RegistryError::SiteExists);
        }
        if !self.can_add_site(user_id)? {
            return Err(RegistryError::SiteLimitReached);
        }

        let verify = self.connect.verify_connection(&normalized.url, site_key).await?;

        let site_name = site_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or(verify.site_name)
            .unwrap_or_else(|| normalized.key.clone());
        let suite = verify.peanut_suite.unwrap_or_default();
        let credential = self.vault.seal(site_key)?;

        let new_site = NewSite {
            user_id,
            site_url: normalized.url.clone(),
            url_key: normalized.key,
            site_name,
            site_key_hash: credential.fingerprint,
            sealed_key: credential.sealed,
            peanut_suite_installed: suite.installed,
            peanut_suite_version: suite.version,
        };
        // Another request may have registered the same URL during the handshake.
        let id = match self.store.insert_site_in_account(&new_site, &user_ids) {
            Err(DbError::Duplicate) => return Err(RegistryError::SiteExists),
            other => other?,
        };

        tracing::info!("Registered site {} ({}) for user {}", id, normalized.url, user_id);
        Ok(id)
    }

    /// A site visible to `user_id`.
    pub fn get(&self, user_id: i64, site_id: i64) -> Result<MonitoredSite, RegistryError> {
        let site = self.store.get_site(site_id)?;
        let user_ids = self.store.account_user_ids(user_id)?;
        if !user_ids.contains(&site.user_id) {
            return Err(RegistryError::NotFound);
        }
        Ok(site)
    }

    pub fn get_all(
        &self,
        user_id: i64,
        filter: &SiteFilter,
    ) -> Result<Vec<MonitoredSite>, RegistryError> {
        let user_ids = self.store.account_user_ids(user_id)?;
        Ok(self.store.list_sites(&user_ids, filter)?)
    }

    /// Tell the site it is being disconnected (failure ignored), then purge
    /// its data and credential before the registry row. Each delete is safe
    /// to repeat.
    pub async fn disconnect(&self, user_id: i64, site_id: i64) -> Result<(), RegistryError> {
        let site = self.get(user_id, site_id)?;

        match self.vault.site_key(site.id) {
            Ok(key) => {
                if let Err(e) = self
                    .connect
                    .request(&site.site_url, &key, "disconnect", Method::POST, None)
                    .await
                {
                    tracing::warn!("Disconnect notice to {} failed: {}", site.site_url, e);
                }
            }
            Err(e) => tracing::warn!("No usable key for site {}: {}", site.id, e),
        }

        self.store.delete_site_data(site.id)?;
        self.store.delete_site(site.id)?;
        tracing::info!("Disconnected site {} ({})", site.id, site.site_url);
        Ok(())
    }

    pub fn can_add_site(&self, user_id: i64) -> Result<bool, RegistryError> {
        Ok(self.quota_usage(user_id)?.can_add)
    }

    pub fn quota_usage(&self, user_id: i64) -> Result<QuotaUsage, RegistryError> {
        let user_ids = self.store.account_user_ids(user_id)?;
        let used = self.store.count_sites(&user_ids)?;
        Ok(QuotaUsage {
            used,
            limit: match self.quota {
                SiteQuota::Unlimited => None,
                SiteQuota::Limited(n) => Some(n),
            },
            can_add: self.quota.allows(used),
        })
    }
}
