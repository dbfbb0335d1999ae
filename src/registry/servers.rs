use chrono::Utc;
use std::sync::Arc;

use super::{CredentialVault, RegistryError};
use crate::db::{DbError, NewServer, PleskServer, Store};
use crate::probe::{PleskClient, PleskTarget, DEFAULT_PLESK_PORT};
use crate::scoring::{evaluate_quick, ServerMetrics};

/// Strip any scheme, path and trailing slash a user pasted with the host.
fn clean_host(raw: &str) -> String {
    let raw = raw.trim();
    let without_scheme = raw.split_once("://").map_or(raw, |(_, rest)| rest);
    without_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// CRUD and access control for Plesk servers.
#[derive(Clone)]
pub struct ServerRegistry {
    store: Arc<Store>,
    vault: CredentialVault,
    plesk: PleskClient,
}

impl ServerRegistry {
    pub fn new(store: Arc<Store>, vault: CredentialVault, plesk: PleskClient) -> Self {
        Self { store, vault, plesk }
    }

    /// Register a Plesk server. The initial snapshot uses the quick
    /// CPU/RAM/disk formula from a single statistics call; the scheduled
    /// check replaces it with a full one.
    pub async fn add(
        &self,
        user_id: i64,
        host: &str,
        port: Option<u16>,
        api_key: &str,
        name: Option<&str>,
    ) -> Result<i64, RegistryError> {
        let host = clean_host(host);
        if host.is_empty() {
            return Err(RegistryError::MissingUrl);
        }
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(RegistryError::MissingKey);
        }
        let port = port.unwrap_or(DEFAULT_PLESK_PORT);

        let user_ids = self.store.account_user_ids(user_id)?;
        if self.store.find_server(&host, port, &user_ids)?.is_some() {
            return Err(RegistryError::ServerExists);
        }

        let target = PleskTarget {
            host: &host,
            port,
            api_key,
        };
        let info = self.plesk.server_info(&target).await?;
        let stats = self.plesk.statistics(&target).await?;

        let health = evaluate_quick(
            &ServerMetrics {
                cpu_usage: stats.cpu_usage,
                ram_usage: stats.ram_usage,
                disk_usage: stats.disk_usage,
                ..Default::default()
            },
            Utc::now(),
        );

        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or(info.hostname)
            .unwrap_or_else(|| host.clone());
        let credential = self.vault.seal(api_key)?;

        let new_server = NewServer {
            user_id,
            name,
            host: host.clone(),
            port,
            sealed_key: credential.sealed,
            plesk_version: info.plesk_version,
            os_info: info.os_info,
            last_health: serde_json::to_value(&health)?,
        };
        let id = match self.store.insert_server_in_account(&new_server, &user_ids) {
            Err(DbError::Duplicate) => return Err(RegistryError::ServerExists),
            other => other?,
        };

        tracing::info!("Registered Plesk server {} ({}:{}) for user {}", id, host, port, user_id);
        Ok(id)
    }

    pub fn get(&self, user_id: i64, server_id: i64) -> Result<PleskServer, RegistryError> {
        let server = self.store.get_server(server_id)?;
        let user_ids = self.store.account_user_ids(user_id)?;
        if !user_ids.contains(&server.user_id) {
            return Err(RegistryError::NotFound);
        }
        Ok(server)
    }

    pub fn get_all(&self, user_id: i64) -> Result<Vec<PleskServer>, RegistryError> {
        let user_ids = self.store.account_user_ids(user_id)?;
        Ok(self.store.list_servers(&user_ids)?)
    }

    pub fn remove(&self, user_id: i64, server_id: i64) -> Result<(), RegistryError> {
        let server = self.get(user_id, server_id)?;
        self.store.delete_server(server.id)?;
        tracing::info!("Removed Plesk server {} ({})", server.id, server.host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CredentialCipher;
    use crate::probe::mock_panel;
    use crate::probe::test_server::serve;
    use tempfile::NamedTempFile;

    fn split(base: &str) -> (String, u16) {
        let (host, port) = base.trim_start_matches("http://").split_once(':').unwrap();
        (host.to_string(), port.parse().unwrap())
    }

    fn registry() -> (NamedTempFile, Arc<Store>, ServerRegistry) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let vault = CredentialVault::new(store.clone(), CredentialCipher::new("s"));
        let plesk = PleskClient::new(reqwest::Client::new()).insecure_http();
        let registry = ServerRegistry::new(store.clone(), vault, plesk);
        (tmp, store, registry)
    }

    #[test]
    fn test_clean_host() {
        assert_eq!(clean_host("https://Panel.Example.com/login"), "panel.example.com");
        assert_eq!(clean_host(" 10.0.0.5 "), "10.0.0.5");
        assert_eq!(clean_host(""), "");
    }

    #[tokio::test]
    async fn test_add_uses_quick_formula() {
        let (_tmp, store, registry) = registry();
        let (host, port) = split(&serve(mock_panel::panel(95.0)).await);

        let id = registry.add(1, &host, Some(port), "plesk-key", None).await.unwrap();
        let server = registry.get(1, id).unwrap();
        assert_eq!(server.name, "web-01.example.com");
        assert_eq!(server.plesk_version.as_deref(), Some("18.0.61"));

        // Quick formula: CPU critical costs its full 30 points.
        let health = server.last_health.unwrap();
        assert_eq!(health["formula"], "quick");
        assert_eq!(health["score"], 70);
        assert!(store.server_sealed_key(id).unwrap().is_some());

        let err = registry.add(1, &host, Some(port), "plesk-key", None).await.unwrap_err();
        assert_eq!(err.code(), "server_exists");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_add_keeps_one_row() {
        let (_tmp, _store, registry) = registry();
        let (host, port) = split(&serve(mock_panel::panel(10.0)).await);

        let (a, b) = tokio::join!(
            registry.add(1, &host, Some(port), "plesk-key", None),
            registry.add(1, &host, Some(port), "plesk-key", None),
        );
        let codes: Vec<_> = [a, b].iter().map(|r| r.as_ref().err().map(|e| e.code())).collect();
        assert!(codes.contains(&None));
        assert!(codes.contains(&Some("server_exists")));
        assert_eq!(registry.get_all(1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_errors() {
        let (_tmp, _store, registry) = registry();
        let (host, port) = split(&serve(mock_panel::panel(10.0)).await);

        assert_eq!(registry.add(1, " ", None, "k", None).await.unwrap_err().code(), "missing_url");
        assert_eq!(registry.add(1, &host, None, "", None).await.unwrap_err().code(), "missing_key");
        let err = registry.add(1, &host, Some(port), "wrong", None).await.unwrap_err();
        assert_eq!(err.code(), "auth_failed");
        assert!(registry.get_all(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_scoped_to_account() {
        let (_tmp, store, registry) = registry();
        let (host, port) = split(&serve(mock_panel::panel(10.0)).await);
        let id = registry.add(1, &host, Some(port), "plesk-key", Some("Edge")).await.unwrap();

        assert_eq!(registry.remove(2, id).unwrap_err().code(), "not_found");
        registry.remove(1, id).unwrap();
        assert_eq!(store.server_sealed_key(id).unwrap(), None);
        assert!(registry.get_all(1).unwrap().is_empty());
    }
}
