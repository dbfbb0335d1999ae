//! Registry of monitored sites and Plesk servers.
//!
//! Visibility is account scoped: a row is visible to every user sharing an
//! account with its creator. Rows outside that set behave as missing.

mod servers;
mod sites;

pub use servers::*;
pub use sites::*;

use std::sync::Arc;
use thiserror::Error;

use crate::db::{fingerprint, CredentialCipher, CryptoError, DbError, Store};
use crate::probe::RemoteError;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("a site URL or host is required")]
    MissingUrl,
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("a site key or API key is required")]
    MissingKey,
    #[error("this site is already connected")]
    SiteExists,
    #[error("this server is already connected")]
    ServerExists,
    #[error("not found")]
    NotFound,
    #[error("site limit reached")]
    SiteLimitReached,
    #[error("database error: {0}")]
    Db(DbError),
    #[error("credential error: {0}")]
    Credential(#[from] CryptoError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::MissingUrl => "missing_url",
            RegistryError::InvalidUrl(_) => "invalid_url",
            RegistryError::MissingKey => "missing_key",
            RegistryError::SiteExists => "site_exists",
            RegistryError::ServerExists => "server_exists",
            RegistryError::NotFound => "not_found",
            RegistryError::SiteLimitReached => "site_limit_reached",
            RegistryError::Db(_) | RegistryError::Credential(_) => "db_error",
            RegistryError::Remote(e) => e.code(),
        }
    }
}

impl From<DbError> for RegistryError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => RegistryError::NotFound,
            other => RegistryError::Db(other),
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Db(DbError::Json(e))
    }
}

/// Seals credentials on the way in and opens them for pollers.
#[derive(Clone)]
pub struct CredentialVault {
    store: Arc<Store>,
    cipher: CredentialCipher,
}

/// A credential ready to store: the sealed value and its fingerprint.
pub struct SealedCredential {
    pub sealed: String,
    pub fingerprint: String,
}

impl CredentialVault {
    pub fn new(store: Arc<Store>, cipher: CredentialCipher) -> Self {
        Self { store, cipher }
    }

    pub fn seal(&self, secret: &str) -> Result<SealedCredential, RegistryError> {
        Ok(SealedCredential {
            sealed: self.cipher.seal(secret)?,
            fingerprint: fingerprint(secret),
        })
    }

    pub fn site_key(&self, site_id: i64) -> Result<String, RegistryError> {
        let sealed = self.store.site_sealed_key(site_id)?.ok_or(RegistryError::MissingKey)?;
        Ok(self.cipher.open(&sealed)?)
    }

    pub fn server_key(&self, server_id: i64) -> Result<String, RegistryError> {
        let sealed = self.store.server_sealed_key(server_id)?.ok_or(RegistryError::MissingKey)?;
        Ok(self.cipher.open(&sealed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(RegistryError::from(DbError::NotFound).code(), "not_found");
        assert_eq!(RegistryError::from(DbError::Poisoned).code(), "db_error");
        assert_eq!(RegistryError::from(RemoteError::InvalidKey).code(), "invalid_key");
        assert_eq!(RegistryError::SiteLimitReached.code(), "site_limit_reached");
    }
}
