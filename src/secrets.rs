use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

pub const PLACES_API_KEY_ACCOUNT: &str = "google-places-api-key";

/// Where the active places credential came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    Environment,
    Vault,
    Missing,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Environment => "environment",
            CredentialSource::Vault => "vault",
            CredentialSource::Missing => "missing",
        }
    }
}

#[derive(Clone)]
pub struct SecretVault {
    service_name: String,
    backend: SecretBackend,
}

#[derive(Clone)]
enum SecretBackend {
    Keyring,
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: SecretBackend::Keyring,
        }
    }

    /// Process-local vault for tests and platforms without a keychain.
    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: SecretBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    /// Environment credential wins over one stored in the vault.
    pub fn resolve_places_api_key(
        &self,
        config: &AppConfig,
    ) -> AppResult<(Option<SecretString>, CredentialSource)> {
        if let Some(key) = config.google_places_api_key.clone() {
            return Ok((Some(key), CredentialSource::Environment));
        }
        match self.read_secret(PLACES_API_KEY_ACCOUNT)? {
            Some(key) => Ok((Some(key), CredentialSource::Vault)),
            None => Ok((None, CredentialSource::Missing)),
        }
    }

    pub fn store_places_api_key(&self, value: &str) -> AppResult<SecretString> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AppError::Config("places API key cannot be empty".into()));
        }
        let secret = SecretString::from(trimmed.to_string());
        self.write_secret(PLACES_API_KEY_ACCOUNT, &secret)?;
        info!(
            target: "secret_vault",
            service = %self.service_name,
            account = PLACES_API_KEY_ACCOUNT,
            "stored places API key"
        );
        Ok(secret)
    }

    pub fn delete(&self, account: &str) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => {
                store.lock().remove(account);
                Ok(())
            }
        }
    }

    pub fn has(&self, account: &str) -> AppResult<bool> {
        self.read_secret(account).map(|secret| secret.is_some())
    }

    pub fn read_secret(&self, account: &str) -> AppResult<Option<SecretString>> {
        let secret = match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Some(SecretString::from(value)),
                    Err(keyring::Error::NoEntry) => None,
                    Err(err) => return Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => store.lock().get(account).cloned(),
        };
        debug!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            found = secret.is_some(),
            "looked up secret"
        );
        Ok(secret)
    }

    pub fn write_secret(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret())?;
                Ok(())
            }
            SecretBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
                Ok(())
            }
        }
    }
}
