//! Local credential persistence and identity resolution.
//!
//! Enrollment appends `USER_ID` and `PROVIDER_ID` to a dotenv-format file.
//! The file is never rewritten, so later entries override earlier ones.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use matcha_core::{ProviderId, ProviderIdentity, UserId};

use crate::error::{AgentError, CredentialsError};

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Values read back from the credentials file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    pub user_id: Option<UserId>,
    pub provider_id: Option<ProviderId>,
}

/// Append-only credentials file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read stored credentials. `Ok(None)` when the file does not exist.
    pub fn load(&self) -> Result<Option<StoredCredentials>, CredentialsError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let entries = dotenvy::from_path_iter(&self.path).map_err(|e| self.malformed(e))?;

        let mut stored = StoredCredentials::default();
        for entry in entries {
            let (key, value) = entry.map_err(|e| self.malformed(e))?;
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                "USER_ID" => stored.user_id = Some(UserId::new(value)),
                "PROVIDER_ID" => stored.provider_id = Some(ProviderId::new(value)),
                _ => {}
            }
        }

        debug!(
            path = %self.path.display(),
            has_user = stored.user_id.is_some(),
            has_provider = stored.provider_id.is_some(),
            "Loaded stored credentials"
        );
        Ok(Some(stored))
    }

    /// Export the file's entries into the process environment so flags with
    /// env fallbacks see them. Variables already set are left alone; within
    /// the file the last entry for a key wins. `Ok(false)` when there is no
    /// file.
    pub fn export_to_env(&self) -> Result<bool, CredentialsError> {
        if !self.path.exists() {
            return Ok(false);
        }

        let mut entries = BTreeMap::new();
        for entry in dotenvy::from_path_iter(&self.path).map_err(|e| self.malformed(e))? {
            let (key, value) = entry.map_err(|e| self.malformed(e))?;
            entries.insert(key, value);
        }

        let mut exported = 0usize;
        for (key, value) in entries {
            if std::env::var_os(&key).is_none() {
                std::env::set_var(&key, value);
                exported += 1;
            }
        }
        debug!(path = %self.path.display(), exported, "Exported credentials file to environment");
        Ok(true)
    }

    /// Append an identity to the file, creating it if needed.
    pub fn append(&self, identity: &ProviderIdentity) -> Result<(), CredentialsError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io(e))?;

        let entry = format!(
            "\n# enrolled {}\nUSER_ID={}\nPROVIDER_ID={}\n",
            Utc::now().to_rfc3339(),
            identity.user_id,
            identity.provider_id
        );
        file.write_all(entry.as_bytes()).map_err(|e| self.io(e))?;

        info!(
            path = %self.path.display(),
            provider_id = %identity.provider_id,
            "Credentials saved"
        );
        Ok(())
    }

    fn io(&self, source: std::io::Error) -> CredentialsError {
        CredentialsError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn malformed(&self, err: dotenvy::Error) -> CredentialsError {
        CredentialsError::Malformed {
            path: self.path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Host-derived provider id: `matcha-` plus 12 hex chars of
/// SHA-256(host name, machine id).
pub fn derive_provider_id() -> ProviderId {
    let host = sysinfo::System::host_name().unwrap_or_default();
    let machine_id = MACHINE_ID_PATHS
        .iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .unwrap_or_default();
    provider_id_from(&host, machine_id.trim())
}

fn provider_id_from(host: &str, machine_id: &str) -> ProviderId {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(b"\0");
    hasher.update(machine_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    ProviderId::new(format!("matcha-{}", &digest[..12]))
}

/// Explicit value, then stored value, then host-derived.
pub fn resolve_provider_id(
    explicit: Option<&str>,
    stored: Option<&StoredCredentials>,
) -> ProviderId {
    explicit
        .filter(|s| !s.is_empty())
        .map(ProviderId::from)
        .or_else(|| stored.and_then(|s| s.provider_id.clone()))
        .unwrap_or_else(derive_provider_id)
}

/// Build the process identity. Fails when no user id is bound anywhere.
pub fn resolve_identity(
    explicit_provider: Option<&str>,
    explicit_user: Option<&str>,
    stored: Option<&StoredCredentials>,
) -> Result<ProviderIdentity, AgentError> {
    let user_id = explicit_user
        .filter(|s| !s.is_empty())
        .map(UserId::from)
        .or_else(|| stored.and_then(|s| s.user_id.clone()))
        .ok_or(AgentError::MissingCredentials)?;

    Ok(ProviderIdentity {
        provider_id: resolve_provider_id(explicit_provider, stored),
        user_id,
    })
}
