//! Run-scoped provisioning state.
//!
//! A `ProvisioningContext` is created once at process start and threaded
//! into every step and elevated command. It is immutable after creation;
//! the elevated credential lives in memory only and is never persisted.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{ProvisionError, ProvisionResult};

/// An in-memory secret (the privilege-elevation credential).
///
/// Wrapped so it cannot leak through `Debug` formatting or accidental
/// logging; callers must ask for it explicitly via [`Secret::expose`].
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    /// Access the raw secret. Only the executor's stdin-piping path and
    /// the stage runner's environment injection should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// State shared by all steps in a single provisioning run.
///
/// Usage constraint: two runs must never target the same instance name
/// concurrently. Nothing here enforces that; the persisted configuration
/// store has no concurrency control (see `store`).
#[derive(Debug, Clone)]
pub struct ProvisioningContext {
    instance: String,
    credential: Secret,
    key_path: PathBuf,
    inventory_path: PathBuf,
    store_path: PathBuf,
}

impl ProvisioningContext {
    /// Create a context for the given instance.
    ///
    /// The SSH key path is derived from the instance name under `~/.ssh`;
    /// the inventory lands next to the process working directory.
    pub fn new(instance: impl Into<String>, credential: Secret) -> ProvisionResult<Self> {
        let instance = instance.into();
        if instance.trim().is_empty() {
            return Err(ProvisionError::Input("instance name cannot be empty".into()));
        }

        let key_dir = dirs::home_dir()
            .ok_or_else(|| ProvisionError::Internal("cannot resolve home directory".into()))?
            .join(".ssh");

        Ok(Self::with_paths(
            instance,
            credential,
            &key_dir,
            PathBuf::from("inventory.ini"),
            PathBuf::from("values.json"),
        ))
    }

    /// Build a context with explicit derived paths. Used by `new` and by
    /// tests that cannot touch the real `~/.ssh`.
    pub fn with_paths(
        instance: String,
        credential: Secret,
        key_dir: &Path,
        inventory_path: PathBuf,
        store_path: PathBuf,
    ) -> Self {
        let key_path = key_dir.join(format!("{instance}_key"));
        Self {
            instance,
            credential,
            key_path,
            inventory_path,
            store_path,
        }
    }

    /// Override the configuration store location.
    pub fn with_store_path(mut self, path: PathBuf) -> Self {
        self.store_path = path;
        self
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn credential(&self) -> &Secret {
        &self.credential
    }

    /// Private half of the instance keypair.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Public half of the instance keypair.
    pub fn public_key_path(&self) -> PathBuf {
        let mut name = self.key_path.as_os_str().to_os_string();
        name.push(".pub");
        PathBuf::from(name)
    }

    pub fn inventory_path(&self) -> &Path {
        &self.inventory_path
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_instance_name_is_rejected() {
        let err = ProvisioningContext::new("  ", Secret::new("pw")).unwrap_err();
        assert!(matches!(err, ProvisionError::Input(_)));
    }

    #[test]
    fn key_paths_derive_from_instance_name() {
        let ctx = ProvisioningContext::with_paths(
            "node-a".into(),
            Secret::new("pw"),
            Path::new("/tmp/keys"),
            PathBuf::from("inventory.ini"),
            PathBuf::from("values.json"),
        );
        assert_eq!(ctx.key_path(), Path::new("/tmp/keys/node-a_key"));
        assert_eq!(ctx.public_key_path(), Path::new("/tmp/keys/node-a_key.pub"));
    }

    #[test]
    fn secret_debug_is_redacted() {
        let s = Secret::new("hunter2");
        assert_eq!(format!("{s:?}"), "Secret(****)");
        assert_eq!(s.expose(), "hunter2");
    }
}
