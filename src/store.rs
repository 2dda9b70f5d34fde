//! Persisted configuration store (`values.json`).
//!
//! A keyed mapping from instance name to its record (public key, address,
//! administrative users), plus the VPN mesh section. The orchestrator
//! performs plain read-modify-write with no locking or merge strategy:
//! concurrent writers are not supported, and two runs must never share a
//! store file. Updates touch only the target instance's record; every
//! other byte of the document round-trips untouched.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use crate::errors::{ProvisionError, ProvisionResult};

/// Record key for the mesh server under the `wireguard.nodes` section.
pub const MESH_SERVER_NODE: &str = "vault";
/// Record key for the mesh network parameters.
pub const MESH_NETWORK_RECORD: &str = "vault_server";

pub struct ValuesStore {
    path: PathBuf,
    doc: Value,
}

impl ValuesStore {
    pub fn load(path: &Path) -> ProvisionResult<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            ProvisionError::Store(format!("cannot read {}: {err}", path.display()))
        })?;
        let doc: Value = serde_json::from_str(&raw).map_err(|err| {
            ProvisionError::Store(format!("malformed store {}: {err}", path.display()))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    pub fn save(&self) -> ProvisionResult<()> {
        let rendered = serde_json::to_string_pretty(&self.doc)?;
        fs::write(&self.path, rendered)?;
        tracing::info!(path = %self.path.display(), "configuration store updated");
        Ok(())
    }

    /// The administrative user the instance image boots with.
    pub fn initial_user(&self, instance: &str) -> ProvisionResult<String> {
        self.node_str(instance, "user/initial")
    }

    /// The administrative user created during provisioning.
    pub fn public_user(&self, instance: &str) -> ProvisionResult<String> {
        self.node_str(instance, "user/public")
    }

    /// Record the generated public key and discovered address for an
    /// instance. The record must already exist.
    pub fn update_node(&mut self, instance: &str, public_key: &str, address: &str) -> ProvisionResult<()> {
        let node = self
            .doc
            .pointer_mut(&format!("/nodes/{instance}"))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| ProvisionError::Store(format!("no record for instance {instance}")))?;
        node.insert("ssh_public_key".into(), json!(public_key));
        node.insert("ip".into(), json!(address));
        Ok(())
    }

    /// Record the mesh server's public key after mesh-network setup.
    pub fn set_mesh_public_key(&mut self, public_key: &str) -> ProvisionResult<()> {
        let node = self
            .doc
            .pointer_mut(&format!("/wireguard/nodes/{MESH_SERVER_NODE}"))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                ProvisionError::Store(format!("no mesh record for node {MESH_SERVER_NODE}"))
            })?;
        node.insert("public_key".into(), json!(public_key));
        Ok(())
    }

    /// The mesh-side address of the server, used for the VPN check.
    pub fn mesh_server_address(&self) -> ProvisionResult<String> {
        self.doc
            .pointer(&format!("/wireguard/network/{MESH_NETWORK_RECORD}/ip"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProvisionError::Store("no mesh server address in store".into()))
    }

    fn node_str(&self, instance: &str, pointer: &str) -> ProvisionResult<String> {
        self.doc
            .pointer(&format!("/nodes/{instance}/{pointer}"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ProvisionError::Store(format!("missing {pointer} for instance {instance}"))
            })
    }
}
