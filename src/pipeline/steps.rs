//! The provisioning step table.
//!
//! One declarative table defines step identity, menu label, and action;
//! the resumption menu in `main` and the pipeline driver both derive
//! from it. Order is fixed and global. Every step is idempotent from
//! scratch — instance setup purges any pre-existing instance of the same
//! name before launching a fresh one.

use std::fs;
use std::time::Duration;

use async_trait::async_trait;

use super::{BoxedStep, ProvisionStep, StepEnv};
use crate::context::{ProvisioningContext, Secret};
use crate::daemon::LaunchSpec;
use crate::errors::{ProvisionError, ProvisionResult};
use crate::exec::CommandSpec;
use crate::inventory;
use crate::recovery::force_kill_workers;
use crate::store::ValuesStore;

/// Error text of a known transient hypervisor launch fault that a daemon
/// restart reliably clears.
const TRANSIENT_LAUNCH_FAULT: &str = "kvmvapic.bin";
const LAUNCH_ATTEMPTS: u32 = 3;
const LAUNCH_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Mesh-side addressing for the VPN interface.
const MESH_INTERFACE: &str = "wg0";
const MESH_SERVER_CIDR: &str = "10.0.0.1/24";
const MESH_CLIENT_ADDR: &str = "10.0.0.2";
const MESH_LISTEN_PORT: u16 = 51820;

/// Build the full provisioning step table in execution order.
pub fn step_table() -> Vec<BoxedStep> {
    vec![
        Box::new(DaemonCheckStep),
        Box::new(SshKeysStep),
        Box::new(InstanceSetupStep),
        Box::new(UpdateStoreStep),
        Box::new(RenderInventoryStep),
        playbook("playbook_ssh_user", "00_ssh_for_new_user.yml"),
        playbook("playbook_security", "01_configure_security.yml"),
        playbook("playbook_cluster", "02_setup_k3s.yml"),
        playbook("playbook_mesh", "03_setup_and_config_wg.yml"),
        Box::new(MeshConfigStep),
        Box::new(VpnCheckStep),
        playbook("playbook_firewall", "05_setup_firewall.yml"),
        playbook("playbook_harden", "06_harden_firewall.yml"),
        playbook("playbook_vault_init", "07_vault_initial_setup.yml"),
        playbook("playbook_vault_keys", "08_store_vault_keys.yml"),
        playbook("playbook_verify", "09_verify_prerequisites.yml"),
        playbook("playbook_unseal", "10_setup_unseal_scripts.yml"),
        playbook("playbook_vault_auth", "11_configure_vault_auth.yml"),
        playbook("playbook_app_access", "12_configure_flask_vault_access.yml"),
    ]
}

fn playbook(id: &'static str, file: &'static str) -> BoxedStep {
    Box::new(PlaybookStep { id, file })
}

/// SSH into the instance as `user` and run `remote` there.
fn ssh_spec(ctx: &ProvisioningContext, user: &str, host: &str, remote: &str) -> CommandSpec {
    CommandSpec::new(
        "ssh",
        [
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-i".to_string(),
            ctx.key_path().display().to_string(),
            format!("{user}@{host}"),
            remote.to_string(),
        ],
    )
}

// ============================================================================
// STEP: daemon liveness
// ============================================================================

/// Probe the daemon; on failure run recovery and probe again. A dead
/// daemon after recovery aborts the run — every later step depends on it.
struct DaemonCheckStep;

#[async_trait]
impl ProvisionStep for DaemonCheckStep {
    fn id(&self) -> &'static str {
        "daemon_check"
    }

    fn label(&self) -> String {
        "Virtualization daemon check".into()
    }

    fn handles_recovery(&self) -> bool {
        true
    }

    async fn run(&self, env: &StepEnv) -> ProvisionResult<()> {
        env.recovery.ensure_responsive(&env.ctx).await
    }
}

// ============================================================================
// STEP: key material
// ============================================================================

/// Ensure the instance keypair exists at the derived path, generating a
/// fresh passphrase-less ed25519 pair if either half is missing.
struct SshKeysStep;

#[async_trait]
impl ProvisionStep for SshKeysStep {
    fn id(&self) -> &'static str {
        "ssh_keys"
    }

    fn label(&self) -> String {
        "SSH key check/generation".into()
    }

    async fn run(&self, env: &StepEnv) -> ProvisionResult<()> {
        let key = env.ctx.key_path();
        if key.exists() && env.ctx.public_key_path().exists() {
            tracing::info!(path = %key.display(), "SSH keys found");
            return Ok(());
        }

        tracing::info!(path = %key.display(), "SSH keys missing, generating");
        if let Some(parent) = key.parent() {
            fs::create_dir_all(parent)?;
        }
        let spec = CommandSpec::new(
            "ssh-keygen",
            [
                "-t".to_string(),
                "ed25519".to_string(),
                "-f".to_string(),
                key.display().to_string(),
                "-N".to_string(),
                String::new(),
            ],
        );
        env.exec.run(spec).await.map(|_| ())
    }
}

// ============================================================================
// STEP: instance setup
// ============================================================================

/// Create the target instance from scratch.
///
/// Idempotent by construction: any pre-existing instance of the same
/// name is force-killed and purged first, so resumption that re-runs
/// this step always yields exactly one instance.
struct InstanceSetupStep;

impl InstanceSetupStep {
    async fn launch_with_retry(&self, env: &StepEnv) -> ProvisionResult<()> {
        let name = env.ctx.instance();
        for attempt in 1..=LAUNCH_ATTEMPTS {
            tracing::info!(attempt, "launching instance");
            match env.daemon.launch(name, &LaunchSpec::default()).await {
                Ok(()) => return Ok(()),
                Err(err)
                    if attempt < LAUNCH_ATTEMPTS
                        && err.to_string().contains(TRANSIENT_LAUNCH_FAULT) =>
                {
                    tracing::warn!(
                        attempt,
                        error = %err,
                        "transient hypervisor fault on launch, recovering daemon and retrying"
                    );
                    let _ = env.recovery.run(&env.ctx).await;
                    let _ = env.daemon.delete_purge(name).await;
                    tokio::time::sleep(LAUNCH_RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(ProvisionError::Internal(format!(
            "instance launch failed after {LAUNCH_ATTEMPTS} attempts"
        )))
    }
}

#[async_trait]
impl ProvisionStep for InstanceSetupStep {
    fn id(&self) -> &'static str {
        "instance_setup"
    }

    fn label(&self) -> String {
        "Instance setup".into()
    }

    async fn run(&self, env: &StepEnv) -> ProvisionResult<()> {
        let ctx = &env.ctx;
        let name = ctx.instance();

        // Clear any leftovers from a previous (possibly partial) run.
        if let Err(err) = force_kill_workers(&env.exec, name, ctx.credential()).await {
            tracing::warn!(error = %err, "worker sweep failed, continuing");
        }
        if let Err(err) = env.daemon.delete_purge(name).await {
            tracing::debug!(error = %err, "no pre-existing instance to purge");
        }

        self.launch_with_retry(env).await?;

        let address = env.daemon.address(name).await?;
        tracing::info!(%address, "instance is up");

        env.daemon.transfer(&ctx.public_key_path(), name).await?;

        let user = ValuesStore::load(ctx.store_path())?.initial_user(name)?;
        let setup = format!(
            "sudo mkdir -p /home/{user}/.ssh && \
             sudo cp /home/{user}/{name}_key.pub /home/{user}/.ssh/authorized_keys && \
             sudo chown -R {user}:{user} /home/{user}/.ssh && \
             sudo chmod 700 /home/{user}/.ssh && \
             sudo chmod 600 /home/{user}/.ssh/authorized_keys && \
             sudo sed -i 's/^#\\?PubkeyAuthentication.*/PubkeyAuthentication yes/' /etc/ssh/sshd_config && \
             sudo sed -i 's/^#\\?PasswordAuthentication.*/PasswordAuthentication no/' /etc/ssh/sshd_config && \
             sudo systemctl restart ssh"
        );
        env.daemon.exec_in(name, &setup).await?;

        // Verify we can actually get in before the stage runner needs to.
        env.exec
            .run(ssh_spec(ctx, &user, &address, "echo SSH connection successful"))
            .await
            .map(|_| ())
    }
}

// ============================================================================
// STEP: configuration store update
// ============================================================================

/// Record the generated public key and discovered address for the
/// instance; picks up the mesh public key too if the instance already
/// has one (it won't on a fresh run).
struct UpdateStoreStep;

#[async_trait]
impl ProvisionStep for UpdateStoreStep {
    fn id(&self) -> &'static str {
        "update_store"
    }

    fn label(&self) -> String {
        "Update configuration store".into()
    }

    async fn run(&self, env: &StepEnv) -> ProvisionResult<()> {
        let ctx = &env.ctx;
        let public_key = fs::read_to_string(ctx.public_key_path())?.trim().to_string();
        let address = env.daemon.address(ctx.instance()).await?;

        let mut store = ValuesStore::load(ctx.store_path())?;
        store.update_node(ctx.instance(), &public_key, &address)?;

        let user = store.initial_user(ctx.instance())?;
        let fetch = ssh_spec(ctx, &user, &address, "sudo cat /etc/wireguard/server_public.key");
        match env.exec.capture(fetch).await {
            Ok(mesh_key) if !mesh_key.is_empty() => {
                tracing::info!("mesh public key found, recording it");
                store.set_mesh_public_key(&mesh_key)?;
            }
            Ok(_) | Err(_) => {
                tracing::info!("mesh public key not available yet, skipping");
            }
        }

        store.save()
    }
}

// ============================================================================
// STEP: inventory
// ============================================================================

struct RenderInventoryStep;

#[async_trait]
impl ProvisionStep for RenderInventoryStep {
    fn id(&self) -> &'static str {
        "render_inventory"
    }

    fn label(&self) -> String {
        "Generate dynamic inventory".into()
    }

    async fn run(&self, env: &StepEnv) -> ProvisionResult<()> {
        inventory::write(&env.ctx)
    }
}

// ============================================================================
// STEP: stage runner
// ============================================================================

/// One interactive stage-runner invocation. Streamed so the operator can
/// watch progress; success is exit-status only. The elevation credential
/// travels in the environment, never on the command line.
struct PlaybookStep {
    id: &'static str,
    file: &'static str,
}

#[async_trait]
impl ProvisionStep for PlaybookStep {
    fn id(&self) -> &'static str {
        self.id
    }

    fn label(&self) -> String {
        format!("Run: {}", self.file)
    }

    async fn run(&self, env: &StepEnv) -> ProvisionResult<()> {
        let ctx = &env.ctx;
        let spec = CommandSpec::new(
            "ansible-playbook",
            [
                "-i".to_string(),
                ctx.inventory_path().display().to_string(),
                self.file.to_string(),
                "-e".to_string(),
                format!("vm_name={}", ctx.instance()),
            ],
        )
        .env("ANSIBLE_BECOME_PASSWORD", ctx.credential().expose())
        .env("ANSIBLE_SSH_ARGS", "-o BatchMode=yes");

        env.exec.stream(spec).await
    }
}

// ============================================================================
// STEP: mesh configuration
// ============================================================================

/// Assemble the VPN mesh configs on both ends, cycle the interface, and
/// record the server's mesh public key in the store.
struct MeshConfigStep;

#[async_trait]
impl ProvisionStep for MeshConfigStep {
    fn id(&self) -> &'static str {
        "mesh_config"
    }

    fn label(&self) -> String {
        "Mesh network setup".into()
    }

    async fn run(&self, env: &StepEnv) -> ProvisionResult<()> {
        let ctx = &env.ctx;
        let credential = ctx.credential();
        let address = env.daemon.address(ctx.instance()).await?;

        let mut store = ValuesStore::load(ctx.store_path())?;
        let user = store.public_user(ctx.instance())?;

        // Key material on both ends.
        let client_public = env
            .exec
            .elevated("cat /etc/wireguard/client_public.key", credential)
            .await?;
        let client_private = env
            .exec
            .elevated("cat /etc/wireguard/client_private.key", credential)
            .await?;
        let server_private = env
            .exec
            .capture(ssh_spec(ctx, &user, &address, "sudo cat /etc/wireguard/server_private.key"))
            .await?;
        let server_public = env
            .exec
            .capture(ssh_spec(ctx, &user, &address, "sudo cat /etc/wireguard/server_public.key"))
            .await?;

        // Server-side config, piped over SSH stdin so key material never
        // rides in an argv.
        let server_config = format!(
            "[Interface]\n\
             Address = {MESH_SERVER_CIDR}\n\
             ListenPort = {MESH_LISTEN_PORT}\n\
             PrivateKey = {server_private}\n\
             \n\
             [Peer]\n\
             PublicKey = {client_public}\n\
             AllowedIPs = {MESH_CLIENT_ADDR}/32\n"
        );
        let push = ssh_spec(
            ctx,
            &user,
            &address,
            &format!(
                "sudo tee /etc/wireguard/{MESH_INTERFACE}.conf > /dev/null && \
                 sudo chmod 600 /etc/wireguard/{MESH_INTERFACE}.conf"
            ),
        )
        .stdin_secret(Secret::new(server_config));
        env.exec.run(push).await?;

        env.exec
            .run(ssh_spec(
                ctx,
                &user,
                &address,
                &format!("sudo wg-quick down {MESH_INTERFACE} || true"),
            ))
            .await?;
        env.exec
            .run(ssh_spec(
                ctx,
                &user,
                &address,
                &format!("sudo wg-quick up {MESH_INTERFACE}"),
            ))
            .await?;

        // Local side.
        let mesh_network = store.mesh_server_address()?;
        let local_config = format!(
            "[Interface]\n\
             PrivateKey = {client_private}\n\
             Address = {MESH_CLIENT_ADDR}/24\n\
             DNS = 1.1.1.1\n\
             \n\
             [Peer]\n\
             PublicKey = {server_public}\n\
             Endpoint = {address}:{MESH_LISTEN_PORT}\n\
             AllowedIPs = {}/24\n\
             PersistentKeepalive = 25\n",
            mesh_network.rsplit_once('.').map_or("10.0.0.0".to_string(), |(net, _)| format!("{net}.0")),
        );
        env.exec
            .elevated_write(&local_config, &format!("/etc/wireguard/{MESH_INTERFACE}.conf"), credential)
            .await?;
        env.exec
            .elevated(&format!("wg-quick down {MESH_INTERFACE} || true"), credential)
            .await?;
        env.exec
            .elevated(&format!("wg-quick up {MESH_INTERFACE}"), credential)
            .await?;

        // Second and final store update for this run: refresh the node
        // record and publish the server's mesh key.
        let public_key = fs::read_to_string(ctx.public_key_path())?.trim().to_string();
        store.update_node(ctx.instance(), &public_key, &address)?;
        store.set_mesh_public_key(&server_public)?;
        store.save()
    }
}

// ============================================================================
// STEP: VPN check
// ============================================================================

/// Prove the mesh path works: drop any stale host key for the mesh
/// address and SSH across the tunnel.
struct VpnCheckStep;

#[async_trait]
impl ProvisionStep for VpnCheckStep {
    fn id(&self) -> &'static str {
        "vpn_check"
    }

    fn label(&self) -> String {
        "VPN connection test".into()
    }

    async fn run(&self, env: &StepEnv) -> ProvisionResult<()> {
        let ctx = &env.ctx;
        let store = ValuesStore::load(ctx.store_path())?;
        let mesh_addr = store.mesh_server_address()?;
        let user = store.public_user(ctx.instance())?;

        // The mesh address is reused across rebuilds; the old host key
        // would make SSH balk.
        let forget = CommandSpec::new("ssh-keygen", ["-R".to_string(), mesh_addr.clone()]);
        if let Err(err) = env.exec.run(forget).await {
            tracing::debug!(error = %err, "no stale host key to remove");
        }

        env.exec
            .run(ssh_spec(ctx, &user, &mesh_addr, "echo VPN connection successful"))
            .await
            .map(|_| ())?;
        tracing::info!("VPN connection test successful");
        Ok(())
    }
}
