//! Dynamic inventory rendering for the stage runner.
//!
//! The inventory is regenerated on every run from the instance name, so
//! stale host entries from a previous instance cannot leak in. Host
//! addresses and users are resolved lazily by the stage runner itself via
//! lookups against the configuration store, which keeps the inventory
//! valid even when a later step rewrites the store.

use std::env;
use std::fs;
use std::path::Path;

use crate::context::ProvisioningContext;
use crate::errors::ProvisionResult;
use crate::store::MESH_NETWORK_RECORD;

/// Render the inventory document for the given run. `playbook_dir` is
/// where the stage files live; the stages themselves consume it.
pub fn render(ctx: &ProvisioningContext, playbook_dir: &Path) -> String {
    let instance = ctx.instance();
    let key_path = ctx.key_path().display();
    let store = ctx.store_path().display();
    let playbook_dir = playbook_dir.display();
    let ssh_args = "-o BatchMode=yes -o StrictHostKeyChecking=no";

    format!(
        r#"[{instance}_initial]
{instance}_initial_host ansible_host="{{{{ lookup('file', '{store}') | from_json | json_query('nodes.{instance}.ip') }}}}" ansible_user="{{{{ lookup('file', '{store}') | from_json | json_query('nodes.{instance}.user.initial') }}}}" ansible_ssh_private_key_file={key_path} ansible_ssh_common_args='{ssh_args}'

[{instance}_public]
{instance}_public_host ansible_host="{{{{ lookup('file', '{store}') | from_json | json_query('nodes.{instance}.ip') }}}}" ansible_user="{{{{ lookup('file', '{store}') | from_json | json_query('nodes.{instance}.user.public') }}}}" ansible_ssh_private_key_file={key_path} ansible_ssh_common_args='{ssh_args}'

[{instance}_private]
{instance} ansible_host="{{{{ lookup('file', '{store}') | from_json | json_query('wireguard.network.{MESH_NETWORK_RECORD}.ip') }}}}" ansible_user="{{{{ lookup('file', '{store}') | from_json | json_query('nodes.{instance}.user.public') }}}}" ansible_ssh_private_key_file={key_path} ansible_ssh_common_args='{ssh_args}'

[all:vars]
vm_name="{instance}"
playbook_dir="{playbook_dir}"
server_private_key="{{{{ lookup('file', 'wireguard/values/server_private.txt') | trim }}}}"
server_port="{{{{ lookup('file', '{store}') | from_json | json_query('wireguard.network.{MESH_NETWORK_RECORD}.listen_port') }}}}"
new_user="{{{{ lookup('file', '{store}') | from_json | json_query('nodes.{instance}.user.public') }}}}"
initial_user="{{{{ lookup('file', '{store}') | from_json | json_query('nodes.{instance}.user.initial') }}}}"
ssh_keys_{instance}="{{{{ lookup('file', '{store}') | from_json | json_query('nodes.{instance}.ssh_public_key') }}}}"
"#
    )
}

/// Write the rendered inventory to the context's derived path.
pub fn write(ctx: &ProvisioningContext) -> ProvisionResult<()> {
    let playbook_dir = env::current_dir()?;
    fs::write(ctx.inventory_path(), render(ctx, &playbook_dir))?;
    tracing::info!(
        path = %ctx.inventory_path().display(),
        "dynamic inventory generated"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::context::Secret;

    #[test]
    fn render_is_keyed_by_instance_name() {
        let ctx = ProvisioningContext::with_paths(
            "node-a".into(),
            Secret::new("pw"),
            Path::new("/home/op/.ssh"),
            PathBuf::from("inventory.ini"),
            PathBuf::from("values.json"),
        );
        let rendered = render(&ctx, Path::new("/srv/playbooks"));
        assert!(rendered.contains("[node-a_initial]"));
        assert!(rendered.contains("[node-a_public]"));
        assert!(rendered.contains("[node-a_private]"));
        assert!(rendered.contains("vm_name=\"node-a\""));
        assert!(rendered.contains("playbook_dir=\"/srv/playbooks\""));
        assert!(rendered.contains(
            "server_private_key=\"{{ lookup('file', 'wireguard/values/server_private.txt') | trim }}\""
        ));
        assert!(rendered.contains("/home/op/.ssh/node-a_key"));
        assert!(!rendered.contains("pw"));
    }
}
