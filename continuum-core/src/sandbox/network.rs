//! Sandbox bridge-network setup.

use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use tracing::info;

use super::{SandboxError, SANDBOX_NETWORK};

/// Find or create the dedicated sandbox bridge network, returning its id.
///
/// The network is deliberately *not* marked internal: scripts keep public
/// internet access. Lateral movement to the host and to peer services is
/// blocked inside each container instead (iptables DROP rules for private
/// ranges plus extra-hosts pinning the gateway names to loopback).
pub async fn ensure_sandbox_network(docker: &Docker) -> Result<String, SandboxError> {
    if let Some(id) = find_network(docker).await? {
        return Ok(id);
    }

    docker
        .create_network(CreateNetworkOptions {
            name: SANDBOX_NETWORK,
            driver: "bridge",
            ..Default::default()
        })
        .await?;
    info!(network = SANDBOX_NETWORK, "created sandbox network");

    // Re-list rather than trusting the create response to carry the id.
    find_network(docker).await?.ok_or_else(|| SandboxError::Setup {
        detail: format!("network {SANDBOX_NETWORK} missing after creation"),
    })
}

async fn find_network(docker: &Docker) -> Result<Option<String>, SandboxError> {
    let networks = docker.list_networks::<String>(None).await?;
    Ok(networks
        .into_iter()
        .find(|n| n.name.as_deref() == Some(SANDBOX_NETWORK))
        .and_then(|n| n.id))
}
