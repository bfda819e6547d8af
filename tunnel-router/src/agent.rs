use tokio::task::block_in_place;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tunnel_router_kernel::Host;

use crate::config::AgentArgs;
use crate::kubernetes::KubeState;
use crate::metrics::ReconcileMetrics;
use crate::reconcile::{self, Reconciler};
use crate::{Result, bootstrap};

/// Bootstraps the host, then reconciles until `cancel` fires. `ready` is
/// cancelled once bootstrap has succeeded.
pub async fn start(
    args: AgentArgs,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    args.validate()?;
    let config = args.routing();

    let mut host = Host::try_new()?;
    let seed = rand::random_range(1..=u16::MAX);
    block_in_place(|| bootstrap::run(&mut host, &config, seed))?;
    info!(mode = ?config.mode, buckets = config.buckets, "bootstrap complete");

    let client = kube::Client::try_default().await?;
    let source = KubeState::new(
        client,
        args.tunnel_annotation.as_str(),
        args.service_name_limit(),
        args.node_name.as_str(),
        args.netns_dir.as_path(),
    );
    let reconciler = Reconciler::new(host, config, ReconcileMetrics::new());
    ready.cancel();

    reconcile::run(source, reconciler, args.poll_interval(), cancel).await
}
