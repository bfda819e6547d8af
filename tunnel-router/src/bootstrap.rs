use tracing::{debug, info};
use tunnel_router_kernel::{
    Firewall, FirewallRule, Links, PolicyRule, Routing, tolerate_exists, tolerate_missing,
};

use crate::Result;
use crate::config::RoutingConfig;

/// Builtin chains that must pass through the filter chain.
const HOOKS: [&str; 2] = ["PREROUTING", "OUTPUT"];

/// Marks each flow with a bucket derived from its addresses and ports.
pub fn hmark_rule(config: &RoutingConfig, seed: u16) -> FirewallRule {
    FirewallRule::new(
        config.ingress_chain.as_str(),
        format!(
            "-j HMARK --hmark-tuple src,dst,sport,dport --hmark-mod {} --hmark-offset {} --hmark-rnd {}",
            config.buckets, config.table_offset, seed
        ),
    )
}

/// Puts the host into the state the reconciler starts from: empty chains,
/// no tunnel interfaces, empty bucket tables selected by their marks.
pub fn run<K>(kernel: &mut K, config: &RoutingConfig, seed: u16) -> Result<()>
where
    K: Firewall + Routing + Links,
{
    kernel.ensure_chain(&config.ingress_chain)?;
    kernel.insert_rule(&hmark_rule(config, seed))?;
    kernel.ensure_chain(&config.filter_chain)?;
    info!(
        ingress = %config.ingress_chain,
        filter = %config.filter_chain,
        "chains ready"
    );

    for hook in HOOKS {
        let jump = FirewallRule::jump(hook, &config.filter_chain);
        if kernel.rule_exists(&jump)? {
            debug!(hook, "filter chain already registered");
            continue;
        }
        kernel.insert_rule(&jump)?;
        info!(hook, chain = %config.filter_chain, "registered filter chain");
    }

    let stale: Vec<String> = kernel
        .link_names(None)?
        .into_iter()
        .filter(|name| name.starts_with(&config.tunnel_prefix))
        .collect();
    for name in &stale {
        tolerate_missing(kernel.delete_link(None, name))?;
    }
    if !stale.is_empty() {
        info!(count = stale.len(), "removed stale tunnel interfaces");
    }

    for table in config.tables() {
        kernel.flush_table(table)?;
        tolerate_exists(kernel.add_policy_rule(PolicyRule { mark: table, table }))?;
    }
    info!(buckets = config.buckets, offset = config.table_offset, "routing tables ready");
    Ok(())
}
