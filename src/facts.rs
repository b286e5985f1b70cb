//! Read-only probe of the host's current state
//!
//! Facts are gathered fresh on every invocation and never cached across
//! runs. Probing performs no mutation of any kind.

use crate::config::MigrateConfig;
use crate::error::Fatal;
use crate::system::{ClusterMembership, VersionOracle};
use crate::ui;

/// Everything the orchestrator needs to know about the host, probed once
/// per run.
#[derive(Debug, Clone)]
pub struct SystemFacts {
    pub major: u32,
    pub minor: u32,
    pub is_clustered: bool,
    pub has_backup_client: bool,
}

/// Probe the host. Fails only when the version oracle itself is unusable;
/// classification of the probed generation happens in the engine.
pub fn probe(
    cfg: &MigrateConfig,
    oracle: &dyn VersionOracle,
    cluster: &dyn ClusterMembership,
) -> Result<SystemFacts, Fatal> {
    let (major, minor) = oracle.current().map_err(|e| Fatal::Probe {
        reason: format!("{e:#}"),
    })?;

    let facts = SystemFacts {
        major,
        minor,
        is_clustered: cluster.is_clustered(),
        has_backup_client: cfg.backup_client_bin.exists(),
    };
    log::debug!("probed facts: {facts:?}");
    Ok(facts)
}

/// Show the probed facts as name/value pairs.
pub fn report(facts: &SystemFacts) {
    ui::kv(
        "platform_major_version",
        &format!("{}.{}", facts.major, facts.minor),
    );
    ui::kv("is_clustered", if facts.is_clustered { "yes" } else { "no" });
    ui::kv(
        "has_backup_component",
        if facts.has_backup_client { "yes" } else { "no" },
    );
}
