//! Convergence orchestrator
//!
//! The only component with branching policy. Sequences probe, pre-flight,
//! backup, source migration, package upgrade and post-install
//! normalization as a phase machine over the probed generation.
//!
//! Failure semantics: anything fatal before `Migrating` aborts with no
//! filesystem mutation. From `Migrating` on, individual steps that cannot
//! complete are warnings; every step is independently idempotent, so the
//! operator re-runs the tool to finish a partial convergence.

use anyhow::Result;
use chrono::NaiveDate;

use crate::backup::BackupManager;
use crate::config::MigrateConfig;
use crate::error::Fatal;
use crate::facts::{self, SystemFacts};
use crate::patch;
use crate::sources;
use crate::system::Collaborators;
use crate::ui;

/// Orchestrator phases. `Unsupported` is represented as the fatal error
/// returned before the machine starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AtSource,
    AtTarget,
    Migrating,
    PostInstall,
    Done,
}

/// How the run ended (fatal conditions are errors instead).
#[derive(Debug)]
pub enum Outcome {
    Converged(Summary),
    Declined,
}

/// What a run did, for the final report.
#[derive(Debug, Default)]
pub struct Summary {
    pub changes: Vec<String>,
    pub warnings: Vec<String>,
}

impl Summary {
    /// Record a soft failure: surfaced, never propagated.
    fn soft(&mut self, label: &str, result: Result<()>) {
        if let Err(e) = result {
            let msg = format!("{label}: {e:#}");
            ui::warn(&msg);
            log::warn!("{msg}");
            self.warnings.push(msg);
        }
    }

    fn advisory(&mut self, msg: &str) {
        ui::warn(msg);
        self.warnings.push(msg.to_string());
    }
}

/// Run the full convergence sequence. Safe to invoke any number of times;
/// a converged host reports no changes.
pub fn run(cfg: &MigrateConfig, sys: &Collaborators, today: NaiveDate) -> Result<Outcome> {
    ui::header("Release convergence");
    let facts = facts::probe(cfg, sys.oracle, sys.cluster)?;
    facts::report(&facts);

    let mut phase = classify(cfg, &facts)?;
    let mut summary = Summary::default();

    loop {
        phase = match phase {
            Phase::AtSource => {
                match preflight(cfg, sys)? {
                    true => Phase::Migrating,
                    false => return Ok(Outcome::Declined),
                }
            }
            Phase::AtTarget => {
                ui::info(&format!(
                    "Host already at release {}; skipping backup and source migration",
                    cfg.target.major
                ));
                Phase::PostInstall
            }
            Phase::Migrating => {
                migrate(cfg, sys, today, &mut summary)?;
                Phase::PostInstall
            }
            Phase::PostInstall => {
                post_install(cfg, sys, &facts, &mut summary);
                Phase::Done
            }
            Phase::Done => break,
        };
    }

    report(&summary);
    Ok(Outcome::Converged(summary))
}

/// Classify the probed generation into the closed supported set.
/// Anything else is fatal, never a silent default.
fn classify(cfg: &MigrateConfig, facts: &SystemFacts) -> Result<Phase, Fatal> {
    if facts.major == cfg.source.major {
        Ok(Phase::AtSource)
    } else if facts.major == cfg.target.major {
        Ok(Phase::AtTarget)
    } else {
        Err(Fatal::Unsupported {
            major: facts.major,
            minor: facts.minor,
        })
    }
}

/// Pre-flight validation plus operator confirmation. Returns whether the
/// run may proceed to mutation.
fn preflight(cfg: &MigrateConfig, sys: &Collaborators) -> Result<bool> {
    ui::section("Pre-flight validation");

    let findings = sys
        .preflight
        .run_full()
        .map_err(|e| Fatal::PreflightUnavailable {
            reason: format!("{e:#}"),
        })?;

    if !findings.is_empty() {
        for finding in &findings {
            ui::error(finding);
        }
        return Err(Fatal::Preflight {
            count: findings.len(),
        }
        .into());
    }
    ui::success("Pre-flight checks passed");

    let prompt = format!(
        "Migrate this host from {} ({}) to {} ({})?",
        cfg.source.major, cfg.source.codename, cfg.target.major, cfg.target.codename
    );
    Ok(ui::confirm(&prompt, cfg.unattended)?)
}

/// Backup, then rewrite every repository declaration from the source to
/// the target release, then upgrade packages.
fn migrate(
    cfg: &MigrateConfig,
    sys: &Collaborators,
    today: NaiveDate,
    summary: &mut Summary,
) -> Result<()> {
    ui::section("Backing up repository files");
    let manager = BackupManager::new(&cfg.backup_root);
    manager.ensure(&[cfg.sources_file.clone(), cfg.sources_dir.clone()], today)?;

    ui::section("Migrating package sources");
    summary.soft(
        "keyring install",
        sys.pkg.install_if_missing(&cfg.keyring_package),
    );

    let decls = sources::load(cfg)?;
    summary.changes.extend(sources::migrate_channels(cfg, &decls)?);

    for path in sources::declaration_paths(cfg)? {
        match sources::migrate_token(&path, &cfg.source.codename, &cfg.target.codename) {
            Ok(true) => summary.changes.push(format!(
                "rewrote {} -> {} in {}",
                cfg.source.codename,
                cfg.target.codename,
                path.display()
            )),
            Ok(false) => {}
            Err(e) => summary.soft(&format!("token rewrite {}", path.display()), Err(e)),
        }
    }

    ui::section("Upgrading packages");
    summary.soft("package index update", sys.pkg.update());
    summary.soft("distribution upgrade", sys.pkg.dist_upgrade());
    Ok(())
}

/// Idempotent post-migration adjustments. Every step here tolerates
/// failure and absence of its target.
fn post_install(
    cfg: &MigrateConfig,
    sys: &Collaborators,
    facts: &SystemFacts,
    summary: &mut Summary,
) {
    ui::section("Post-install adjustments");

    match patch::ensure_script(cfg) {
        Ok(true) => summary
            .changes
            .push(format!("installed {}", cfg.patch_script.display())),
        Ok(false) => {}
        Err(e) => summary.soft("patch script", Err(e)),
    }
    match patch::ensure_hook(cfg) {
        Ok(true) => summary
            .changes
            .push(format!("installed {}", cfg.patch_hook_path().display())),
        Ok(false) => {}
        Err(e) => summary.soft("patch hook", Err(e)),
    }
    match patch::apply(&cfg.widget_lib, patch::NONAG_MARKER, &patch::nonag_body()) {
        Ok(true) => summary
            .changes
            .push(format!("patched {}", cfg.widget_lib.display())),
        Ok(false) => ui::dim("UI patch already applied or target absent"),
        Err(e) => summary.soft("UI patch", Err(e)),
    }

    if facts.has_backup_client {
        summary.soft(
            &format!("reinstall {}", cfg.backup_client_package),
            sys.pkg.reinstall(&cfg.backup_client_package),
        );
    }

    if facts.is_clustered {
        ui::info("Cluster member: leaving HA services untouched");
    } else {
        for service in &cfg.cluster_services {
            if sys.svc.is_active(service) {
                ui::dim(&format!("{service} is active on a standalone node"));
            }
            match sys.svc.disable_and_stop(service) {
                Ok(()) => summary.changes.push(format!("disabled {service}")),
                Err(e) => summary.soft(&format!("disable {service}"), Err(e)),
            }
        }
    }

    // Advisory only: surfaced, never acted upon automatically.
    match sources::load(cfg) {
        Ok(decls) => {
            if sources::mixed_channels(cfg, &decls) {
                summary.advisory(
                    "Both paid and free platform channels are active; disable one of them",
                );
            }
        }
        Err(e) => summary.soft("channel scan", Err(e)),
    }
}

fn report(summary: &Summary) {
    ui::section("Summary");
    if summary.changes.is_empty() {
        ui::success("Already converged - no changes needed");
    } else {
        for (i, change) in summary.changes.iter().enumerate() {
            ui::step(i + 1, summary.changes.len(), change);
        }
    }
    if !summary.warnings.is_empty() {
        ui::warn(&format!(
            "Completed with {}; re-run after resolving them",
            ui::count_label(summary.warnings.len(), "warning")
        ));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{
        ClusterMembership, PackageManager, PreflightChecker, ServiceController, VersionOracle,
    };
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::collections::HashSet;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct MockOracle(u32, u32);

    impl VersionOracle for MockOracle {
        fn current(&self) -> Result<(u32, u32)> {
            Ok((self.0, self.1))
        }
    }

    struct MockPreflight(Vec<String>);

    impl PreflightChecker for MockPreflight {
        fn run_full(&self) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    struct MockCluster(bool);

    impl ClusterMembership for MockCluster {
        fn is_clustered(&self) -> bool {
            self.0
        }
    }

    #[derive(Default)]
    struct MockPkg {
        calls: RefCell<Vec<String>>,
    }

    impl PackageManager for MockPkg {
        fn update(&self) -> Result<()> {
            self.calls.borrow_mut().push("update".into());
            Ok(())
        }
        fn dist_upgrade(&self) -> Result<()> {
            self.calls.borrow_mut().push("dist-upgrade".into());
            Ok(())
        }
        fn reinstall(&self, package: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("reinstall {package}"));
            Ok(())
        }
        fn install_if_missing(&self, package: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("install {package}"));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockSvc {
        active: RefCell<HashSet<String>>,
        disabled: RefCell<Vec<String>>,
    }

    impl ServiceController for MockSvc {
        fn is_active(&self, name: &str) -> bool {
            self.active.borrow().contains(name)
        }
        fn disable_and_stop(&self, name: &str) -> Result<()> {
            self.active.borrow_mut().remove(name);
            self.disabled.borrow_mut().push(name.to_string());
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        cfg: MigrateConfig,
    }

    /// A plausible pre-migration host: OS repos in the single file, an
    /// enabled enterprise channel, a legacy free-channel file, and an
    /// installed widget library.
    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut cfg = MigrateConfig::from_env(true);
        cfg.sources_file = tmp.path().join("sources.list");
        cfg.sources_dir = tmp.path().join("sources.list.d");
        cfg.backup_root = tmp.path().join("backups");
        cfg.apt_conf_dir = tmp.path().join("apt.conf.d");
        cfg.widget_lib = tmp.path().join("widget/proxmoxlib.js");
        cfg.patch_script = tmp.path().join("bin/pveup-nonag.sh");
        cfg.backup_client_bin = tmp.path().join("absent-backup-client");

        fs::create_dir_all(&cfg.sources_dir).unwrap();
        fs::create_dir_all(cfg.widget_lib.parent().unwrap()).unwrap();
        fs::write(
            &cfg.sources_file,
            "deb http://deb.debian.org/debian bookworm main contrib\n\
             deb http://security.debian.org/debian-security bookworm-security main\n",
        )
        .unwrap();
        fs::write(
            cfg.sources_dir.join("pve-enterprise.list"),
            format!("deb {} bookworm {}\n", cfg.enterprise_uri, cfg.enterprise_component),
        )
        .unwrap();
        fs::write(
            cfg.sources_dir.join("pve-no-sub.list"),
            format!("deb {} bookworm {}\n", cfg.community_uri, cfg.community_component),
        )
        .unwrap();
        fs::write(&cfg.widget_lib, "Ext.define('Proxmox.Utils', {});\n").unwrap();

        Fixture { _tmp: tmp, cfg }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    /// Byte snapshot of every file under the fixture's mutable paths.
    fn file_state(cfg: &MigrateConfig) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut state = BTreeMap::new();
        let mut record = |path: &Path| {
            if path.is_file() {
                state.insert(path.to_path_buf(), fs::read(path).unwrap());
            }
        };
        record(&cfg.sources_file);
        record(&cfg.widget_lib);
        record(&cfg.patch_script);
        record(&cfg.patch_hook_path());
        if cfg.sources_dir.is_dir() {
            for entry in fs::read_dir(&cfg.sources_dir).unwrap() {
                record(&entry.unwrap().path());
            }
        }
        state
    }

    fn run_with(
        cfg: &MigrateConfig,
        major: u32,
        clustered: bool,
        svc: &MockSvc,
    ) -> Result<Outcome> {
        let oracle = MockOracle(major, 1);
        let preflight = MockPreflight(vec![]);
        let cluster = MockCluster(clustered);
        let pkg = MockPkg::default();
        let sys = Collaborators {
            oracle: &oracle,
            preflight: &preflight,
            cluster: &cluster,
            pkg: &pkg,
            svc,
        };
        run(cfg, &sys, date("2026-08-06"))
    }

    #[test]
    fn test_full_convergence_is_idempotent() {
        let f = fixture();
        let svc = MockSvc::default();

        run_with(&f.cfg, 8, false, &svc).unwrap();
        let after_first = file_state(&f.cfg);

        // All declarations now target the new release, the enterprise
        // channel is gone from the active set, the legacy free channel is
        // renamed aside, the structured one exists.
        assert!(after_first
            .get(&f.cfg.sources_file)
            .map(|b| String::from_utf8_lossy(b).contains("trixie"))
            .unwrap());
        assert!(f.cfg.sources_dir.join("pve-enterprise.list.bak").exists());
        assert!(f.cfg.sources_dir.join("pve-no-sub.list.bak").exists());
        assert!(f.cfg.community_sources_path().exists());

        // The host now probes at the target generation.
        let second = run_with(&f.cfg, 9, false, &svc).unwrap();
        let after_second = file_state(&f.cfg);
        assert_eq!(after_first, after_second);

        match second {
            Outcome::Converged(summary) => {
                // Only the service normalization repeats; no file changed.
                assert!(summary.changes.iter().all(|c| c.starts_with("disabled ")));
            }
            Outcome::Declined => panic!("unattended run cannot decline"),
        }
    }

    #[test]
    fn test_unsupported_generation_is_fatal_and_mutation_free() {
        let f = fixture();
        let svc = MockSvc::default();
        let before = file_state(&f.cfg);

        let err = run_with(&f.cfg, 7, false, &svc).unwrap_err();
        let fatal = err.downcast_ref::<Fatal>().unwrap();
        assert!(matches!(fatal, Fatal::Unsupported { major: 7, .. }));
        assert_eq!(fatal.exit_code(), 2);

        assert_eq!(before, file_state(&f.cfg));
        assert!(!f.cfg.backup_root.exists());
        assert!(svc.disabled.borrow().is_empty());
    }

    #[test]
    fn test_blocking_findings_stop_before_mutation() {
        let f = fixture();
        let before = file_state(&f.cfg);

        let oracle = MockOracle(8, 4);
        let preflight = MockPreflight(vec!["FAIL: storage 'local' is full".into()]);
        let cluster = MockCluster(false);
        let pkg = MockPkg::default();
        let svc = MockSvc::default();
        let sys = Collaborators {
            oracle: &oracle,
            preflight: &preflight,
            cluster: &cluster,
            pkg: &pkg,
            svc: &svc,
        };

        let err = run(&f.cfg, &sys, date("2026-08-06")).unwrap_err();
        let fatal = err.downcast_ref::<Fatal>().unwrap();
        assert!(matches!(fatal, Fatal::Preflight { count: 1 }));

        assert_eq!(before, file_state(&f.cfg));
        assert!(!f.cfg.backup_root.exists());
        assert!(pkg.calls.borrow().is_empty());
    }

    #[test]
    fn test_standalone_node_ends_with_ha_disabled() {
        let f = fixture();
        let svc = MockSvc::default();
        svc.active.borrow_mut().insert("pve-ha-lrm".to_string());

        run_with(&f.cfg, 8, false, &svc).unwrap();

        let disabled = svc.disabled.borrow();
        assert!(disabled.contains(&"pve-ha-lrm".to_string()));
        assert!(disabled.contains(&"pve-ha-crm".to_string()));
        assert!(svc.active.borrow().is_empty());
    }

    #[test]
    fn test_cluster_member_keeps_ha_services() {
        let f = fixture();
        let svc = MockSvc::default();
        svc.active.borrow_mut().insert("pve-ha-lrm".to_string());
        svc.active.borrow_mut().insert("pve-ha-crm".to_string());

        run_with(&f.cfg, 8, true, &svc).unwrap();

        assert!(svc.disabled.borrow().is_empty());
        assert_eq!(svc.active.borrow().len(), 2);
    }

    #[test]
    fn test_patch_applied_exactly_once_across_runs() {
        let f = fixture();
        let svc = MockSvc::default();

        run_with(&f.cfg, 8, false, &svc).unwrap();
        run_with(&f.cfg, 9, false, &svc).unwrap();
        run_with(&f.cfg, 9, false, &svc).unwrap();

        let lib = fs::read_to_string(&f.cfg.widget_lib).unwrap();
        assert_eq!(lib.matches(patch::NONAG_MARKER).count(), 1);
    }

    #[test]
    fn test_backup_client_reinstalled_when_present() {
        let f = fixture();
        fs::write(&f.cfg.backup_client_bin, "").unwrap();

        let oracle = MockOracle(8, 1);
        let preflight = MockPreflight(vec![]);
        let cluster = MockCluster(false);
        let pkg = MockPkg::default();
        let svc = MockSvc::default();
        let sys = Collaborators {
            oracle: &oracle,
            preflight: &preflight,
            cluster: &cluster,
            pkg: &pkg,
            svc: &svc,
        };
        run(&f.cfg, &sys, date("2026-08-06")).unwrap();

        let calls = pkg.calls.borrow();
        assert!(calls.contains(&format!("reinstall {}", f.cfg.backup_client_package)));
        assert!(calls.contains(&"dist-upgrade".to_string()));
    }
}
