//! Immutable run configuration for pveup
//!
//! Everything environment-derived is resolved once at startup into a single
//! `MigrateConfig` value that is threaded by reference through every
//! component. No other module reads the environment.
//!
//! # Environment Variables
//!
//! - `PVEUP_SOURCES_FILE` - Override the conventional single-file sources path
//! - `PVEUP_SOURCES_DIR` - Override the per-repository declarations directory
//! - `PVEUP_BACKUP_ROOT` - Override the dated backup root
//! - `PVEUP_APT_CONF_DIR` - Override the apt hook directory
//! - `PVEUP_WIDGET_LIB` - Override the web-UI widget library path
//!
//! Paths support `~` expansion.

use std::path::PathBuf;

/// Environment variable for the single-file sources path override
pub const ENV_SOURCES_FILE: &str = "PVEUP_SOURCES_FILE";

/// Environment variable for the declarations directory override
pub const ENV_SOURCES_DIR: &str = "PVEUP_SOURCES_DIR";

/// Environment variable for the backup root override
pub const ENV_BACKUP_ROOT: &str = "PVEUP_BACKUP_ROOT";

/// Environment variable for the apt hook directory override
pub const ENV_APT_CONF_DIR: &str = "PVEUP_APT_CONF_DIR";

/// Environment variable for the widget library path override
pub const ENV_WIDGET_LIB: &str = "PVEUP_WIDGET_LIB";

/// One release line in the migration pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Platform major version reported by the version oracle
    pub major: u32,
    /// Release token used inside repository declarations
    pub codename: String,
}

impl Release {
    pub fn new(major: u32, codename: &str) -> Self {
        Self {
            major,
            codename: codename.to_string(),
        }
    }
}

/// All configuration for one convergence run
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    /// Release line the host is expected to start from
    pub source: Release,
    /// Release line the host converges onto
    pub target: Release,

    /// Conventional single-file sources path (`/etc/apt/sources.list`)
    pub sources_file: PathBuf,
    /// Directory of per-repository declaration files
    pub sources_dir: PathBuf,
    /// Root under which dated backup snapshots are created
    pub backup_root: PathBuf,
    /// Directory for apt configuration hook files
    pub apt_conf_dir: PathBuf,

    /// Web-UI widget library patched by the nag patch (optional software)
    pub widget_lib: PathBuf,
    /// Executable re-patch helper script location
    pub patch_script: PathBuf,
    /// Marker file proving the optional backup client is installed
    pub backup_client_bin: PathBuf,

    /// URI of the subscription-only platform channel (disabled by policy)
    pub enterprise_uri: String,
    /// URI of the free platform channel (enabled by policy)
    pub community_uri: String,
    /// Component name of the subscription-only channel
    pub enterprise_component: String,
    /// Component name of the free channel
    pub community_component: String,
    /// Keyring referenced by the structured platform declaration
    pub keyring_path: PathBuf,
    /// Package providing the keyring above
    pub keyring_package: String,

    /// Version oracle tool name
    pub version_tool: String,
    /// Pre-flight checker tool name
    pub preflight_tool: String,
    /// Cluster membership marker (corosync config)
    pub cluster_conf: PathBuf,
    /// Services only meaningful on cluster members
    pub cluster_services: Vec<String>,
    /// Optional backup client package reinstalled after the upgrade
    pub backup_client_package: String,
    /// Package whose files the UI patch targets
    pub widget_package: String,

    /// Skip all interactive prompts
    pub unattended: bool,
}

impl MigrateConfig {
    /// Build the configuration from defaults plus environment overrides.
    pub fn from_env(unattended: bool) -> Self {
        Self {
            source: Release::new(8, "bookworm"),
            target: Release::new(9, "trixie"),
            sources_file: env_path(ENV_SOURCES_FILE, "/etc/apt/sources.list"),
            sources_dir: env_path(ENV_SOURCES_DIR, "/etc/apt/sources.list.d"),
            backup_root: env_path(ENV_BACKUP_ROOT, "/var/backups/pveup"),
            apt_conf_dir: env_path(ENV_APT_CONF_DIR, "/etc/apt/apt.conf.d"),
            widget_lib: env_path(
                ENV_WIDGET_LIB,
                "/usr/share/javascript/proxmox-widget-toolkit/proxmoxlib.js",
            ),
            patch_script: PathBuf::from("/usr/local/bin/pveup-nonag.sh"),
            backup_client_bin: PathBuf::from("/usr/bin/proxmox-backup-client"),
            enterprise_uri: "https://enterprise.proxmox.com/debian/pve".to_string(),
            community_uri: "http://download.proxmox.com/debian/pve".to_string(),
            enterprise_component: "pve-enterprise".to_string(),
            community_component: "pve-no-subscription".to_string(),
            keyring_path: PathBuf::from("/usr/share/keyrings/proxmox-archive-keyring.gpg"),
            keyring_package: "proxmox-archive-keyring".to_string(),
            version_tool: "pveversion".to_string(),
            preflight_tool: "pve8to9".to_string(),
            cluster_conf: PathBuf::from("/etc/pve/corosync.conf"),
            cluster_services: vec!["pve-ha-lrm".to_string(), "pve-ha-crm".to_string()],
            backup_client_package: "proxmox-backup-client".to_string(),
            widget_package: "proxmox-widget-toolkit".to_string(),
            unattended,
        }
    }

    /// Name of the apt hook file that re-applies the UI patch after
    /// package operations.
    pub fn patch_hook_path(&self) -> PathBuf {
        self.apt_conf_dir.join("99-pveup-nonag")
    }

    /// Destination of the structured free-channel declaration.
    pub fn community_sources_path(&self) -> PathBuf {
        self.sources_dir.join("pve-community.sources")
    }
}

/// Resolve a path from an environment override or a default, expanding `~`.
fn env_path(var: &str, default: &str) -> PathBuf {
    match std::env::var(var) {
        Ok(dir) if !dir.is_empty() => {
            let path = expand(&dir);
            log::debug!("Using {} override: {}", var, path.display());
            path
        }
        _ => PathBuf::from(default),
    }
}

/// Expand `~` and `~user` in a path string.
pub fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
