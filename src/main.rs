mod backup;
mod cli;
mod config;
mod engine;
mod error;
mod facts;
mod patch;
mod runner;
mod sources;
mod system;
mod ui;

use clap::Parser;

use cli::Cli;
use config::MigrateConfig;
use engine::Outcome;
use error::Fatal;
use system::{
    Collaborators, HostCluster, HostPackageManager, HostPreflight, HostServices,
    HostVersionOracle,
};

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let cfg = MigrateConfig::from_env(cli.unattended);

    let oracle = HostVersionOracle::new(&cfg);
    let preflight = HostPreflight::new(&cfg);
    let cluster = HostCluster::new(&cfg);
    let pkg = HostPackageManager::new(&cfg);
    let svc = HostServices;
    let sys = Collaborators {
        oracle: &oracle,
        preflight: &preflight,
        cluster: &cluster,
        pkg: &pkg,
        svc: &svc,
    };

    let today = chrono::Local::now().date_naive();

    match engine::run(&cfg, &sys, today) {
        // Warnings are a handled partial completion; a re-run finishes the
        // job, so both count as success.
        Ok(Outcome::Converged(_)) => {}
        Ok(Outcome::Declined) => ui::info("Nothing done - migration declined"),
        Err(err) => {
            if let Some(fatal) = err.downcast_ref::<Fatal>() {
                ui::error(&fatal.to_string());
                ui::dim(&fatal.remediation());
                std::process::exit(fatal.exit_code());
            }
            ui::error(&format!("{err:#}"));
            std::process::exit(1);
        }
    }
}
