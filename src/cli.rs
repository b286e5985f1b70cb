use clap::Parser;

/// Single entry point: no subcommands, behavior is controlled by flags
/// and `PVEUP_*` environment variables.
#[derive(Parser)]
#[command(name = "pveup")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Converge this host onto the next major release line")]
#[command(
    long_about = "Converge this host onto the next major release line.\n\n\
                  Every step is idempotent: re-run the tool after a partial or\n\
                  interrupted migration and it continues where it left off.\n\
                  Run at most one instance against a host at a time; concurrent\n\
                  invocations are unsupported."
)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,

    /// Never prompt; assume yes and keep package frontends non-interactive
    #[arg(short = 'y', long, env = "PVEUP_UNATTENDED")]
    pub unattended: bool,
}
