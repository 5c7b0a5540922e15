//! vmfleet: provision, operate and tear down a fleet of identical VMs in
//! one hosted service.
//!
//! Usage:
//!   vmfleet --config <deployment.yaml> [--provision <vm.yaml>] [--start]
//!           [--test-ssh] [--stop] [--snapshot <snapshot.yaml>] [--teardown]
//!
//! Steps run in the order listed above, whatever the order on the
//! command line.

mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::run::Runner;

#[derive(Parser, Debug)]
#[command(name = "vmfleet")]
#[command(about = "Provision and tear down a fleet of homogeneous VMs")]
struct Cli {
    /// Deployment spec (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Provision the fleet described by this VM template (YAML)
    #[arg(long, value_name = "VM_TEMPLATE")]
    provision: Option<PathBuf>,

    /// Start every role
    #[arg(long)]
    start: bool,

    /// Wait until every SSH endpoint answers
    #[arg(long)]
    test_ssh: bool,

    /// Stop and deallocate every role
    #[arg(long)]
    stop: bool,

    /// Capture every role as an OS image, named by this spec (YAML)
    #[arg(long, value_name = "SNAPSHOT_SPEC")]
    snapshot: Option<PathBuf>,

    /// Only capture this role when snapshotting
    #[arg(long, requires = "snapshot")]
    role: Option<String>,

    /// Delete every resource of the fleet
    #[arg(long)]
    teardown: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let runner = match Runner::prepare(&cli) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let summary = runner.run(&cli).await;
    eprint!("{summary}");
    if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
