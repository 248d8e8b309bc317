mod commands;
mod prompt;
mod settings;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "minikit")]
#[command(about = "Run a single-node cluster in a local virtual machine")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Machine name
    #[arg(long, short, global = true, default_value = "minikit")]
    pub profile: String,

    /// State directory (default: ~/.minikit)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the machine if needed, start it and update the credential file
    Start(commands::start::StartArgs),

    /// Stop the machine gracefully
    Stop,

    /// Force the machine off
    Kill,

    /// Remove the machine and its credential entries
    Delete,

    /// Print the machine state
    Status,

    /// Print the machine address
    Ip,

    /// Point the credential file at the machine's current address
    UpdateContext,

    /// List drivers and whether this host supports them
    Drivers,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let global = cli.global;
    match cli.command {
        Commands::Start(args) => commands::start::run(&global, args).await,
        Commands::Stop => commands::stop::stop(&global).await,
        Commands::Kill => commands::stop::kill(&global).await,
        Commands::Delete => commands::delete::run(&global).await,
        Commands::Status => commands::status::status(&global).await,
        Commands::Ip => commands::status::ip(&global).await,
        Commands::UpdateContext => commands::status::update_context(&global).await,
        Commands::Drivers => {
            commands::drivers::run();
            Ok(())
        }
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
    }
}
