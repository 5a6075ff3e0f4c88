use clap::{Parser, Subcommand};
use crossterm::style::Stylize;
use ftl::commands::{self, Context, JumpArgs};
use ftl::config::Settings;
use ftl::docker::{DockerEngine, LogOptions};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "ftl", version, about = "Docker-based development environments")]
struct Cli {
    /// More logging (-v info, -vv debug)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    log_level: u8,

    /// Registry directory
    #[arg(long, env = "FTL_HOME", global = true)]
    home: Option<PathBuf>,

    /// Chart to operate on (id or path)
    #[arg(long, env = "FTL_CHART", global = true)]
    chart: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage charted projects
    Chart {
        #[command(subcommand)]
        action: ChartAction,
    },
    /// List the current chart's profiles
    ListProfiles {
        /// Include descriptions
        #[arg(long)]
        verbose: bool,
    },
    /// Select the active profile, or show it
    Profile { name: Option<String> },
    /// Bring the active profile up and attach to it
    Jump {
        /// Rebuild every service even if unchanged
        #[arg(long)]
        rebuild: bool,
        /// Leave the environment running without attaching
        #[arg(long)]
        no_attach: bool,
    },
    /// Stop the active profile's services
    Stop,
    /// Show the active profile's services
    #[command(visible_alias = "ps")]
    Status,
    /// Open a shell in a running service
    Attach {
        /// Service name, or profile/service (defaults to the entry service)
        service: Option<String>,
        /// Shell to run instead of the service's own
        #[arg(short, long)]
        shell: Option<String>,
    },
    /// Print a service's container output
    #[command(visible_alias = "tail")]
    Logs {
        /// Service name, or profile/service
        service: String,
        /// Keep streaming new output
        #[arg(short, long)]
        follow: bool,
        /// Only the last N lines
        #[arg(short = 'n', long)]
        tail: Option<usize>,
    },
    /// Remove the chart's containers that the active profile does not use
    Gc,
}

#[derive(Subcommand)]
enum ChartAction {
    /// Register a project directory
    Add { path: PathBuf },
    /// List registered charts
    List,
    /// Forget a chart
    Remove { chart: String },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "ftl=warn",
        1 => "ftl=info",
        _ => "ftl=debug",
    };
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
    );

    // stdout carries command output
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_env().with_home(cli.home);
    let cwd = std::env::current_dir()?;
    let ctx = Context::new(settings, cli.chart, cwd).with_color(std::io::stdout().is_terminal());
    let mut out = std::io::stdout();

    match cli.command {
        Commands::Chart { action } => match action {
            ChartAction::Add { path } => commands::chart_add(&ctx, &path, &mut out)?,
            ChartAction::List => commands::chart_list(&ctx, &mut out)?,
            ChartAction::Remove { chart } => commands::chart_remove(&ctx, &chart, &mut out)?,
        },
        Commands::ListProfiles { verbose } => commands::list_profiles(&ctx, verbose, &mut out)?,
        Commands::Profile { name } => commands::profile(&ctx, name.as_deref(), &mut out)?,
        Commands::Jump { rebuild, no_attach } => {
            let engine = DockerEngine::connect(&ctx.settings.docker_bin);
            let args = JumpArgs {
                rebuild,
                attach: !no_attach,
            };
            tokio::select! {
                result = commands::jump(&ctx, &engine, args, &mut out) => result?,
                _ = tokio::signal::ctrl_c() => return Err(ftl::Error::Interrupted.into()),
            }
        }
        Commands::Stop => {
            let engine = DockerEngine::connect(&ctx.settings.docker_bin);
            tokio::select! {
                result = commands::stop(&ctx, &engine, &mut out) => result?,
                _ = tokio::signal::ctrl_c() => return Err(ftl::Error::Interrupted.into()),
            }
        }
        Commands::Status => {
            let engine = DockerEngine::connect(&ctx.settings.docker_bin);
            commands::status(&ctx, &engine, &mut out).await?
        }
        Commands::Attach { service, shell } => {
            let engine = DockerEngine::connect(&ctx.settings.docker_bin);
            let code = commands::attach(&ctx, &engine, service.as_deref(), shell.as_deref()).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Logs { service, follow, tail } => {
            let engine = DockerEngine::connect(&ctx.settings.docker_bin);
            let options = LogOptions { follow, tail };
            tokio::select! {
                result = commands::logs(&ctx, &engine, &service, options, &mut out) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Commands::Gc => {
            let engine = DockerEngine::connect(&ctx.settings.docker_bin);
            tokio::select! {
                result = commands::gc(&ctx, &engine, &mut out) => result?,
                _ = tokio::signal::ctrl_c() => return Err(ftl::Error::Interrupted.into()),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    if let Err(e) = run(cli).await {
        // Dropping the in-flight future above has already killed any docker child.
        if std::io::stderr().is_terminal() {
            eprintln!("{} {e:#}", "error:".red().bold());
        } else {
            eprintln!("error: {e:#}");
        }
        std::process::exit(1);
    }
}
