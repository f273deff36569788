// src/main.rs

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use pactrans::{
    Error, EventEmitter, EventReceiver, EventSender, InstallReason, MemoryEngine, PacmanConfig,
    PacmanSession, SessionSettings, TransactionOptions, event_queue,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pactrans")]
#[command(
    author,
    version,
    about = "Run package transactions and stream their progress as JSON events",
    long_about = None
)]
struct Cli {
    /// Engine scenario (TOML) with sync databases and scripted callbacks
    #[arg(short, long)]
    scenario: PathBuf,

    /// Session settings file (TOML)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// pacman.conf whose repositories are registered with the engine
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Force-update every sync database (pacman -Syy)
    Refresh,

    /// Install packages or groups (pacman -S)
    Install {
        /// Package or group names
        #[arg(required = true)]
        names: Vec<String>,

        /// Package to leave out even if a requested group contains it
        #[arg(long = "conflict", value_name = "NAME")]
        conflicts: Vec<String>,

        #[command(flatten)]
        flags: InstallFlags,
    },
}

/// Transaction flags added on top of the settings file
#[derive(Args, Debug, Default)]
struct InstallFlags {
    /// Skip packages that are already up to date
    #[arg(long)]
    needed: bool,

    /// Only download packages, do not install them
    #[arg(long)]
    download_only: bool,

    /// Skip dependency checks
    #[arg(long)]
    no_deps: bool,

    /// Install over conflicting files
    #[arg(long)]
    force: bool,

    /// Only modify database entries, not package files
    #[arg(long)]
    db_only: bool,

    /// Do not save .pacsave backup files
    #[arg(long)]
    no_save: bool,

    /// Mark every installed package as a dependency
    #[arg(long, conflicts_with = "as_explicit")]
    as_deps: bool,

    /// Mark every installed package as explicitly installed
    #[arg(long)]
    as_explicit: bool,
}

impl InstallFlags {
    fn apply(&self, mut options: TransactionOptions) -> TransactionOptions {
        options.needed |= self.needed;
        options.download_only |= self.download_only;
        options.no_deps |= self.no_deps;
        options.force |= self.force;
        options.db_only |= self.db_only;
        options.no_save |= self.no_save;
        if self.as_deps {
            options.reason = Some(InstallReason::Depend);
        } else if self.as_explicit {
            options.reason = Some(InstallReason::Explicit);
        }
        options
    }
}

/// Print every event as one JSON line until all producers are gone
fn print_events(receiver: EventReceiver) -> Result<()> {
    let stdout = io::stdout();
    for event in receiver.iter() {
        let line = serde_json::to_string(&event)?;
        let mut out = stdout.lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
    }
    Ok(())
}

fn execute(cli: &Cli, settings: &SessionSettings, sender: EventSender) -> Result<()> {
    let mut engine = MemoryEngine::load(&cli.scenario)
        .with_context(|| format!("Failed to load scenario {}", cli.scenario.display()))?;

    let conf_path = cli
        .config
        .clone()
        .or_else(|| cli.settings.as_ref().map(|_| settings.pacman_conf.clone()));
    if let Some(path) = conf_path {
        let config = PacmanConfig::load(&path)?;
        config.apply(&mut engine)?;
        info!("Registered repositories from {}", path.display());
    }

    let mut session = PacmanSession::with_engine(engine, EventEmitter::new(sender));

    match &cli.command {
        Commands::Refresh => {
            let report = session.refresh()?;
            if !report.is_success() {
                warn!("Databases not updated: {}", report.failed.join(", "));
            }
        }
        Commands::Install {
            names,
            conflicts,
            flags,
        } => {
            let options = flags.apply(settings.options.clone());
            let report = match session.install(names.as_slice(), conflicts.as_slice(), &options) {
                Ok(report) => report,
                Err(Error::NoTargets) => {
                    return Err(session.emitter_mut().error("No targets found").into());
                }
                Err(e) => return Err(e.into()),
            };

            if !report.committed {
                let text = format!("Can't install {}", report.targets.join(" "));
                return Err(session.emitter_mut().error(text).into());
            }
            info!("Installed {} packages", report.targets.len());
        }
    }

    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.settings {
        Some(path) => SessionSettings::load(path)
            .with_context(|| format!("Failed to load settings {}", path.display()))?,
        None => SessionSettings::default(),
    };

    let (sender, receiver) = event_queue(settings.queue_capacity);
    let consumer = thread::spawn(move || print_events(receiver));

    // The session owns the only sender; dropping it ends the consumer loop
    let outcome = execute(&cli, &settings, sender);

    consumer
        .join()
        .map_err(|_| anyhow!("event consumer thread panicked"))??;
    outcome
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        if e.downcast_ref::<Error>().is_some_and(Error::is_fatal) {
            // Already delivered to the event consumer
            std::process::exit(1);
        }
        return Err(e);
    }
    Ok(())
}
