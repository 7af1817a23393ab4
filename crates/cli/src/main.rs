mod backfill_commands;
mod config_commands;
mod supervise_commands;
mod worker_commands;

use std::path::{Path, PathBuf};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tgrelay_config::resolve_config_path,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "tgrelay", about = "tgrelay: Telegram channel relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: ./tgrelay.{toml,yaml,json}, then ~/.config/tgrelay/).
    #[arg(long, global = true, env = "TGRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for state, sessions and logs (overrides config value).
    #[arg(long, global = true, env = "TGRELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured worker under supervision (default).
    Supervise,
    /// Run a single worker in the foreground.
    Worker {
        #[arg(long)]
        worker_id: String,
    },
    /// Show the supervisor's last status snapshot.
    Status {
        /// Print the raw JSON snapshot.
        #[arg(long)]
        json: bool,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Backfill bookkeeping.
    Backfill {
        #[command(subcommand)]
        action: backfill_commands::BackfillAction,
    },
}

/// Options forwarded to spawned workers so they log and resolve paths the
/// same way as the supervisor.
struct Globals {
    config: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    log_level: String,
    json_logs: bool,
}

impl Globals {
    fn config_path(&self) -> anyhow::Result<PathBuf> {
        resolve_config_path(self.config.as_deref())
            .context("no config file found; pass --config or create tgrelay.toml")
    }

    fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let globals = Globals {
        config: cli.config,
        data_dir: cli.data_dir,
        log_level: cli.log_level,
        json_logs: cli.json_logs,
    };

    // Workers run one cooperative loop on a single thread.
    let runtime = match cli.command {
        Some(Commands::Worker { .. }) => tokio::runtime::Builder::new_current_thread(),
        _ => tokio::runtime::Builder::new_multi_thread(),
    }
    .enable_all()
    .build()?;

    runtime.block_on(async move {
        match cli.command {
            None | Some(Commands::Supervise) => {
                info!(version = env!("CARGO_PKG_VERSION"), "tgrelay starting");
                supervise_commands::supervise(&globals).await
            },
            Some(Commands::Worker { worker_id }) => {
                let code = worker_commands::run_worker(&globals, &worker_id).await?;
                if code != 0 {
                    std::process::exit(code);
                }
                Ok(())
            },
            Some(Commands::Status { json }) => supervise_commands::status(&globals, json),
            Some(Commands::Config { action }) => config_commands::handle_config(&globals, action),
            Some(Commands::Backfill { action }) => {
                backfill_commands::handle_backfill(&globals, action).await
            },
        }
    })
}

/// Resolves when the process is asked to stop (Ctrl-C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
