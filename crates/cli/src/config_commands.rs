use std::path::{Path, PathBuf};

use {
    anyhow::Result,
    clap::Subcommand,
    tgrelay_config::{Severity, load_config, loader::load_config_value, save_config, validate},
};

use crate::Globals;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Rewrite a legacy single-account config in the multi-worker layout.
    Migrate {
        /// Write the result here instead of replacing the file in place.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

pub fn handle_config(globals: &Globals, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Check { verbose } => check(globals.config.as_deref(), verbose),
        ConfigAction::Migrate { output } => migrate(&globals.config_path()?, output.as_deref()),
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(config: Option<&Path>, verbose: bool) -> Result<()> {
    let result = validate(config);

    if let Some(ref path) = result.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{label}{RESET} {}", d.message);
        } else {
            eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        }
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}

fn migrate(path: &Path, output: Option<&Path>) -> Result<()> {
    let raw = load_config_value(path)?;
    if raw.get("api_credentials").is_none() {
        eprintln!("{} already uses the multi-worker layout.", path.display());
        return Ok(());
    }

    let config = load_config(path)?;
    let target = match output {
        Some(output) => output.to_path_buf(),
        None => {
            let backup = path.with_extension(format!(
                "{}.bak",
                path.extension().and_then(|e| e.to_str()).unwrap_or("json")
            ));
            std::fs::copy(path, &backup)?;
            eprintln!("Backed up original to {}", backup.display());
            path.to_path_buf()
        },
    };
    save_config(&target, &config)?;
    eprintln!(
        "Migrated {} worker(s) into {}",
        config.workers.len(),
        target.display()
    );
    Ok(())
}
