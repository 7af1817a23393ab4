use std::sync::Arc;

use {
    anyhow::Result,
    tgrelay_config::load_config,
    tgrelay_supervisor::{CommandLauncher, Supervisor, read_status},
    tokio_util::sync::CancellationToken,
    tracing::info,
};

use crate::{Globals, shutdown_signal};

pub async fn supervise(globals: &Globals) -> Result<()> {
    let config_path = std::path::absolute(globals.config_path()?)?;
    let config = load_config(&config_path)?;
    let paths = config.storage_paths(globals.data_dir());
    let data_dir = std::path::absolute(&paths.data_dir)?;

    let mut worker_args = vec![
        "--config".to_string(),
        config_path.display().to_string(),
        "--data-dir".to_string(),
        data_dir.display().to_string(),
        "--log-level".to_string(),
        globals.log_level.clone(),
    ];
    if globals.json_logs {
        worker_args.push("--json-logs".to_string());
    }
    let launcher = CommandLauncher::current_exe(worker_args, paths.clone())?;
    let supervisor = Supervisor::new(config.supervisor.clone(), paths, Arc::new(launcher));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        on_signal.cancel();
    });

    supervisor.run(config_path, cancel).await?;
    Ok(())
}

pub fn status(globals: &Globals, json: bool) -> Result<()> {
    let config = load_config(&globals.config_path()?)?;
    let path = config.storage_paths(globals.data_dir()).status_file();
    if !path.exists() {
        eprintln!("No status file at {}; is the supervisor running?", path.display());
        return Ok(());
    }
    let status = read_status(&path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "Supervisor pid {} (updated {})\n",
        status.supervisor_pid,
        status.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "{:<20} {:<20} {:>8} {:>10} {:>9}",
        "WORKER", "STATUS", "PID", "UPTIME", "RESTARTS"
    );
    for (worker_id, entry) in &status.workers {
        let pid = entry.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
        println!(
            "{:<20} {:<20} {:>8} {:>10} {:>9}",
            worker_id,
            entry.status.to_string(),
            pid,
            format_uptime(entry.uptime_secs),
            entry.restart_count
        );
        if let Some(detail) = &entry.detail {
            println!("  {detail}");
        }
    }
    Ok(())
}

fn format_uptime(secs: u64) -> String {
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m{}s", secs / 60, secs % 60),
        _ => format!("{}h{}m", secs / 3600, (secs % 3600) / 60),
    }
}
