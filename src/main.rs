//! remon - development-time restart supervisor.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{ColorChoice, Parser};
use tokio::sync::mpsc::UnboundedSender;

use remon::cli::Cli;
use remon::config::{ConfigError, MonitorConfig};
use remon::diagnostic::DiagnosticServer;
use remon::loader::ProcessLoader;
use remon::supervisor::{self, RestartController, Supervisor, SupervisorMsg};
use remon::watch::{FsWatcher, WatchRules};
use remon::{debug, log};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global color override based on CLI option
    match cli.color {
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
        ColorChoice::Auto => {} // owo-colors auto-detects TTY
    }

    let config = MonitorConfig::load(&cli)?;
    let (tx, rx) = supervisor::channel();
    setup_shutdown_handler(tx.clone())?;

    let rules =
        WatchRules::new(config.get_root(), &config.watch.add_ignore).map_err(ConfigError::from)?;
    debug!("watch"; "ignoring {}", rules.absolute_rules().join(", "));
    let _watcher = FsWatcher::new(rules, tx.clone())
        .with_context(|| format!("failed to watch {}", config.get_root().display()))?;

    let loader = ProcessLoader::from_config(&config).context("failed to open the control channel")?;
    let diagnostic = DiagnosticServer::new(config.diagnostic_addr());
    let controller =
        RestartController::new(loader, config.entry(), config.get_root(), diagnostic, tx)
            .with_profile(config.profile);

    if let Some(path) = &config.config_path {
        debug!("config"; "using {}", path.display());
    }
    log!("app"; "`{}` on port {}", config.app.run.join(" "), config.port);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to create tokio runtime")?;
    runtime.block_on(Supervisor::new(controller, rx).run())?;
    Ok(())
}

/// First Ctrl+C stops the application and exits; a second one exits now.
fn setup_shutdown_handler(tx: UnboundedSender<SupervisorMsg>) -> Result<()> {
    static REQUESTED: AtomicBool = AtomicBool::new(false);

    ctrlc::set_handler(move || {
        if REQUESTED.swap(true, Ordering::SeqCst) || tx.send(SupervisorMsg::Shutdown).is_err() {
            std::process::exit(130);
        }
        log!("app"; "shutting down...");
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {}", e))
}
