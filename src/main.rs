use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use log::{error, info};
use tokio::sync::mpsc;

use patchline::diagnostics;
use patchline::engine::state::{
    ChainOutcome, EngineEvent, InstallOutcome, UpdateReport, UpdateStage, UpdateStatus,
};
use patchline::env::{self as app_env, AppPaths, PathResolver};
use patchline::storage::{StateStore, StoragePaths};
use patchline::util::{format_speed, progress_percent, redact_url};
use patchline::{ArchiveExtractor, EngineConfig, PatchEngine, Result, UpdateError};

#[derive(Parser, Debug)]
#[command(
    name = "patchline",
    author,
    version,
    about = "Installs and patches a desktop game client with resumable downloads"
)]
struct Cli {
    /// URL of the release document describing the base game and patch manifest.
    #[arg(long, env = "PATCHLINE_RELEASE_URL", global = true)]
    release_url: Option<String>,

    /// Directory for the state file, downloads and the default install.
    #[arg(long, env = "PATCHLINE_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the installed version and what an update would do.
    Status {
        /// Also print the release's patch notes.
        #[arg(long)]
        notes: bool,
    },
    /// Install the game or apply pending patches. Ctrl-C pauses the download.
    Update,
    /// Show the paused download, if any.
    PauseInfo,
    /// Discard a paused download and its partial file.
    ResetProgress,
    /// Install into DIR from now on; omit DIR to restore the default location.
    SetInstallDir { dir: Option<PathBuf> },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("patchline: {err}");
            let report = diagnostics::classify(&err);
            eprintln!("\n{}", diagnostics::format_report(&report));
            if report.is_retryable() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let base = AppPaths::new(cli.data_dir.unwrap_or_else(app_env::default_app_dir));
    let defaults = StoragePaths {
        install_path: base.default_install_dir(),
        download_path: base.downloads_dir(),
        custom_install_dir: None,
    };
    let store = Arc::new(
        StateStore::new(base.state_file(), defaults).with_reset_hook(|reason| {
            eprintln!("warning: launcher state was unreadable and has been reset ({reason})");
        }),
    );

    if let Command::SetInstallDir { dir } = cli.command {
        return set_install_dir(&store, dir).await;
    }

    let document = store.read().await;
    let paths = base.with_custom_install_dir(document.paths.custom_install_dir);
    paths
        .ensure_dirs()
        .map_err(|e| UpdateError::io_at("create", paths.root(), e))?;

    let config = EngineConfig {
        release_url: cli.release_url,
        ..EngineConfig::default()
    };
    let engine = Arc::new(PatchEngine::new(
        store,
        Arc::new(paths),
        Arc::new(ArchiveExtractor),
        config,
    ));

    match cli.command {
        Command::Status { notes } => status(&engine, notes).await,
        Command::Update => update(engine).await,
        Command::PauseInfo => {
            pause_info(&engine).await;
            Ok(())
        }
        Command::ResetProgress => reset_progress(&engine).await,
        Command::SetInstallDir { .. } => Ok(()),
    }
}

async fn status(engine: &PatchEngine, notes: bool) -> Result<()> {
    let release = engine.fetch_release().await?;
    let manifest = engine.fetch_patch_manifest(&release).await?;

    match engine.check_status(&release, &manifest).await {
        UpdateStatus::NotInstalled { base_version } => {
            println!("Not installed. Base game {base_version} is available.");
        }
        UpdateStatus::UpToDate { version } => println!("Up to date at {version}."),
        UpdateStatus::PatchesAvailable { installed, chain } => {
            println!("Installed {installed}; {} patch(es) to apply:", chain.len());
            for patch in &chain {
                let size = patch
                    .size_bytes
                    .map(|b| HumanBytes(b).to_string())
                    .unwrap_or_else(|| "size unknown".into());
                println!("  {} ({size})", patch.id());
            }
        }
        UpdateStatus::Stalled { installed, latest } => {
            println!("Installed {installed}; {latest} is published but no patch leads there yet.");
        }
    }
    println!("Install directory: {}", engine.install_dir().display());

    if notes {
        let text = engine.fetch_patch_notes(&release).await?;
        println!("\n{}", text.trim_end());
    }
    Ok(())
}

async fn update(engine: Arc<PatchEngine>) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut progress = CliProgress::new();
        while let Some(event) = rx.recv().await {
            progress.handle(event);
        }
        progress.finish();
    });

    let pauser = engine.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if pauser.pause_download() {
                info!("update: pausing download");
            } else {
                // Nothing resumable is running; checksum and extraction are not interruptible.
                std::process::exit(130);
            }
        }
    });

    let result = engine.run_update(&tx).await;
    interrupt.abort();
    drop(tx);
    let _ = printer.await;

    print_report(&result?);
    Ok(())
}

fn print_report(report: &UpdateReport) {
    match &report.base_game {
        Some(InstallOutcome::Installed { version }) => println!("Installed base game {version}."),
        Some(InstallOutcome::Paused) => {
            println!("Base game download paused. Run `patchline update` to resume.");
        }
        Some(InstallOutcome::AlreadyInstalled { .. }) | None => {}
    }
    match &report.chain {
        Some(ChainOutcome::UpToDate { version }) => println!("Already up to date ({version})."),
        Some(ChainOutcome::Completed { version, applied }) => {
            println!("Updated to {version} ({applied} patch(es) applied).");
        }
        Some(ChainOutcome::Stalled {
            installed, latest, ..
        }) => {
            println!("Updated to {installed}; {latest} is not reachable with the published patches yet.");
        }
        Some(ChainOutcome::Paused { patch, .. }) => {
            println!("Paused while downloading {patch}. Run `patchline update` to resume.");
        }
        None => {}
    }
}

async fn pause_info(engine: &PatchEngine) {
    let Some(progress) = engine.pending_download().await else {
        println!("No paused download.");
        return;
    };
    let total = (progress.total_bytes > 0).then_some(progress.total_bytes);
    println!(
        "{} download of {}",
        if progress.is_paused { "Paused" } else { "Interrupted" },
        redact_url(&progress.url)
    );
    println!(
        "  {} of {} ({:.1}%)",
        HumanBytes(progress.bytes_downloaded),
        total.map_or_else(|| "unknown".to_owned(), |t| HumanBytes(t).to_string()),
        progress_percent(progress.bytes_downloaded, total)
    );
    println!("  saved to {}", progress.destination_path.display());
    println!(
        "  started {}, last progress {}",
        progress.started_at.to_rfc3339(),
        progress.last_updated_at.to_rfc3339()
    );
}

async fn reset_progress(engine: &PatchEngine) -> Result<()> {
    match engine.clear_download_progress().await? {
        Some(progress) => println!(
            "Discarded {} ({} downloaded).",
            progress.destination_path.display(),
            HumanBytes(progress.bytes_downloaded)
        ),
        None => println!("No paused download."),
    }
    Ok(())
}

async fn set_install_dir(store: &StateStore, dir: Option<PathBuf>) -> Result<()> {
    let dir = match dir {
        Some(dir) => Some(
            std::path::absolute(&dir).map_err(|e| UpdateError::io_at("resolve", &dir, e))?,
        ),
        None => None,
    };
    let document = store.set_custom_install_dir(dir).await?;
    println!(
        "Install directory: {}",
        document.paths.install_path.display()
    );
    Ok(())
}

/// Terminal rendering of engine events.
struct CliProgress {
    bar: ProgressBar,
    stage_started: Instant,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg:40} [{wide_bar}] {percent:>3}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self {
            bar,
            stage_started: Instant::now(),
        }
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Stage { target, stage } => match stage {
                UpdateStage::Idle => {}
                UpdateStage::Advanced { version } => {
                    self.bar.println(format!("{target}: now at {version}"));
                }
                UpdateStage::Failed { reason } => {
                    self.bar.println(format!("{target}: failed: {reason}"));
                }
                UpdateStage::Stalled { version } => {
                    self.bar
                        .println(format!("no published patch starts at {version} yet"));
                }
                other => {
                    self.bar.reset();
                    self.stage_started = Instant::now();
                    self.bar.set_message(format!("{target}: {}", other.label()));
                }
            },
            EngineEvent::Progress {
                target,
                stage,
                current,
                total,
            } => {
                if total > 0 {
                    self.bar.set_length(total);
                }
                self.bar.set_position(current);
                if stage == "download" {
                    let elapsed = self.stage_started.elapsed().as_secs_f32().max(0.001);
                    let percent = progress_percent(current, (total > 0).then_some(total));
                    self.bar.set_message(format!(
                        "{target}: {percent:.0}% at {}",
                        format_speed(current as f32 / elapsed)
                    ));
                }
            }
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
