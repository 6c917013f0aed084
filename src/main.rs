use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use procrastination_watcher::checker::ActivityChecker;
use procrastination_watcher::config::WatcherConfig;
use procrastination_watcher::control::{self, SocketClient, WatcherStatus};
use procrastination_watcher::logging::{init_cli_logging, init_daemon_logging};
use procrastination_watcher::model::OllamaLanguageModel;
use procrastination_watcher::notify::DesktopNotifier;
use procrastination_watcher::paths::{
    capture_path, config_path, default_data_dir, logs_dir, socket_path, state_path,
};
use procrastination_watcher::permissions::{screen_recording_help_message, screen_recording_status};
use procrastination_watcher::popup::{PopupController, format_elapsed};
use procrastination_watcher::screenshot::SystemScreenshotProvider;
use procrastination_watcher::service::WatcherService;
use procrastination_watcher::session::SessionManager;
use procrastination_watcher::settings::{DEFAULT_CHECK_INTERVAL, JsonFileStore, SettingsStore};
use procrastination_watcher::tab::SystemActiveTabProvider;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "procrastination-watcher")]
#[command(about = "Periodically checks whether your screen matches your stated goal")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Config file (defaults to <data dir>/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the background watcher.
    Daemon,
    /// Set a goal and start periodic checks.
    Start(StartArgs),
    /// Clear the goal and stop checking.
    Stop,
    /// Show the current goal, trigger and model state.
    Status,
    /// Ask the daemon to show a sample desktop notification.
    TestNotification,
    /// Run one check right away and print the verdict.
    CheckNow,
    /// Print model availability and sampling parameters.
    ModelInfo,
}

#[derive(Debug, Args)]
struct StartArgs {
    #[arg(long)]
    goal: String,

    /// Minutes between checks (1-10).
    #[arg(long, default_value_t = DEFAULT_CHECK_INTERVAL)]
    interval: u32,
}

struct AppContext {
    data_dir: PathBuf,
    config: WatcherConfig,
}

impl AppContext {
    fn load(global: &GlobalArgs) -> Result<Self> {
        let data_dir = global.data_dir.clone().unwrap_or_else(default_data_dir);
        let config_file = global
            .config
            .clone()
            .unwrap_or_else(|| config_path(&data_dir));
        let config = WatcherConfig::load(&config_file)?;
        Ok(Self { data_dir, config })
    }

    fn socket(&self) -> PathBuf {
        self.config
            .control
            .socket_path
            .clone()
            .unwrap_or_else(|| socket_path(&self.data_dir))
    }

    fn store(&self) -> SettingsStore {
        SettingsStore::new(Arc::new(JsonFileStore::new(state_path(&self.data_dir))))
    }

    fn sessions(&self) -> Result<SessionManager> {
        let model = &self.config.model;
        let ollama = OllamaLanguageModel::new(&model.endpoint, &model.model, model.request_timeout)
            .context("failed to initialize model client")?;
        Ok(SessionManager::new(Some(Arc::new(ollama)))
            .with_availability_timeout(model.availability_timeout)
            .with_sampling(model.temperature, model.top_k))
    }

    fn popup(&self) -> PopupController {
        let client = SocketClient::new(self.socket())
            .with_check_timeout(self.config.model.check_timeout());
        PopupController::new(self.store(), Arc::new(client))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = AppContext::load(&cli.global)?;

    match &cli.command {
        Commands::Daemon => init_daemon_logging(&logs_dir(&ctx.data_dir), cli.global.verbose)?,
        _ => init_cli_logging(cli.global.verbose),
    }

    match cli.command {
        Commands::Daemon => run_daemon(ctx).await?,
        Commands::Start(args) => {
            let alert = ctx.popup().start(&args.goal, args.interval).await?;
            println!(
                "Watching \"{}\" every {} minute(s)",
                alert.goal, args.interval
            );
        }
        Commands::Stop => {
            ctx.popup().stop().await?;
            println!("Stopped watching");
        }
        Commands::Status => print_status(&ctx.popup().status().await?),
        Commands::TestNotification => {
            ctx.popup().test_notification().await?;
            println!("Test notification sent");
        }
        Commands::CheckNow => {
            let response = ctx.popup().check_now().await?;
            match response.verdict {
                Some(verdict) => println!(
                    "{} ({}% confident): {}",
                    if verdict.on_track {
                        "On track"
                    } else {
                        "Off track"
                    },
                    verdict.confidence,
                    verdict.reason
                ),
                None => println!("Check completed"),
            }
        }
        Commands::ModelInfo => print_model_info(&ctx).await?,
    }
    Ok(())
}

async fn print_model_info(ctx: &AppContext) -> Result<()> {
    let sessions = ctx.sessions()?;
    let availability = sessions.availability().await;
    println!("model: {}", ctx.config.model.model);
    println!("availability: {}", availability.status);
    if let Some(error) = availability.error {
        println!("error: {error}");
    }
    match sessions.model_info().await {
        Some(params) => println!(
            "temperature: default {} (max {}), top_k: default {} (max {})",
            params.default_temperature,
            params.max_temperature,
            params.default_top_k,
            params.max_top_k
        ),
        None => println!("parameters: unavailable"),
    }
    Ok(())
}

fn print_status(status: &WatcherStatus) {
    match &status.alert {
        Some(alert) if alert.enabled => {
            println!("goal: {}", alert.goal);
            println!(
                "active for: {}",
                format_elapsed(alert.started_at, Utc::now().timestamp_millis())
            );
        }
        _ => println!("goal: (none)"),
    }
    println!(
        "watching: {} (every {} minute(s))",
        if status.settings.enabled { "yes" } else { "no" },
        status.settings.check_interval
    );
    match &status.trigger {
        Some(trigger) => println!(
            "trigger: every {} minute(s), scheduled {}",
            trigger.period_in_minutes, trigger.scheduled_at
        ),
        None => println!("trigger: (not scheduled)"),
    }
    print!("model: {}", status.availability.status);
    match &status.availability.error {
        Some(error) => println!(" ({error})"),
        None => println!(),
    }
    if status.checking {
        println!("a check is in progress");
    }
}

async fn run_daemon(ctx: AppContext) -> Result<()> {
    let permission = screen_recording_status();
    if !permission.is_granted() {
        tracing::warn!(
            status = ?permission,
            "{}",
            screen_recording_help_message()
        );
    }

    let checker = ActivityChecker::new(
        ctx.store(),
        Arc::new(SystemActiveTabProvider),
        Arc::new(SystemScreenshotProvider::new(
            capture_path(&ctx.data_dir),
            ctx.config.capture.command.clone(),
        )),
        Arc::new(DesktopNotifier::new(
            ctx.config.notifications.fallback_to_console,
        )),
        ctx.sessions()?,
    )
    .with_max_image_dimension(ctx.config.capture.max_dimension);

    let (service, trigger_rx) = WatcherService::new(Arc::new(checker));
    let service = Arc::new(service);

    let availability = service.checker().availability().await;
    tracing::info!(
        model = %ctx.config.model.model,
        status = %availability.status,
        "model availability"
    );

    match service.restore().await {
        Ok(true) => {}
        Ok(false) => tracing::debug!("no active watch to restore"),
        Err(err) => tracing::warn!(error = %format!("{err:#}"), "failed to restore watch"),
    }

    let socket = ctx.socket();
    let listener = control::bind(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon listening");

    let result = tokio::select! {
        result = control::serve(listener, service.clone()) => result,
        _ = service.run_triggers(trigger_rx) => Ok(()),
        result = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            result.context("failed to listen for ctrl-c")
        }
    };

    service.shutdown().await;
    if let Err(err) = std::fs::remove_file(&socket) {
        tracing::debug!(error = %err, "failed to remove socket");
    }
    result
}
