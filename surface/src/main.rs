//! pomosync - Pomodoro timer for the terminal.
//!
//! This binary hosts the timer engine and a terminal surface on top of the
//! shared store.
//!
//! # Commands
//!
//! - `pomosync status`: Show the timer
//! - `pomosync start --follow`: Start the timer and watch it count down
//! - `pomosync run`: Keep the engine running until interrupted
//! - `pomosync task add "Essay" --project School`: Manage tasks
//!
//! # Environment Variables
//!
//! See the `config` modules of both crates for available options.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Local, Utc};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use pomosync_engine::alerts::{AlertError, Badge, Notification, Notifier};
use pomosync_engine::config::{data_dir_from_env, EngineConfig};
use pomosync_engine::session_log::SessionLog;
use pomosync_engine::settings::SettingsPatch;
use pomosync_engine::tasks::TaskDirectory;
use pomosync_engine::types::{Task, TimerState};
use pomosync_engine::{Store, TimerEngine};
use pomosync_surface::config::SurfaceConfig;
use pomosync_surface::facade::{ClientView, TimerClient};

/// Default number of session log entries shown by `log`.
const DEFAULT_LOG_LIMIT: usize = 20;

/// pomosync - Pomodoro timer.
///
/// Every pomosync process runs the timer engine while it is alive. Use
/// `start --follow` or `run` to keep a running timer ticking.
#[derive(Parser, Debug)]
#[command(name = "pomosync")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    POMOSYNC_DATA_DIR              Store directory (default: platform data dir)
    POMOSYNC_TICK_MS               Engine tick interval (default: 1000)
    POMOSYNC_BADGE_THROTTLE_MS     Minimum gap between badge updates (default: 500)
    POMOSYNC_SESSION_LOG_CAPACITY  Session log entries kept (default: 1000)
    POMOSYNC_REQUEST_TIMEOUT_MS    Engine request timeout (default: 2000)
    POMOSYNC_WRITE_DEBOUNCE_MS     Write-behind window for start/pause (default: 50)
    POMOSYNC_READ_DEBOUNCE_MS      Window for coalescing remote changes (default: 100)
    RUST_LOG                       Log filter (default: info)

EXAMPLES:
    # Start a focus session and watch it
    pomosync start --follow

    # Work on a task with a 50 minute focus length
    pomosync task add \"Essay\" --project School --focus-minutes 50
    pomosync select <TASK_ID>

    # Show the last five logged sessions
    pomosync log --limit 5
")]
struct Cli {
    /// Store directory, overriding POMOSYNC_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Show the timer.
    Status {
        /// Print the raw state as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the timer.
    Start {
        /// Keep running and print the countdown until interrupted.
        #[arg(short, long)]
        follow: bool,
    },

    /// Pause the timer.
    Pause,

    /// Rewind the current session to its full length.
    Reset,

    /// End the current break and return to focus.
    Skip,

    /// Attribute the timer to a task.
    Select {
        /// Task ID, as shown by `task list`.
        #[arg(required_unless_present = "clear")]
        id: Option<String>,

        /// Clear the selected task instead.
        #[arg(long, conflicts_with = "id")]
        clear: bool,
    },

    /// Change timer settings. Durations are in minutes.
    Settings(SettingsArgs),

    /// Manage tasks.
    #[command(subcommand)]
    Task(TaskCommand),

    /// Manage the to-do list.
    #[command(subcommand)]
    Todo(TodoCommand),

    /// Set the daily focus goal.
    Goal {
        /// Goal in hours.
        hours: f64,
    },

    /// Show logged focus sessions, newest first.
    Log {
        #[arg(short, long, default_value_t = DEFAULT_LOG_LIMIT)]
        limit: usize,
    },

    /// Run the engine until interrupted.
    Run,
}

#[derive(Args, Debug)]
struct SettingsArgs {
    #[arg(long, value_parser = minutes_parser())]
    focus_minutes: Option<u64>,
    #[arg(long, value_parser = minutes_parser())]
    short_break_minutes: Option<u64>,
    #[arg(long, value_parser = minutes_parser())]
    long_break_minutes: Option<u64>,
    #[arg(long)]
    auto_start_breaks: Option<bool>,
    #[arg(long)]
    auto_start_pomodoros: Option<bool>,
    #[arg(long)]
    notifications: Option<bool>,
    #[arg(long)]
    sound: Option<bool>,
}

/// Longest session the CLI accepts (one day).
const MAX_SESSION_MINUTES: u64 = 24 * 60;

fn minutes_parser() -> clap::builder::RangedU64ValueParser<u64> {
    clap::value_parser!(u64).range(1..=MAX_SESSION_MINUTES)
}

impl From<SettingsArgs> for SettingsPatch {
    fn from(args: SettingsArgs) -> Self {
        Self {
            focus_duration: args.focus_minutes.map(|m| m * 60),
            short_break_duration: args.short_break_minutes.map(|m| m * 60),
            long_break_duration: args.long_break_minutes.map(|m| m * 60),
            auto_start_breaks: args.auto_start_breaks,
            auto_start_pomodoros: args.auto_start_pomodoros,
            notifications: args.notifications,
            sound: args.sound,
        }
    }
}

#[derive(Subcommand, Debug)]
enum TaskCommand {
    /// Add a task.
    Add {
        title: String,
        #[arg(short, long, default_value = "")]
        project: String,
        /// Planned number of pomodoros; 0 means open-ended.
        #[arg(long, default_value_t = 0)]
        pomodoros: u32,
        #[arg(long)]
        focus_minutes: Option<f64>,
        #[arg(long)]
        short_break_minutes: Option<f64>,
        #[arg(long)]
        long_break_minutes: Option<f64>,
    },
    /// List tasks.
    List,
    /// Mark a task done, or not done.
    Toggle { id: String },
    /// Delete a task.
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum TodoCommand {
    Add { text: String },
    Toggle { id: String },
    Delete { id: String },
    Edit { id: String, text: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => data_dir_from_env().context("Failed to resolve data directory")?,
    };
    let engine_config = EngineConfig::from_env().context("Failed to load engine configuration")?;
    let surface_config = SurfaceConfig::from_env().context("Failed to load surface configuration")?;

    let store = Store::open(&data_dir)
        .with_context(|| format!("Failed to open store at {}", data_dir.display()))?;
    debug!(data_dir = %data_dir.display(), "Store opened");

    let engine = TimerEngine::spawn(store.clone(), Arc::new(TerminalNotifier), engine_config);
    let client = TimerClient::new(store.clone(), engine.handle(), surface_config);
    client.load().await.context("Failed to load timer state")?;

    let outcome = execute(cli.command, &client, &store).await;

    client.flush_writes().await;
    engine.shutdown().await;
    outcome
}

async fn execute(command: Command, client: &TimerClient, store: &Store) -> Result<()> {
    match command {
        Command::Status { json } => {
            let state = loaded(client)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                print_status(&client.view());
            }
        }
        Command::Start { follow } => {
            client.start().await?;
            if follow {
                client.flush_writes().await;
                follow_view(client).await;
                client.pause().await?;
            } else {
                print_status(&client.view());
            }
        }
        Command::Pause => {
            client.pause().await?;
            print_status(&client.view());
        }
        Command::Reset => {
            client.reset().await?;
            print_status(&client.view());
        }
        Command::Skip => {
            client.skip_break().await?;
            print_status(&client.view());
        }
        Command::Select { id, clear } => {
            let id = if clear { None } else { id };
            if let Some(id) = id.as_deref() {
                let tasks = TaskDirectory::new(store.clone());
                if tasks.get(id).await?.is_none() {
                    anyhow::bail!("No task with ID {id}");
                }
            }
            client.select_task(id).await?;
            print_status(&client.view());
        }
        Command::Settings(args) => {
            let patch = SettingsPatch::from(args);
            if !patch.is_empty() {
                client.update_settings(patch).await?;
            }
            if let Some(settings) = client.view().settings {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            }
        }
        Command::Task(command) => run_task_command(command, store).await?,
        Command::Todo(command) => run_todo_command(command, client).await?,
        Command::Goal { hours } => {
            if !hours.is_finite() || hours < 0.0 {
                anyhow::bail!("Goal must be a non-negative number of hours");
            }
            client.set_daily_goal((hours * 3600.0).round() as u64).await?;
            print_status(&client.view());
        }
        Command::Log { limit } => {
            let log = SessionLog::with_default_capacity(store.clone());
            let entries = log.entries().await?;
            let today = log
                .focus_minutes_since(Utc::now() - ChronoDuration::days(1))
                .await?;
            for entry in entries.iter().rev().take(limit) {
                println!(
                    "{}  {:>5.1} min  {} [{}]",
                    entry.finished_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                    entry.minutes,
                    entry.title,
                    entry.project
                );
            }
            println!("{} sessions logged, {today:.1} focus minutes in the last 24h", entries.len());
        }
        Command::Run => {
            info!("Engine running. Press Ctrl+C to stop.");
            follow_view(client).await;
        }
    }
    Ok(())
}

async fn run_task_command(command: TaskCommand, store: &Store) -> Result<()> {
    let tasks = TaskDirectory::new(store.clone());
    match command {
        TaskCommand::Add {
            title,
            project,
            pomodoros,
            focus_minutes,
            short_break_minutes,
            long_break_minutes,
        } => {
            let mut task = Task::new(title, project);
            task.pomodoro_count = pomodoros;
            task.pomodoro_duration = focus_minutes;
            task.short_break_duration = short_break_minutes;
            task.long_break_duration = long_break_minutes;
            let task = tasks.add(task).await?;
            println!("{}", task.id);
        }
        TaskCommand::List => {
            for task in tasks.list().await? {
                let mark = if task.completed { "x" } else { " " };
                println!(
                    "[{mark}] {}  {} ({}) {}/{}",
                    task.id, task.title, task.project, task.completed_pomodoros, task.pomodoro_count
                );
            }
        }
        TaskCommand::Toggle { id } => {
            if tasks.toggle(&id, Utc::now()).await?.is_none() {
                anyhow::bail!("No task with ID {id}");
            }
        }
        TaskCommand::Delete { id } => {
            if !tasks.delete(&id).await? {
                anyhow::bail!("No task with ID {id}");
            }
        }
    }
    Ok(())
}

async fn run_todo_command(command: TodoCommand, client: &TimerClient) -> Result<()> {
    match command {
        TodoCommand::Add { text } => client.add_todo(&text).await?,
        TodoCommand::Toggle { id } => client.toggle_todo(&id).await?,
        TodoCommand::Delete { id } => client.delete_todo(&id).await?,
        TodoCommand::Edit { id, text } => client.update_todo(&id, &text).await?,
    }
    for todo in loaded(client)?.todos {
        let mark = if todo.completed { "x" } else { " " };
        println!("[{mark}] {}  {}", todo.id, todo.text);
    }
    Ok(())
}

fn loaded(client: &TimerClient) -> Result<TimerState> {
    client.state().context("Timer state is not loaded")
}

fn print_status(view: &ClientView) {
    let Some(state) = view.state.as_ref() else {
        println!("No timer state");
        return;
    };
    let status = if state.is_running { "running" } else { "paused" };
    println!("{} {}  {}", state.mode, state.clock_text(), status);
    println!(
        "pomodoros {}  focus {} of {} min",
        state.pomodoros,
        state.focus_seconds / 60,
        state.daily_goal / 60
    );
    if let Some(task_id) = state.selected_task_id.as_deref() {
        println!("task {task_id}");
    }
    if let Some(error) = view.error.as_deref() {
        eprintln!("{error}");
    }
}

/// Prints every view change until a shutdown signal arrives.
async fn follow_view(client: &TimerClient) {
    let mut view = client.subscribe();
    let mut last_line = String::new();
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        let line = view
            .borrow_and_update()
            .state
            .as_ref()
            .map(|state| format!("{} {}", state.mode, state.clock_text()))
            .unwrap_or_default();
        if line != last_line {
            println!("{line}");
            last_line = line;
        }

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// Prints notifications to the terminal.
#[derive(Debug, Clone, Copy)]
struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn show_notification(&self, notification: &Notification) -> Result<(), AlertError> {
        println!("{}\n  {}", notification.title, notification.message);
        Ok(())
    }

    fn set_badge(&self, badge: &Badge) -> Result<(), AlertError> {
        debug!(text = %badge.text, color = badge.color, "Badge");
        Ok(())
    }
}

/// Initializes the logging subsystem. Logs go to stderr.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
