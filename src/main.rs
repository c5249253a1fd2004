//! llamarack: launch and watch a local `llama-server` from the terminal.
//!
//! This is the entry point of the application. It parses command-line arguments, loads the
//! saved profile, and either runs a one-shot profile command or sets up the main event loop
//! that supervises the server.

mod app;
mod clipboard;
mod command;
mod config;
mod events;
mod health;
mod output;
mod settings;
mod supervisor;
mod tui;

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use crossterm::event::KeyEventKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::app::{App, AppAction};
use crate::command::{build_command, server_url};
use crate::events::{Event, ShutdownSignal};
use crate::settings::{Profile, SETTINGS};
use crate::supervisor::{OutputListener, StartOutcome, Supervisor};

const LOG_ENV: &str = "LLAMARACK_LOG";
const TICK_RATE: Duration = Duration::from_millis(50);
const DEFAULT_MAX_LINES: usize = 10_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
// How long to wait for the exit event after a forced kill before giving up on it.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "llamarack",
    version,
    about = "Configure, launch and monitor a local llama.cpp server",
    styles = help_styles(),
    color = clap::ColorChoice::Auto
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the JSON profile (default: next to the executable).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append diagnostics to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the server and watch its output (the default).
    Run(RunArgs),
    /// Print the server command line for the saved profile.
    Command {
        /// Also copy it to the clipboard.
        #[arg(long)]
        copy: bool,
    },
    /// Print the saved profile as JSON.
    Show,
    /// List every setting with its flag and current value.
    Settings,
    /// Change one setting and save the profile.
    Set {
        name: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// Restore one setting to its default and save the profile.
    Unset { name: String },
    /// Manage extra arguments appended to the command line.
    #[command(subcommand)]
    Args(ArgsCommand),
    /// Open the server URL in the default browser.
    Open,
}

#[derive(Debug, Subcommand)]
enum ArgsCommand {
    /// Show the arguments with their numbers.
    List,
    /// Append an argument (enabled).
    Add {
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// Replace the text of argument INDEX.
    Edit {
        index: usize,
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// Enable or disable argument INDEX.
    Toggle { index: usize },
    /// Delete argument INDEX.
    Remove { index: usize },
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Print server output to stdout instead of opening the TUI.
    #[arg(long)]
    no_ui: bool,
    /// Max log lines kept in the TUI.
    #[arg(long, default_value_t = DEFAULT_MAX_LINES)]
    max_lines: usize,
    /// Append every server output line to this file.
    #[arg(long)]
    server_log: Option<PathBuf>,
    /// How long to wait for a graceful stop before killing the server.
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_MS)]
    shutdown_timeout_ms: u64,
    /// Do not poll the server's /health endpoint.
    #[arg(long)]
    no_probe: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            no_ui: false,
            max_lines: DEFAULT_MAX_LINES,
            server_log: None,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            no_probe: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default()));
    let tui_mode = matches!(&command, Commands::Run(args) if !args.no_ui);
    init_logging(cli.log_file.as_deref(), !tui_mode)?;

    let config_path = cli
        .config
        .or_else(config::default_config_path)
        .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE_NAME));
    tracing::debug!(path = %config_path.display(), "using configuration file");

    match command {
        Commands::Run(args) if args.no_ui => run_raw(args, &config_path).await,
        Commands::Run(args) => run_tui(args, config_path).await,
        Commands::Command { copy } => {
            let profile = config::load_or_default(&config_path)?;
            let preview = if copy {
                let preview = clipboard::copy_command(&profile)?;
                eprintln!("copied to clipboard");
                preview
            } else {
                build_command(&profile.settings, &profile.custom_args)?.preview()
            };
            println!("{}", preview);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Show => {
            let profile = config::load_or_default(&config_path)?;
            println!("{}", config::to_document(&profile)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Settings => {
            let profile = config::load_or_default(&config_path)?;
            print_settings(&profile);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Set { name, value } => {
            let mut profile = config::load_or_default(&config_path)?;
            profile.settings.set(&name, &value)?;
            config::save_config(&config_path, &profile)?;
            println!("{} = {}", name, profile.settings.value(&name).unwrap_or_default());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Unset { name } => {
            let mut profile = config::load_or_default(&config_path)?;
            profile.settings.unset(&name)?;
            config::save_config(&config_path, &profile)?;
            println!("{} = {}", name, profile.settings.value(&name).unwrap_or_default());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Args(command) => {
            args_command(command, &config_path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Open => {
            let profile = config::load_or_default(&config_path)?;
            let url = server_url(&profile.settings);
            open::that(&url).with_context(|| format!("failed to open {}", url))?;
            println!("opened {}", url);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(log_file: Option<&Path>, to_stderr: bool) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let result = match (log_file, to_stderr) {
        (Some(path), _) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        (None, true) => builder.with_writer(std::io::stderr).try_init(),
        // The TUI owns the terminal; without a log file diagnostics are dropped.
        (None, false) => builder.with_writer(std::io::sink).try_init(),
    };
    result.map_err(|err| anyhow!("failed to initialise logging: {}", err))
}

fn print_settings(profile: &Profile) {
    for spec in SETTINGS {
        let value = profile.settings.value(spec.name).unwrap_or_default();
        println!(
            "{:<18} {:<8} {:<24} {:<20} {}",
            spec.name,
            spec.kind.label(),
            spec.flag,
            if value.is_empty() { "-" } else { value.as_str() },
            spec.help
        );
    }
}

fn args_command(command: ArgsCommand, config_path: &Path) -> Result<()> {
    let mut profile = config::load_or_default(config_path)?;
    match command {
        ArgsCommand::List => {
            if profile.custom_args.is_empty() {
                println!("no custom arguments");
            }
            for (i, arg) in profile.custom_args.iter().enumerate() {
                let marker = if arg.enabled { "x" } else { " " };
                println!("{:>3}. [{}] {}", i + 1, marker, arg.value);
            }
            return Ok(());
        }
        ArgsCommand::Add { value } => {
            let index = profile.custom_args.add(&value)?;
            println!("added {}. {}", index + 1, value.trim());
        }
        ArgsCommand::Edit { index, value } => {
            profile.custom_args.edit(position(index)?, &value)?;
            println!("updated {}. {}", index, value.trim());
        }
        ArgsCommand::Toggle { index } => {
            let enabled = profile.custom_args.toggle(position(index)?)?;
            println!("{} {}", if enabled { "enabled" } else { "disabled" }, index);
        }
        ArgsCommand::Remove { index } => {
            let removed = profile.custom_args.remove(position(index)?)?;
            println!("removed {}", removed.value);
        }
    }
    config::save_config(config_path, &profile)?;
    Ok(())
}

// Argument numbers shown to users start at 1.
fn position(index: usize) -> Result<usize> {
    index
        .checked_sub(1)
        .ok_or_else(|| anyhow!("argument numbers start at 1"))
}

/// Appends server output to a file next to the normal relay.
struct ServerLog {
    writer: BufWriter<File>,
}

impl ServerLog {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open server log {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_line(&mut self, line: &str) {
        if let Err(err) = writeln!(self.writer, "{}", line) {
            tracing::warn!(error = %err, "failed to write server log");
        }
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Forwards supervisor output to a listener and, when configured, the server log.
struct Relay<'a, L> {
    inner: &'a mut L,
    server_log: Option<&'a mut ServerLog>,
}

impl<L: OutputListener> OutputListener for Relay<'_, L> {
    fn on_output_line(&mut self, text: &str) {
        if let Some(log) = self.server_log.as_deref_mut() {
            log.write_line(text);
        }
        self.inner.on_output_line(text);
    }

    fn on_stopped(&mut self, exit_code: Option<i32>) {
        if let Some(log) = self.server_log.as_deref_mut() {
            log.flush();
        }
        self.inner.on_stopped(exit_code);
    }
}

fn drain_into<L: OutputListener>(
    supervisor: &mut Supervisor,
    listener: &mut L,
    server_log: &mut Option<ServerLog>,
) -> usize {
    let mut relay = Relay {
        inner: listener,
        server_log: server_log.as_mut(),
    };
    let handled = supervisor.drain(&mut relay);
    if handled > 0 {
        if let Some(log) = server_log.as_mut() {
            log.flush();
        }
    }
    handled
}

/// Plain stdout relay for `--no-ui`.
#[derive(Debug, Default)]
struct RawPrinter {
    stopped: Option<Option<i32>>,
}

impl OutputListener for RawPrinter {
    fn on_output_line(&mut self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", text);
    }

    fn on_stopped(&mut self, exit_code: Option<i32>) {
        self.stopped = Some(exit_code);
    }
}

fn exit_status_byte(exit_code: Option<i32>) -> u8 {
    match exit_code {
        Some(code) => u8::try_from(code).unwrap_or(1),
        None => 1,
    }
}

async fn run_raw(args: RunArgs, config_path: &Path) -> Result<ExitCode> {
    let profile = config::load_or_default(config_path)?;
    let mut server_log = args.server_log.as_deref().map(ServerLog::open).transpose()?;
    let mut supervisor = Supervisor::new();
    supervisor.start(&profile).context("cannot start server")?;

    let (event_tx, mut event_rx) = mpsc::channel(16);
    spawn_signal_listener(event_tx.clone());
    let mut probe = if args.no_probe || supervisor.pid().is_none() {
        None
    } else {
        Some(health::spawn_probe(
            server_url(&profile.settings),
            supervisor.run_id(),
            event_tx.clone(),
        ))
    };

    let timeout = Duration::from_millis(args.shutdown_timeout_ms);
    let mut printer = RawPrinter::default();
    let mut shutdown = ShutdownTimer::default();
    let mut ticker = tokio::time::interval(TICK_RATE);

    let exit_code = loop {
        tokio::select! {
            Some(event) = event_rx.recv() => match event {
                Event::Shutdown { signal } => {
                    tracing::info!(signal = signal.label(), "shutdown requested");
                    if shutdown.is_pending() {
                        shutdown.expire();
                    } else {
                        supervisor.stop();
                        shutdown.begin(timeout);
                    }
                }
                Event::ServerReady { run } if run == supervisor.run_id() => {
                    tracing::info!(url = %server_url(&profile.settings), "server is ready");
                }
                _ => {}
            },
            _ = ticker.tick() => {}
        }

        drain_into(&mut supervisor, &mut printer, &mut server_log);
        if let Some(code) = printer.stopped {
            break code;
        }
        if shutdown.step(&mut supervisor) {
            break None;
        }
    };

    if let Some(handle) = probe.take() {
        handle.abort();
    }
    Ok(ExitCode::from(exit_status_byte(exit_code)))
}

/// Deadline tracking for a stop that may need escalating.
#[derive(Debug, Default)]
struct ShutdownTimer {
    deadline: Option<Instant>,
    killed_at: Option<Instant>,
}

impl ShutdownTimer {
    fn begin(&mut self, timeout: Duration) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + timeout);
        }
    }

    fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    fn expire(&mut self) {
        self.deadline = Some(Instant::now());
    }

    /// Kills the server once the deadline passes. Returns `true` when waiting any
    /// longer is pointless.
    fn step(&mut self, supervisor: &mut Supervisor) -> bool {
        let Some(deadline) = self.deadline else {
            return false;
        };
        if !supervisor.state().is_active() {
            return true;
        }
        let now = Instant::now();
        match self.killed_at {
            None if now >= deadline => {
                tracing::warn!("server did not stop in time");
                supervisor.force_kill();
                self.killed_at = Some(now);
                false
            }
            Some(killed_at) => now.duration_since(killed_at) >= KILL_GRACE,
            None => false,
        }
    }
}

async fn run_tui(args: RunArgs, config_path: PathBuf) -> Result<ExitCode> {
    let (profile, load_error) = match config::load_or_default(&config_path) {
        Ok(profile) => (profile, None),
        Err(err) => {
            tracing::warn!(error = %err, "falling back to the default profile");
            (Profile::default(), Some(err))
        }
    };
    let mut server_log = args.server_log.as_deref().map(ServerLog::open).transpose()?;

    let mut app = App::new(profile, config_path, args.max_lines);
    if let Some(err) = load_error {
        app.set_status_warning_persistent(format!("{}; using defaults", err));
    }
    let mut supervisor = Supervisor::new();
    let (event_tx, mut event_rx) = mpsc::channel(256);

    let mut terminal = tui::init_terminal()?;
    spawn_input_listener(event_tx.clone());
    spawn_signal_listener(event_tx.clone());

    let timeout = Duration::from_millis(args.shutdown_timeout_ms);
    let mut probe: Option<JoinHandle<()>> = None;
    let mut shutdown = ShutdownTimer::default();
    let mut ticker = tokio::time::interval(TICK_RATE);
    let mut result: Result<()> = Ok(());

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => match event {
                Event::Key(key) => {
                    let action = app.handle_key(key);
                    handle_app_action(
                        action,
                        &mut app,
                        &mut supervisor,
                        &mut probe,
                        &event_tx,
                        !args.no_probe,
                    );
                }
                Event::Resize { width, height } => {
                    tracing::trace!(width, height, "terminal resized");
                }
                Event::ServerReady { run } => {
                    if run == supervisor.run_id() {
                        app.on_server_ready();
                    }
                }
                Event::Shutdown { signal } => {
                    tracing::info!(signal = signal.label(), "shutdown requested");
                    app.should_quit = true;
                }
            },
            _ = ticker.tick() => {}
        }

        drain_into(&mut supervisor, &mut app, &mut server_log);
        app.sync_run(supervisor.state(), supervisor.pid());
        if !supervisor.state().is_active() {
            if let Some(handle) = probe.take() {
                handle.abort();
            }
        }

        if app.should_quit {
            if !shutdown.is_pending() {
                if !supervisor.state().is_active() {
                    break;
                }
                request_stop(&mut app, &mut supervisor, &mut probe);
                app.set_status_warning_persistent("Waiting for the server to stop...");
                shutdown.begin(timeout);
            }
            if shutdown.step(&mut supervisor) {
                break;
            }
        }

        if let Err(err) = tui::draw(&mut app, &mut terminal) {
            result = Err(err.into());
            break;
        }
    }

    if let Some(handle) = probe.take() {
        handle.abort();
    }
    tui::restore_terminal(terminal)?;
    result.map(|()| ExitCode::SUCCESS)
}

fn handle_app_action(
    action: AppAction,
    app: &mut App,
    supervisor: &mut Supervisor,
    probe: &mut Option<JoinHandle<()>>,
    event_tx: &mpsc::Sender<Event>,
    probe_enabled: bool,
) {
    match action {
        AppAction::Start => {
            start_server(app, supervisor, probe, event_tx, probe_enabled);
        }
        AppAction::Stop => {
            if !request_stop(app, supervisor, probe) {
                app.set_status_message("server is not running");
            }
        }
        AppAction::Save => match config::save_config(&app.config_path, &app.profile) {
            Ok(()) => {
                app.dirty = false;
                let message = format!("saved {}", app.config_path.display());
                app.set_status_message(message);
            }
            Err(err) => {
                app.set_status_warning_for(format!("save failed: {}", err), Duration::from_secs(5))
            }
        },
        AppAction::Reload => {
            let path = app.config_path.clone();
            match app.profile.reload(&path) {
                Ok(()) => {
                    app.dirty = false;
                    app.clamp_selection();
                    app.set_status_message(format!("reloaded {}", path.display()));
                }
                Err(err) => app.set_status_warning_for(
                    format!("reload failed: {}", err),
                    Duration::from_secs(5),
                ),
            }
        }
        AppAction::CopyCommand => {
            let copied = clipboard::copy_command(&app.profile);
            report_copy(app, copied);
        }
        AppAction::OpenBrowser => {
            let url = app.server_url();
            match open::that_detached(&url) {
                Ok(()) => app.set_status_message(format!("opened {}", url)),
                Err(err) => app.set_status_warning_for(
                    format!("failed to open {}: {}", url, err),
                    Duration::from_secs(3),
                ),
            }
        }
        AppAction::Quit | AppAction::None => {}
    }
}

fn report_copy(app: &mut App, copied: Result<String>) {
    match copied {
        Ok(_) => app.set_status_message("command copied to clipboard"),
        Err(err) => {
            app.set_status_warning_for(format!("copy failed: {}", err), Duration::from_secs(3))
        }
    }
}

fn start_server(
    app: &mut App,
    supervisor: &mut Supervisor,
    probe: &mut Option<JoinHandle<()>>,
    event_tx: &mpsc::Sender<Event>,
    probe_enabled: bool,
) {
    match supervisor.start(&app.profile) {
        Err(err) => {
            app.set_status_warning_for(format!("cannot start: {}", err), Duration::from_secs(4))
        }
        Ok(StartOutcome::AlreadyActive) => app.set_status_message("server is already running"),
        Ok(outcome) => {
            if let Some(argv) = supervisor.command() {
                app.begin_run(&argv.preview());
            }
            app.sync_run(supervisor.state(), supervisor.pid());
            if let StartOutcome::Started { pid } = outcome {
                app.set_status_message(format!("server started (pid {})", pid));
                if probe_enabled {
                    if let Some(old) = probe.take() {
                        old.abort();
                    }
                    *probe = Some(health::spawn_probe(
                        app.server_url(),
                        supervisor.run_id(),
                        event_tx.clone(),
                    ));
                }
            }
        }
    }
}

fn request_stop(
    app: &mut App,
    supervisor: &mut Supervisor,
    probe: &mut Option<JoinHandle<()>>,
) -> bool {
    if !supervisor.stop() {
        return false;
    }
    if let Some(handle) = probe.take() {
        handle.abort();
    }
    app.push_notice("");
    app.push_notice("Stopping server...");
    app.sync_run(supervisor.state(), supervisor.pid());
    true
}

fn spawn_input_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let event = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) if key.kind == KeyEventKind::Press => {
                    Event::Key(key)
                }
                Ok(crossterm::event::Event::Resize(width, height)) => {
                    Event::Resize { width, height }
                }
                _ => continue,
            };
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            loop {
                let signal = tokio::select! {
                    _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
                    _ = sigterm.recv() => ShutdownSignal::Terminate,
                };
                if tx.send(Event::Shutdown { signal }).await.is_err() {
                    break;
                }
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                let event = Event::Shutdown {
                    signal: ShutdownSignal::Interrupt,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
