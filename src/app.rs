//! Application state and UI logic.
//!
//! This module holds the core `App` struct: the editable profile, the server log, what
//! the supervisor last reported, and view state such as scrolling and popups. It also
//! defines how key presses are translated into application actions. Anything that needs
//! the supervisor, the clipboard or the filesystem is returned as an [`AppAction`] for
//! the event loop to carry out.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::command::{build_command, server_url, ValidationError};
use crate::output::{LogBuffer, LogLine};
use crate::settings::Profile;
use crate::supervisor::{OutputListener, RunState};

/// Actions resulting from user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    /// No action required.
    None,
    /// Stop the server if needed and exit.
    Quit,
    /// Launch the server with the current profile.
    Start,
    /// Ask the running server to stop.
    Stop,
    /// Write the profile to the configuration file.
    Save,
    /// Replace the profile with what is saved on disk.
    Reload,
    /// Put the command preview on the clipboard.
    CopyCommand,
    /// Open the server URL in a browser.
    OpenBrowser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

/// The main application state container.
#[derive(Debug)]
pub struct App {
    /// The profile being edited and launched.
    pub profile: Profile,
    /// Where `w` saves the profile.
    pub config_path: PathBuf,
    /// Server output plus our own notices.
    pub logs: LogBuffer,
    /// Run state as of the last supervisor sync.
    pub run_state: RunState,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    /// Whether the health probe has succeeded for the current run.
    pub ready: bool,
    /// Exit code of the last finished run; the inner `None` means killed by a signal.
    pub last_exit: Option<Option<i32>>,
    /// Index into the custom argument list.
    pub selected_arg: usize,
    /// Whether the log view sticks to the newest line.
    pub follow: bool,
    /// First visible log line when not following.
    pub scroll: usize,
    /// Height of the log view area (for scrolling calculations).
    pub log_view_height: usize,
    /// Profile differs from what was last saved or loaded.
    pub dirty: bool,
    pub show_help: bool,
    pub show_preview: bool,
    /// Flag indicating if the application should exit.
    pub should_quit: bool,
    status_message: Option<StatusMessage>,
}

impl App {
    pub fn new(profile: Profile, config_path: PathBuf, max_lines: usize) -> Self {
        Self {
            profile,
            config_path,
            logs: LogBuffer::new(max_lines),
            run_state: RunState::Idle,
            pid: None,
            started_at: None,
            ready: false,
            last_exit: None,
            selected_arg: 0,
            follow: true,
            scroll: 0,
            log_view_height: 0,
            dirty: false,
            show_help: false,
            show_preview: false,
            should_quit: false,
            status_message: None,
        }
    }

    /// The command line the current profile would launch.
    pub fn command_preview(&self) -> Result<String, ValidationError> {
        build_command(&self.profile.settings, &self.profile.custom_args).map(|argv| argv.preview())
    }

    pub fn server_url(&self) -> String {
        server_url(&self.profile.settings)
    }

    /// Resets the log for a new run and writes the command about to be spawned.
    pub fn begin_run(&mut self, preview: &str) {
        self.logs.clear();
        self.scroll = 0;
        self.follow = true;
        self.ready = false;
        self.last_exit = None;
        self.started_at = Some(Instant::now());
        self.push_notice(format!("Starting server with command: {}", preview));
        self.push_notice("");
    }

    /// Copies the supervisor's view of the run into the app.
    pub fn sync_run(&mut self, state: RunState, pid: Option<u32>) {
        self.run_state = state;
        self.pid = pid;
        if !state.is_active() {
            self.started_at = None;
        }
    }

    pub fn on_server_ready(&mut self) {
        if self.ready || !self.run_state.is_active() {
            return;
        }
        self.ready = true;
        let url = self.server_url();
        self.push_notice(format!("Server is ready at {}", url));
        self.set_status_message(format!("Server ready at {}", url));
    }

    pub fn push_notice(&mut self, text: impl Into<String>) {
        self.logs.push(LogLine::notice(text));
    }

    pub fn clear_logs(&mut self) {
        self.logs.clear();
        self.scroll = 0;
        self.follow = true;
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            self.should_quit = true;
            return AppAction::Quit;
        }
        if self.show_preview {
            return self.handle_preview_key(key);
        }
        if self.show_help {
            if matches!(key.code, KeyCode::Esc | KeyCode::Char('?') | KeyCode::Char('q')) {
                self.show_help = false;
            }
            return AppAction::None;
        }
        self.handle_normal_input(key)
    }

    fn handle_preview_key(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Esc | KeyCode::Char('p') | KeyCode::Char('q') | KeyCode::Enter => {
                self.show_preview = false;
                AppAction::None
            }
            KeyCode::Char('c') => AppAction::CopyCommand,
            _ => AppAction::None,
        }
    }

    fn handle_normal_input(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Char('s') => AppAction::Start,
            KeyCode::Char('x') => AppAction::Stop,
            KeyCode::Char('w') => AppAction::Save,
            KeyCode::Char('r') => AppAction::Reload,
            KeyCode::Char('c') => AppAction::CopyCommand,
            KeyCode::Char('o') => AppAction::OpenBrowser,
            KeyCode::Char('p') => {
                self.show_preview = true;
                AppAction::None
            }
            KeyCode::Char('?') => {
                self.show_help = true;
                AppAction::None
            }
            KeyCode::Up => {
                self.selected_arg = self.selected_arg.saturating_sub(1);
                AppAction::None
            }
            KeyCode::Down => {
                if self.selected_arg + 1 < self.profile.custom_args.len() {
                    self.selected_arg += 1;
                }
                AppAction::None
            }
            KeyCode::Char(' ') => {
                self.toggle_selected_arg();
                AppAction::None
            }
            KeyCode::Char('l') => {
                self.clear_logs();
                AppAction::None
            }
            KeyCode::Char('f') => {
                self.follow = !self.follow;
                if self.follow {
                    self.ensure_follow();
                }
                AppAction::None
            }
            KeyCode::PageUp => {
                self.scroll_up(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::PageDown => {
                self.scroll_down(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::Home => {
                self.scroll = 0;
                self.follow = false;
                AppAction::None
            }
            KeyCode::End => {
                self.follow = true;
                self.ensure_follow();
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn toggle_selected_arg(&mut self) {
        let index = self.selected_arg;
        match self.profile.custom_args.toggle(index) {
            Ok(enabled) => {
                self.dirty = true;
                let value = self
                    .profile
                    .custom_args
                    .get(index)
                    .map(|arg| arg.value.clone())
                    .unwrap_or_default();
                let state = if enabled { "enabled" } else { "disabled" };
                self.set_status_message(format!("{} {}", state, value));
            }
            Err(_) => {
                self.set_status_warning_for("no custom argument selected", Duration::from_secs(2))
            }
        }
    }

    /// Keeps the selection inside the custom argument list after it changed size.
    pub fn clamp_selection(&mut self) {
        let len = self.profile.custom_args.len();
        self.selected_arg = self.selected_arg.min(len.saturating_sub(1));
    }

    pub fn scroll_up(&mut self, amount: usize) {
        let max_scroll = self.max_scroll();
        let current = if self.follow { max_scroll } else { self.scroll };
        self.scroll = current.saturating_sub(amount).min(max_scroll);
        self.follow = false;
    }

    pub fn scroll_down(&mut self, amount: usize) {
        let max_scroll = self.max_scroll();
        let current = if self.follow { max_scroll } else { self.scroll };
        let next = (current + amount).min(max_scroll);
        self.scroll = next;
        self.follow = next == max_scroll;
    }

    pub fn ensure_follow(&mut self) {
        self.scroll = self.max_scroll();
    }

    pub fn set_log_view_height(&mut self, height: usize) {
        self.log_view_height = height;
        let max_scroll = self.max_scroll();
        if self.follow {
            self.scroll = max_scroll;
        } else {
            self.scroll = self.scroll.min(max_scroll);
        }
    }

    fn max_scroll(&self) -> usize {
        self.logs.len().saturating_sub(self.log_view_height.max(1))
    }

    pub fn status_line(&self) -> String {
        let state = match (self.run_state, self.last_exit) {
            (RunState::Stopped, Some(Some(code))) => format!("stopped (exit {})", code),
            (state, _) => state.label().to_string(),
        };
        let health = if self.ready {
            "ready"
        } else if self.run_state == RunState::Running {
            "waiting"
        } else {
            "-"
        };
        let pid = self
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into());
        let uptime = self
            .started_at
            .map(|t| format_duration(t.elapsed()))
            .unwrap_or_else(|| "-".into());
        format!(
            "server: {} | health: {} | pid: {} | uptime: {} | lines: {} | follow: {}{}",
            state,
            health,
            pid,
            uptime,
            self.logs.len(),
            if self.follow { "on" } else { "off" },
            if self.dirty { " | unsaved changes" } else { "" }
        )
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        let still_visible = match message.ttl {
            Some(ttl) => message.at.elapsed() < ttl,
            None => true,
        };
        still_visible.then_some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(
            message,
            StatusLevel::Info,
            Some(Duration::from_secs(3)),
        );
    }

    pub fn set_status_warning_for(&mut self, message: impl Into<String>, ttl: Duration) {
        self.set_status_message_with_level(message, StatusLevel::Warning, Some(ttl));
    }

    pub fn set_status_warning_persistent(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Warning, None);
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        level: StatusLevel,
        ttl: Option<Duration>,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }
}

impl OutputListener for App {
    fn on_output_line(&mut self, text: &str) {
        self.logs.push(LogLine::server(text));
    }

    fn on_stopped(&mut self, exit_code: Option<i32>) {
        self.ready = false;
        self.last_exit = Some(exit_code);
        let line = match exit_code {
            Some(0) => "Server stopped.".to_string(),
            Some(code) => format!("Server stopped with exit code {}.", code),
            None => "Server stopped.".to_string(),
        };
        self.push_notice("");
        self.push_notice(line.clone());
        self.set_status_message(line);
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}
