//! Lifecycle of the `llama-server` child process.
//!
//! The [`Supervisor`] owns the run state and the pid of the one child it may have at a
//! time. Each child gets a dedicated reader thread that blocks on the combined
//! stdout/stderr pipe, forwards decoded lines over a channel and finally waits for the
//! exit status. The owning thread drains that channel whenever it likes, which is the
//! only place the run state moves to [`RunState::Stopped`].

use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;

use crate::command::{build_command, ArgumentVector, ValidationError};
use crate::output::decode_line;
use crate::settings::Profile;

/// Lifecycle of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing has been started since the last reset.
    Idle,
    /// Spawning the child.
    Starting,
    /// The child is alive and its output is being relayed.
    Running,
    /// A graceful stop was requested; waiting for the child to exit.
    Stopping,
    /// The child exited or could not be started.
    Stopped,
}

impl RunState {
    pub fn label(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::Stopped => "stopped",
        }
    }

    /// Whether a child process may currently exist.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunState::Starting | RunState::Running | RunState::Stopping
        )
    }
}

/// Messages from the reader thread to the owning thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// One decoded line of combined output.
    Output { run: u64, line: String },
    /// The child is gone. Always the last event of a run.
    Stopped { run: u64, exit_code: Option<i32> },
}

/// Receives relayed output, in order, on the owning thread.
pub trait OutputListener {
    /// Called once per line the child printed.
    fn on_output_line(&mut self, text: &str);
    /// Called exactly once per run when the child has terminated.
    fn on_stopped(&mut self, exit_code: Option<i32>);
}

/// Result of a start request that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// A child already exists; nothing was done.
    AlreadyActive,
    /// The executable could not be launched. The reason was sent to the listener.
    SpawnFailed,
}

/// Starts, watches and stops a single `llama-server` process.
pub struct Supervisor {
    state: RunState,
    run: u64,
    pid: Option<u32>,
    // Set by the reader thread once the child is reaped; its pid may be reused after that.
    exited: Arc<AtomicBool>,
    command: Option<ArgumentVector>,
    event_tx: mpsc::UnboundedSender<SupervisorEvent>,
    event_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            state: RunState::Idle,
            run: 0,
            pid: None,
            exited: Arc::new(AtomicBool::new(false)),
            command: None,
            event_tx,
            event_rx,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    // The pid, as long as the child has not been reaped yet.
    fn signalable_pid(&self) -> Option<u32> {
        if self.exited.load(Ordering::Acquire) {
            None
        } else {
            self.pid
        }
    }

    /// The command line of the current (or last) run.
    pub fn command(&self) -> Option<&ArgumentVector> {
        self.command.as_ref()
    }

    /// Number of the current (or last) run; increments on every launch.
    pub fn run_id(&self) -> u64 {
        self.run
    }

    /// Builds the command from `profile` and launches it.
    ///
    /// Validation errors are returned before anything changes. A request while a child
    /// already exists is ignored.
    pub fn start(&mut self, profile: &Profile) -> Result<StartOutcome, ValidationError> {
        if self.state.is_active() {
            return Ok(StartOutcome::AlreadyActive);
        }
        let argv = build_command(&profile.settings, &profile.custom_args)?;
        Ok(self.launch(&argv))
    }

    /// Launches a prebuilt command line.
    pub fn launch(&mut self, argv: &ArgumentVector) -> StartOutcome {
        if self.state.is_active() {
            tracing::debug!(state = self.state.label(), "start ignored, server already active");
            return StartOutcome::AlreadyActive;
        }
        if self.state == RunState::Stopped {
            self.reset();
        }

        self.run += 1;
        self.state = RunState::Starting;
        self.command = Some(argv.clone());
        self.exited = Arc::new(AtomicBool::new(false));
        let run = self.run;

        let (child, reader) = match spawn_child(argv) {
            Ok(spawned) => spawned,
            Err(err) => {
                let message = spawn_error_message(argv.program(), &err);
                tracing::error!(program = argv.program(), error = %err, "failed to start server");
                self.fail_run(message);
                return StartOutcome::SpawnFailed;
            }
        };

        let pid = child.id();
        let exited = Arc::clone(&self.exited);
        if let Err(err) = spawn_reader(run, child, reader, exited, self.event_tx.clone()) {
            tracing::error!(error = %err, "failed to start output reader");
            send_terminate(pid);
            self.fail_run(format!("error: failed to start output reader: {}", err));
            return StartOutcome::SpawnFailed;
        }

        tracing::info!(pid, run, command = %argv.preview(), "server started");
        self.pid = Some(pid);
        self.state = RunState::Running;
        StartOutcome::Started { pid }
    }

    // A run that never got a reader thread still owes the listener its line and stop.
    fn fail_run(&mut self, message: String) {
        let run = self.run;
        let _ = self.event_tx.send(SupervisorEvent::Output { run, line: message });
        let _ = self.event_tx.send(SupervisorEvent::Stopped {
            run,
            exit_code: None,
        });
        self.pid = None;
        self.state = RunState::Stopped;
    }

    /// Asks the running child to terminate and returns immediately.
    ///
    /// This never kills the process. Returns `false` when there was nothing to stop.
    pub fn stop(&mut self) -> bool {
        if self.state != RunState::Running {
            return false;
        }
        let Some(pid) = self.signalable_pid() else {
            return false;
        };
        tracing::info!(pid, "requesting server shutdown");
        send_terminate(pid);
        self.state = RunState::Stopping;
        true
    }

    /// Kills the child outright. For callers whose own stop deadline has passed.
    pub fn force_kill(&mut self) -> bool {
        if !matches!(self.state, RunState::Running | RunState::Stopping) {
            return false;
        }
        let Some(pid) = self.signalable_pid() else {
            return false;
        };
        tracing::warn!(pid, "killing server");
        send_kill(pid);
        self.state = RunState::Stopping;
        true
    }

    /// Returns a stopped supervisor to [`RunState::Idle`].
    pub fn reset(&mut self) {
        if self.state == RunState::Stopped {
            self.state = RunState::Idle;
            self.pid = None;
        }
    }

    /// Delivers every queued event to `listener` without blocking.
    pub fn drain(&mut self, listener: &mut impl OutputListener) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            self.dispatch(event, listener);
            handled += 1;
        }
        handled
    }

    fn dispatch(&mut self, event: SupervisorEvent, listener: &mut impl OutputListener) {
        match event {
            SupervisorEvent::Output { line, .. } => listener.on_output_line(&line),
            SupervisorEvent::Stopped { run, exit_code } => {
                if run == self.run && self.state != RunState::Idle {
                    tracing::info!(run, ?exit_code, "server stopped");
                    self.state = RunState::Stopped;
                    self.pid = None;
                }
                listener.on_stopped(exit_code);
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.state == RunState::Running {
            if let Some(pid) = self.signalable_pid() {
                send_terminate(pid);
            }
        }
    }
}

fn spawn_error_message(program: &str, err: &io::Error) -> String {
    if err.kind() == io::ErrorKind::NotFound {
        format!(
            "error: '{}' executable not found; make sure it is on PATH or in the working directory",
            program
        )
    } else {
        format!("error: failed to start {}: {}", program, err)
    }
}

// A bare program name is taken from the working directory when present there.
fn resolve_program(program: &str) -> PathBuf {
    let path = Path::new(program);
    if path.components().count() != 1 {
        return path.to_path_buf();
    }
    let local = Path::new(".").join(format!("{}{}", program, std::env::consts::EXE_SUFFIX));
    if local.is_file() {
        local
    } else {
        path.to_path_buf()
    }
}

fn spawn_child(argv: &ArgumentVector) -> io::Result<(Child, io::PipeReader)> {
    let (reader, writer) = io::pipe()?;
    let stderr_writer = writer.try_clone()?;

    let mut command = Command::new(resolve_program(argv.program()));
    command
        .args(argv.args())
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(stderr_writer);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let child = command.spawn()?;
    // Our copies of the write end must close, or the reader never sees end-of-stream.
    drop(command);
    Ok((child, reader))
}

fn spawn_reader(
    run: u64,
    mut child: Child,
    reader: io::PipeReader,
    exited: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("server-output-{}", run))
        .spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = decode_line(std::mem::take(&mut buf));
                        // Keep reading even if nobody listens, so the child never
                        // blocks on a full pipe.
                        let _ = tx.send(SupervisorEvent::Output { run, line });
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::warn!(error = %err, "server output stream failed");
                        break;
                    }
                }
            }
            let exit_code = match child.wait() {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to wait for server exit");
                    None
                }
            };
            exited.store(true, Ordering::Release);
            let _ = tx.send(SupervisorEvent::Stopped { run, exit_code });
        })?;
    Ok(())
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    signal_group(pid, libc::SIGTERM);
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) {
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_terminate(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // CTRL_BREAK is the closest thing Windows has to SIGTERM for console programs.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(windows)]
fn send_kill(pid: u32) {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle != 0 {
            let _ = TerminateProcess(handle, 1);
            let _ = CloseHandle(handle);
        }
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_terminate(_pid: u32) {}

#[cfg(all(not(unix), not(windows)))]
fn send_kill(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        lines: Vec<String>,
        stopped: Vec<Option<i32>>,
    }

    impl OutputListener for Recorder {
        fn on_output_line(&mut self, text: &str) {
            self.lines.push(text.to_string());
        }

        fn on_stopped(&mut self, exit_code: Option<i32>) {
            self.stopped.push(exit_code);
        }
    }

    #[test]
    fn validation_failure_changes_nothing() {
        let mut supervisor = Supervisor::new();
        let mut recorder = Recorder::default();
        let result = supervisor.start(&Profile::default());
        assert_eq!(result, Err(ValidationError::MissingModelPath));
        assert_eq!(supervisor.state(), RunState::Idle);
        assert_eq!(supervisor.drain(&mut recorder), 0);
        assert_eq!(supervisor.run_id(), 0);
    }

    #[test]
    fn missing_executable_reports_one_line_and_stops() {
        let mut supervisor = Supervisor::new();
        let mut recorder = Recorder::default();
        let argv = ArgumentVector::new("llamarack-no-such-server-binary", ["-m", "x.gguf"]);
        assert_eq!(supervisor.launch(&argv), StartOutcome::SpawnFailed);
        assert_eq!(supervisor.state(), RunState::Stopped);

        supervisor.drain(&mut recorder);
        assert_eq!(recorder.lines.len(), 1);
        assert!(recorder.lines[0].contains("not found"), "{:?}", recorder.lines);
        assert_eq!(recorder.stopped, vec![None]);
        assert_eq!(supervisor.state(), RunState::Stopped);
    }

    #[test]
    fn stop_and_stale_stop_requests_are_ignored_when_idle() {
        let mut supervisor = Supervisor::new();
        assert!(!supervisor.stop());
        assert!(!supervisor.force_kill());
        supervisor.reset();
        assert_eq!(supervisor.state(), RunState::Idle);
    }

    #[cfg(unix)]
    mod process {
        use std::time::Duration;

        use super::*;

        fn sh(script: &str) -> ArgumentVector {
            ArgumentVector::new("sh", ["-c", script])
        }

        async fn pump_until<F>(supervisor: &mut Supervisor, recorder: &mut Recorder, mut done: F)
        where
            F: FnMut(&Recorder) -> bool,
        {
            tokio::time::timeout(Duration::from_secs(10), async {
                while !done(recorder) {
                    if supervisor.drain(recorder) == 0 {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            })
            .await
            .expect("timed out waiting for server events");
        }

        #[tokio::test]
        async fn relays_combined_output_in_order_and_stops_once() {
            let mut supervisor = Supervisor::new();
            let mut recorder = Recorder::default();
            let outcome =
                supervisor.launch(&sh("echo one; echo two >&2; printf 'caf\\351\\n'; exit 3"));
            assert!(matches!(outcome, StartOutcome::Started { .. }));
            assert_eq!(supervisor.state(), RunState::Running);

            pump_until(&mut supervisor, &mut recorder, |r| !r.stopped.is_empty()).await;
            assert_eq!(recorder.lines, vec!["one", "two", "café"]);
            assert_eq!(recorder.stopped, vec![Some(3)]);
            assert_eq!(supervisor.state(), RunState::Stopped);
            assert_eq!(supervisor.pid(), None);

            // Nothing else arrives for a finished run.
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(supervisor.drain(&mut recorder), 0);
            assert_eq!(recorder.stopped.len(), 1);
        }

        #[tokio::test]
        async fn reaped_child_is_never_signalled() {
            let mut supervisor = Supervisor::new();
            let mut recorder = Recorder::default();
            let outcome = supervisor.launch(&sh("exit 0"));
            assert!(matches!(outcome, StartOutcome::Started { .. }));

            tokio::time::timeout(Duration::from_secs(10), async {
                while !supervisor.exited.load(Ordering::Acquire) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("child was never reaped");

            // The stop event is still queued, but the pid may already belong to someone else.
            assert_eq!(supervisor.state(), RunState::Running);
            assert!(!supervisor.stop());
            assert!(!supervisor.force_kill());
            assert_eq!(supervisor.state(), RunState::Running);

            pump_until(&mut supervisor, &mut recorder, |r| !r.stopped.is_empty()).await;
            assert_eq!(recorder.stopped, vec![Some(0)]);
            assert_eq!(supervisor.state(), RunState::Stopped);
        }

        #[tokio::test]
        async fn second_start_while_running_is_a_no_op() {
            let mut supervisor = Supervisor::new();
            let mut recorder = Recorder::default();
            let script = sh("echo started; sleep 5");
            let first = supervisor.launch(&script);
            let StartOutcome::Started { pid } = first else {
                panic!("expected a started server, got {:?}", first);
            };
            let run = supervisor.run_id();
            assert_eq!(supervisor.command(), Some(&script));

            assert_eq!(supervisor.launch(&script), StartOutcome::AlreadyActive);
            let mut profile = Profile::default();
            profile.settings.model_path = "model.gguf".to_string();
            assert_eq!(supervisor.start(&profile), Ok(StartOutcome::AlreadyActive));
            assert_eq!(supervisor.state(), RunState::Running);
            assert_eq!(supervisor.pid(), Some(pid));
            assert_eq!(supervisor.run_id(), run);

            assert!(supervisor.stop());
            assert_eq!(supervisor.state(), RunState::Stopping);
            assert!(!supervisor.stop());
            pump_until(&mut supervisor, &mut recorder, |r| !r.stopped.is_empty()).await;
            assert_eq!(recorder.lines, vec!["started"]);
            assert_eq!(recorder.stopped.len(), 1);
            assert_eq!(supervisor.state(), RunState::Stopped);
        }

        #[tokio::test]
        async fn stop_sends_a_graceful_terminate() {
            let mut supervisor = Supervisor::new();
            let mut recorder = Recorder::default();
            supervisor.launch(&sh(
                "trap 'echo bye; exit 0' TERM; echo ready; while true; do sleep 0.1; done",
            ));
            pump_until(&mut supervisor, &mut recorder, |r| {
                r.lines.iter().any(|l| l == "ready")
            })
            .await;

            assert!(supervisor.stop());
            pump_until(&mut supervisor, &mut recorder, |r| !r.stopped.is_empty()).await;
            assert_eq!(recorder.lines.last().map(String::as_str), Some("bye"));
            assert_eq!(recorder.stopped, vec![Some(0)]);
            assert_eq!(supervisor.state(), RunState::Stopped);
        }

        #[tokio::test]
        async fn ignored_stop_can_be_escalated_by_the_caller() {
            let mut supervisor = Supervisor::new();
            let mut recorder = Recorder::default();
            supervisor.launch(&sh("trap '' TERM; echo ready; while true; do sleep 0.1; done"));
            pump_until(&mut supervisor, &mut recorder, |r| !r.lines.is_empty()).await;

            assert!(supervisor.stop());
            tokio::time::sleep(Duration::from_millis(300)).await;
            supervisor.drain(&mut recorder);
            assert_eq!(supervisor.state(), RunState::Stopping);
            assert!(recorder.stopped.is_empty());

            assert!(supervisor.force_kill());
            pump_until(&mut supervisor, &mut recorder, |r| !r.stopped.is_empty()).await;
            // Killed by a signal, so there is no exit code.
            assert_eq!(recorder.stopped, vec![None]);
            assert_eq!(supervisor.state(), RunState::Stopped);
        }

        #[tokio::test]
        async fn stale_events_do_not_touch_the_new_run() {
            let mut supervisor = Supervisor::new();
            let mut recorder = Recorder::default();
            let missing =
                ArgumentVector::new("llamarack-no-such-server-binary", Vec::<String>::new());
            assert_eq!(supervisor.launch(&missing), StartOutcome::SpawnFailed);

            let outcome = supervisor.launch(&sh("sleep 5"));
            assert!(matches!(outcome, StartOutcome::Started { .. }));
            supervisor.drain(&mut recorder);
            assert_eq!(recorder.stopped, vec![None]);
            assert_eq!(supervisor.state(), RunState::Running);

            supervisor.stop();
            pump_until(&mut supervisor, &mut recorder, |r| r.stopped.len() == 2).await;
            assert_eq!(supervisor.state(), RunState::Stopped);
            supervisor.reset();
            assert_eq!(supervisor.state(), RunState::Idle);
        }
    }
}
