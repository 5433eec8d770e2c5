//! External console process runner.
//!
//! A [`ManagedProcess`] wraps one invocation of an external program: it spawns
//! the program with redirected stdio, optionally feeds it input, collects its
//! stdout and stderr lines into a single ordered log, and enforces a wait
//! timeout after which the program is killed.
//!
//! Failures never cross this boundary as errors. They are logged and reported
//! through the boolean results, the [`ProcessState`] and the [`ProcessOutcome`].

mod args;

pub use args::split_arguments;

use std::process::Stdio;
use std::time::Duration;

use log::{debug, error, trace};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default timeout of a plain [`ManagedProcess::wait_for_exit`].
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout of [`ManagedProcess::wait_for_success_exit`].
pub const DEFAULT_SUCCESS_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for draining the output readers once the process is gone.
/// A grandchild holding the pipes open must not stall the caller.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound for reaping a killed process.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

/// Lifecycle of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created and can be started.
    Initialized,
    /// Spawned and not yet waited for.
    Running,
    /// Exited, killed, or never launched.
    Finished,
}

/// How the last run of a managed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Not finished yet.
    Pending,
    /// Exited on its own with this code.
    Exited(i32),
    /// Exited on its own without an exit code (terminated by a signal).
    Terminated,
    /// Did not exit within the timeout and was killed.
    TimedOut,
    /// Could not be spawned.
    LaunchFailed,
    /// Waiting for the process failed and it was killed.
    WaitFailed,
}

/// One invocation of an external console program.
pub struct ManagedProcess {
    executable: String,
    arguments: String,
    /// Shown instead of `arguments` in logs and errors.
    display_arguments: Option<String>,
    input: Option<Vec<u8>>,
    output: Vec<String>,
    exit_code: Option<i32>,
    state: ProcessState,
    outcome: ProcessOutcome,
    child: Option<Child>,
    output_rx: Option<mpsc::UnboundedReceiver<String>>,
    readers: Vec<JoinHandle<()>>,
    input_writer: Option<JoinHandle<std::io::Result<()>>>,
}

impl ManagedProcess {
    /// Create a process for `executable` (resolved through `PATH` unless it is
    /// a path) with a pre-joined, pre-quoted argument string.
    pub fn new(executable: impl Into<String>, arguments: impl Into<String>) -> Self {
        let executable = executable.into();
        let arguments = arguments.into();
        trace!("(executable:'{}')", executable);

        Self {
            executable,
            arguments,
            display_arguments: None,
            input: None,
            output: Vec::new(),
            exit_code: None,
            state: ProcessState::Initialized,
            outcome: ProcessOutcome::Pending,
            child: None,
            output_rx: None,
            readers: Vec::new(),
            input_writer: None,
        }
    }

    /// Arguments to show in logs and errors instead of the real ones, for
    /// command lines that carry secrets.
    pub fn with_display_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.display_arguments = Some(arguments.into());
        self
    }

    /// Bytes written to the program's stdin right after it starts.
    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Lines written to the program's stdin, joined with the platform newline.
    pub fn with_input_lines<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = lines
            .into_iter()
            .map(|line| line.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(LINE_ENDING);
        self.with_input(joined.into_bytes())
    }

    /// Spawn the process.
    ///
    /// Returns `true` once the process runs. Returns `false` if it could not be
    /// launched; the state is then [`ProcessState::Finished`] with no exit code.
    ///
    /// The input is written by a background task, so a program that never
    /// reads its stdin does not block the caller. The task is joined when the
    /// process is waited for.
    pub async fn start(&mut self) -> bool {
        trace!("()");

        if self.state != ProcessState::Initialized {
            debug!("Process '{}' has already been started.", self.command_line());
            trace!("(-)[ALREADY_STARTED]:false");
            return false;
        }

        self.output.clear();

        debug!("Starting process '{}'...", self.command_line());
        let mut child = match self.build_command().spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Unable to start process '{}': {}", self.command_line(), e);
                self.finish(ProcessOutcome::LaunchFailed);
                trace!("(-)[SPAWN_FAILED]:false");
                return false;
            }
        };

        self.state = ProcessState::Running;
        debug!("Process is running (pid {:?}).", child.id());

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            self.readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers.push(spawn_line_reader(stderr, tx.clone()));
        }
        drop(tx);
        self.output_rx = Some(rx);

        if let Some(stdin) = child.stdin.take() {
            self.input_writer = Some(tokio::spawn(write_input(stdin, self.input.clone())));
        }
        self.child = Some(child);

        trace!("(-):true");
        true
    }

    /// Wait for the process to exit.
    ///
    /// Returns `true` if the process exited within `timeout`. Otherwise the
    /// process is killed and `false` is returned. Returns `false` right away if
    /// the process is not running. The state is [`ProcessState::Finished`]
    /// afterwards.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        trace!("(timeout:{:?})", timeout);

        if self.state != ProcessState::Running {
            trace!("(-)[NOT_RUNNING]:false");
            return false;
        }

        let outcome = match self.child.as_mut() {
            Some(child) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => match status.code() {
                    Some(code) => ProcessOutcome::Exited(code),
                    None => ProcessOutcome::Terminated,
                },
                Ok(Err(e)) => {
                    error!("Waiting for process '{}' failed: {}", self.command_line(), e);
                    ProcessOutcome::WaitFailed
                }
                Err(_) => {
                    debug!(
                        "Process '{}' did not exit within {:?}.",
                        self.command_line(),
                        timeout
                    );
                    ProcessOutcome::TimedOut
                }
            },
            None => ProcessOutcome::WaitFailed,
        };

        let res = matches!(
            outcome,
            ProcessOutcome::Exited(_) | ProcessOutcome::Terminated
        );
        if !res {
            self.kill().await;
        }
        if let ProcessOutcome::Exited(code) = outcome {
            self.exit_code = Some(code);
        }

        self.collect_output().await;
        self.finish(outcome);

        trace!("(-):{}", res);
        res
    }

    /// Wait for the process to exit with code 0.
    ///
    /// On a non-zero exit the captured output is logged.
    pub async fn wait_for_success_exit(&mut self, timeout: Duration) -> bool {
        if !self.wait_for_exit(timeout).await {
            return false;
        }

        let res = self.has_success_exit_code();
        if !res {
            debug!(
                "Process exit code was {:?}, its output follows:\n---------------------------------\n{}\n---------------------------------",
                self.exit_code,
                self.output.join("\n")
            );
        }
        res
    }

    /// Start the process and wait for it to exit with code 0.
    pub async fn run_and_wait_for_success_exit(&mut self, timeout: Duration) -> bool {
        self.start().await && self.wait_for_success_exit(timeout).await
    }

    /// Forcibly terminate the process. Errors are ignored, the process may
    /// have exited already.
    pub async fn kill(&mut self) {
        trace!("()");

        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                trace!("Kill failed: {}", e);
            }
            if tokio::time::timeout(KILL_REAP_TIMEOUT, child.wait())
                .await
                .is_err()
            {
                error!(
                    "Process '{}' did not terminate after kill.",
                    self.command_line()
                );
            }
        }

        trace!("(-)");
    }

    /// Captured stdout and stderr lines in arrival order, without line endings.
    /// Complete only once the process is [`ProcessState::Finished`].
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Exit code, if the process exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn has_success_exit_code(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn outcome(&self) -> ProcessOutcome {
        self.outcome
    }

    /// OS process id while the process runs.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Executable followed by its arguments, for diagnostics. Uses the
    /// display arguments if they were set.
    pub fn command_line(&self) -> String {
        let arguments = self.display_arguments.as_deref().unwrap_or(&self.arguments);
        if arguments.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, arguments)
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);

        #[cfg(windows)]
        {
            if !self.arguments.is_empty() {
                cmd.raw_arg(&self.arguments);
            }
        }

        #[cfg(not(windows))]
        {
            cmd.args(split_arguments(&self.arguments));
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Join the input writer and the output readers and move everything the
    /// readers delivered into the log.
    async fn collect_output(&mut self) {
        let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_TIMEOUT;

        if let Some(mut writer) = self.input_writer.take() {
            match tokio::time::timeout_at(deadline, &mut writer).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    trace!("Process finished before reading all of its input.");
                }
                Ok(Ok(Err(e))) => error!(
                    "Unable to write input to process '{}': {}",
                    self.command_line(),
                    e
                ),
                Ok(Err(e)) => error!("Input writer task failed: {}", e),
                Err(_) => {
                    debug!("Input writer did not finish on time, abandoning it.");
                    writer.abort();
                }
            }
        }

        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                debug!("Output reader did not finish on time, abandoning it.");
                reader.abort();
            }
        }

        if let Some(mut rx) = self.output_rx.take() {
            while let Ok(line) = rx.try_recv() {
                self.output.push(line);
            }
        }
    }

    fn finish(&mut self, outcome: ProcessOutcome) {
        self.child = None;
        self.outcome = outcome;
        self.state = ProcessState::Finished;
    }
}

/// Write the input (if any) and close stdin so the program sees EOF.
async fn write_input(mut stdin: ChildStdin, input: Option<Vec<u8>>) -> std::io::Result<()> {
    if let Some(data) = input.filter(|data| !data.is_empty()) {
        stdin.write_all(&data).await?;
        stdin.flush().await?;
    }
    stdin.shutdown().await
}

/// Forward every line of `reader` into the shared output channel.
fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    trace!("Output stream closed: {}", e);
                    break;
                }
            }
        }
    })
}
