//! Runs the provisioning shell and relays its output.
//!
//! Each output stream of the child is read line by line on its own thread.
//! Lines are funnelled through a channel into a single writer loop on the
//! calling thread, which ends once both streams are closed. The child is
//! then reaped and its exit status reported.

use crate::request::{ProvisionRequest, NIX_SHELL};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;

/// Exit code reported when the provisioning tool could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Which output stream of the child a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn prefix(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// One line of child output, without its line terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Something observed while the provisioning shell runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionEvent {
    Output(OutputLine),
    /// The child terminated; `None` when it was killed by a signal
    Exited(Option<i32>),
}

/// Callback receiving provisioning events as they happen
pub type OutputCallback = Box<dyn FnMut(&ProvisionEvent)>;

/// How a provisioning run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Success,
    /// Non-zero exit code, or `None` when terminated by a signal
    Failed(Option<i32>),
    /// The provisioning tool could not be started
    SpawnError(String),
}

impl ProvisionOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            ProvisionOutcome::Success
        } else {
            ProvisionOutcome::Failed(status.code())
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProvisionOutcome::Success)
    }

    /// Exit status for the hook process itself
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionOutcome::Success => 0,
            ProvisionOutcome::Failed(Some(code)) if *code != 0 => *code,
            ProvisionOutcome::Failed(_) => 1,
            ProvisionOutcome::SpawnError(_) => SPAWN_FAILURE_EXIT_CODE,
        }
    }
}

/// Starts the provisioning process for a request.
///
/// Implementations must pipe stdout and stderr and leave the working
/// directory and environment inherited from the parent.
pub trait Launcher {
    fn launch(&self, request: &ProvisionRequest) -> io::Result<Child>;
}

/// Launches `nix-shell` (or a replacement binary)
#[derive(Debug, Clone)]
pub struct NixShell {
    program: PathBuf,
}

impl NixShell {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for NixShell {
    fn default() -> Self {
        Self::new(NIX_SHELL)
    }
}

impl Launcher for NixShell {
    fn launch(&self, request: &ProvisionRequest) -> io::Result<Child> {
        let program = which::which(&self.program).map_err(|e| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found: {}", self.program.display(), e),
            )
        })?;

        log::debug!("Executing {} with {:?}", program.display(), request.shell_args());

        Command::new(program)
            .args(request.shell_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

/// Routes events to the callback, or to the console when there is none
struct OutputReporter {
    callback: Option<OutputCallback>,
}

impl OutputReporter {
    fn new(callback: Option<OutputCallback>) -> Self {
        Self { callback }
    }

    fn report(&mut self, event: &ProvisionEvent) {
        match self.callback {
            Some(ref mut cb) => cb(event),
            None => print_event(event),
        }
    }
}

/// Writes the console form of a provisioning event
pub fn write_event<W: Write>(out: &mut W, event: &ProvisionEvent) -> io::Result<()> {
    match event {
        ProvisionEvent::Output(line) => writeln!(out, "{}: {}", line.stream.prefix(), line.text),
        ProvisionEvent::Exited(Some(code)) => {
            writeln!(out, "child process exited with code {}", code)
        }
        ProvisionEvent::Exited(None) => writeln!(out, "child process terminated by signal"),
    }
}

/// Prints a provisioning event to stdout.
///
/// A closed stdout (the package manager went away) is not fatal.
pub fn print_event(event: &ProvisionEvent) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = write_event(&mut out, event).and_then(|_| out.flush()) {
        log::debug!("Could not write provisioning output: {}", e);
    }
}

/// Reads `reader` line by line and sends each line down `tx`
fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<OutputLine>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(|c: char| c == '\n' || c == '\r')
                        .to_string();
                    if tx.send(OutputLine { stream, text }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("Stopped reading {}: {}", stream.prefix(), e);
                    break;
                }
            }
        }
    })
}

/// Provisions with console output
pub fn provision(launcher: &dyn Launcher, request: ProvisionRequest) -> ProvisionOutcome {
    provision_with_output(launcher, request, None)
}

/// Provisions, delivering output lines and the exit event to `callback`.
///
/// Blocks until the child has terminated. There is no timeout.
pub fn provision_with_output(
    launcher: &dyn Launcher,
    request: ProvisionRequest,
    callback: Option<OutputCallback>,
) -> ProvisionOutcome {
    let mut reporter = OutputReporter::new(callback);

    let mut child = match launcher.launch(&request) {
        Ok(child) => child,
        Err(e) => {
            log::error!("Failed to launch provisioning shell: {}", e);
            return ProvisionOutcome::SpawnError(e.to_string());
        }
    };
    log::debug!("Provisioning shell started (pid {})", child.id());

    let (tx, rx) = mpsc::channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(stdout, Stream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(stderr, Stream::Stderr, tx.clone()));
    }
    drop(tx);

    // Ends when every reader has hit EOF and dropped its sender
    for line in rx {
        reporter.report(&ProvisionEvent::Output(line));
    }
    for reader in readers {
        if reader.join().is_err() {
            log::warn!("Output reader thread panicked");
        }
    }

    match child.wait() {
        Ok(status) => {
            reporter.report(&ProvisionEvent::Exited(status.code()));
            let outcome = ProvisionOutcome::from_status(status);
            if !outcome.is_success() {
                log::error!("Provisioning failed: {}", status);
            }
            outcome
        }
        Err(e) => {
            log::error!("Failed to wait for provisioning shell: {}", e);
            ProvisionOutcome::Failed(None)
        }
    }
}
