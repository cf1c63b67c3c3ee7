//! Process handle: one interactive process attached to a pseudo-terminal
//!
//! A dedicated reader thread pumps PTY output into a tokio channel and, once
//! the terminal closes, reaps the child and records its exit status. Every
//! blocking call on the handle takes a timeout and is additionally clamped by
//! the handle's overall deadline. Dropping the handle kills the process.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use regex::bytes::Regex;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use arbor_core::{ArborError, Result};

const READ_BUF_BYTES: usize = 4096;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// What to launch and how
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Overall deadline for the handle; every blocking call is clamped to it
    pub timeout: Duration,
    pub rows: u16,
    pub cols: u16,
    /// Let the terminal echo typed input back into the output
    pub echo: bool,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            rows: 24,
            cols: 200,
            echo: false,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Human-readable command line (for logs)
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Something to wait for in the output stream
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    pub fn regex(expr: &str) -> Result<Self> {
        Regex::new(expr)
            .map(Self::Regex)
            .map_err(|e| ArborError::Config(format!("invalid pattern {:?}: {}", expr, e)))
    }

    /// Byte range of the first occurrence in `haystack`
    pub fn find(&self, haystack: &[u8]) -> Option<(usize, usize)> {
        match self {
            Self::Literal(text) => {
                let needle = text.as_bytes();
                if needle.is_empty() {
                    return Some((0, 0));
                }
                haystack
                    .windows(needle.len())
                    .position(|w| w == needle)
                    .map(|start| (start, start + needle.len()))
            }
            Self::Regex(re) => re.find(haystack).map(|m| (m.start(), m.end())),
        }
    }
}

/// Where one of several patterns matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

/// Earliest match among `patterns`; on equal start the lower index wins
pub fn find_earliest(patterns: &[Pattern], haystack: &[u8]) -> Option<PatternMatch> {
    let mut best: Option<PatternMatch> = None;
    for (index, pattern) in patterns.iter().enumerate() {
        if let Some((start, end)) = pattern.find(haystack) {
            if best.map_or(true, |b| start < b.start) {
                best = Some(PatternMatch { index, start, end });
            }
        }
    }
    best
}

/// Exit status of a reaped process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: u32,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    Timeout,
    /// Terminal closed; exit status if the child could be reaped
    Eof(Option<ExitInfo>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectOutcome {
    Matched {
        index: usize,
        before: String,
        matched: String,
    },
    Timeout,
    Eof {
        exit: Option<ExitInfo>,
    },
}

/// Handle to one PTY-attached process
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    _master: Box<dyn MasterPty + Send>,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    exit: Arc<Mutex<Option<ExitInfo>>>,
    /// Received but not yet consumed by a read or a match
    pending: Vec<u8>,
    transcript: Vec<u8>,
    eof: bool,
    terminated: bool,
    deadline: Instant,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("eof", &self.eof)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl ProcessHandle {
    /// Launch `spec` under a fresh pseudo-terminal
    ///
    /// Any failure here is an [`ArborError::Spawn`]: the binary is missing,
    /// not executable, or the PTY could not be allocated.
    #[instrument(skip(spec), fields(program = %spec.program))]
    pub fn spawn(spec: &ProcessSpec) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ArborError::Spawn(format!("failed to open pty: {}", e)))?;

        // Before the child starts, so none of its input is echoed
        if !spec.echo {
            if let Err(e) = disable_echo(pair.master.as_ref()) {
                warn!("Could not turn off echo for {}: {}", spec.program, e);
            }
        }

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.workdir {
            cmd.cwd(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ArborError::Spawn(format!("{}: {}", spec.command_line(), e)))?;
        // The child holds the only slave end now, so EOF follows its exit
        drop(pair.slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();

        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| pair.master.take_writer().map(|writer| (reader, writer)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = killer.kill();
                return Err(ArborError::Spawn(format!("failed to attach pty: {}", e)));
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let exit = Arc::new(Mutex::new(None));
        let exit_slot = Arc::clone(&exit);
        let pumped = std::thread::Builder::new()
            .name(format!("arbor-pty-{}", pid.unwrap_or_default()))
            .spawn(move || pump(reader, child, tx, exit_slot));
        if let Err(e) = pumped {
            let _ = killer.kill();
            return Err(ArborError::Spawn(format!("failed to start pty reader: {}", e)));
        }

        debug!("Spawned {} (pid {:?})", spec.command_line(), pid);

        Ok(Self {
            program: spec.program.clone(),
            pid,
            writer,
            killer,
            _master: pair.master,
            output: rx,
            exit,
            pending: Vec::new(),
            transcript: Vec::new(),
            eof: false,
            terminated: false,
            deadline: Instant::now() + spec.timeout,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Everything the process has written so far
    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the terminal has closed
    pub fn is_finished(&self) -> bool {
        self.eof
    }

    /// Time left before the handle's overall deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn send(&mut self, text: &str) -> Result<()> {
        if self.eof || self.terminated {
            return Err(ArborError::ProcessCrash(format!(
                "{} is no longer running",
                self.program
            )));
        }
        self.writer.write_all(text.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn send_line(&mut self, text: &str) -> Result<()> {
        self.send(&format!("{}\n", text))
    }

    /// Next chunk of output, or whatever is already buffered
    pub async fn read_chunk(&mut self, timeout: Duration) -> ReadOutcome {
        if !self.pending.is_empty() {
            return ReadOutcome::Data(std::mem::take(&mut self.pending));
        }
        if self.eof {
            return ReadOutcome::Eof(self.exit_status());
        }

        let wait = timeout.min(self.remaining());
        match tokio::time::timeout(wait, self.output.recv()).await {
            Ok(Some(chunk)) => {
                self.transcript.extend_from_slice(&chunk);
                ReadOutcome::Data(chunk)
            }
            Ok(None) => {
                self.eof = true;
                ReadOutcome::Eof(self.exit_status())
            }
            Err(_) => ReadOutcome::Timeout,
        }
    }

    /// Wait until one of `patterns` shows up in the output
    ///
    /// Output up to and including the match is consumed; anything after it
    /// stays buffered for the next call.
    pub async fn await_pattern(&mut self, patterns: &[Pattern], timeout: Duration) -> ExpectOutcome {
        let until = Instant::now() + timeout.min(self.remaining());
        loop {
            if let Some(found) = find_earliest(patterns, &self.pending) {
                let rest = self.pending.split_off(found.end);
                let matched = self.pending.split_off(found.start);
                let before = std::mem::replace(&mut self.pending, rest);
                return ExpectOutcome::Matched {
                    index: found.index,
                    before: String::from_utf8_lossy(&before).into_owned(),
                    matched: String::from_utf8_lossy(&matched).into_owned(),
                };
            }
            if self.eof {
                return ExpectOutcome::Eof {
                    exit: self.exit_status(),
                };
            }

            let now = Instant::now();
            if now >= until {
                return ExpectOutcome::Timeout;
            }
            match tokio::time::timeout(until - now, self.output.recv()).await {
                Ok(Some(chunk)) => {
                    self.transcript.extend_from_slice(&chunk);
                    self.pending.extend_from_slice(&chunk);
                }
                Ok(None) => self.eof = true,
                Err(_) => return ExpectOutcome::Timeout,
            }
        }
    }

    /// Drain output until the process exits or `timeout` passes
    pub async fn wait(&mut self, timeout: Duration) -> Option<ExitInfo> {
        let until = Instant::now() + timeout;
        while !self.eof {
            let now = Instant::now();
            if now >= until {
                return None;
            }
            match tokio::time::timeout(until - now, self.output.recv()).await {
                Ok(Some(chunk)) => {
                    self.transcript.extend_from_slice(&chunk);
                    self.pending.extend_from_slice(&chunk);
                }
                Ok(None) => self.eof = true,
                Err(_) => return None,
            }
        }
        self.exit_status()
    }

    /// Kill the process; the reader thread reaps it
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if self.eof && self.exit_status().is_some() {
            return;
        }
        match self.killer.kill() {
            Ok(()) => debug!("Terminated {} (pid {:?})", self.program, self.pid),
            Err(e) => debug!("Kill of {} failed, probably already gone: {}", self.program, e),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Clear ECHO on the terminal behind `master`
#[cfg(unix)]
fn disable_echo(master: &(dyn MasterPty + Send)) -> std::io::Result<()> {
    let Some(fd) = master.as_raw_fd() else {
        return Ok(());
    };
    // SAFETY: `fd` is the open master descriptor owned by `master`, and
    // `termios` is filled in by tcgetattr before it is read.
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        termios.c_lflag &= !(libc::ECHO | libc::ECHONL);
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn disable_echo(_master: &(dyn MasterPty + Send)) -> std::io::Result<()> {
    Ok(())
}

/// Reader thread body: forward output, then reap the child
fn pump(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    exit: Arc<Mutex<Option<ExitInfo>>>,
) {
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the slave side is gone
            Err(_) => break,
        }
    }

    let info = match child.wait() {
        Ok(status) => Some(ExitInfo {
            code: status.exit_code(),
            success: status.success(),
        }),
        Err(e) => {
            warn!("Failed to reap child process: {}", e);
            None
        }
    };
    *exit.lock().unwrap_or_else(|e| e.into_inner()) = info;
    drop(tx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_earliest_match_wins() {
        let patterns = vec![Pattern::literal("beta"), Pattern::literal("alpha")];
        let found = find_earliest(&patterns, b"xx alpha beta").unwrap();
        assert_eq!(found.index, 1);
        assert_eq!((found.start, found.end), (3, 8));
    }

    #[test]
    fn test_tie_goes_to_lower_index() {
        let patterns = vec![Pattern::regex(r"a.p").unwrap(), Pattern::literal("alp")];
        let found = find_earliest(&patterns, b"alpha").unwrap();
        assert_eq!(found.index, 0);
    }

    #[test]
    fn test_bad_regex_is_config_error() {
        assert!(matches!(Pattern::regex("(unclosed"), Err(ArborError::Config(_))));
    }

    #[test]
    fn test_command_line() {
        let spec = ProcessSpec::new("sh").with_args(["-c", "true"]);
        assert_eq!(spec.command_line(), "sh -c true");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_expect_output() {
        let spec = ProcessSpec::new("/bin/sh").with_args(["-c", "printf 'alpha beta\\n'"]);
        let mut handle = ProcessHandle::spawn(&spec).unwrap();

        let patterns = vec![Pattern::literal("beta"), Pattern::literal("alpha")];
        match handle.await_pattern(&patterns, Duration::from_secs(5)).await {
            ExpectOutcome::Matched { index, matched, .. } => {
                assert_eq!(index, 1);
                assert_eq!(matched, "alpha");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The rest of the line is still buffered
        match handle
            .await_pattern(&[Pattern::literal("beta")], Duration::from_secs(5))
            .await
        {
            ExpectOutcome::Matched { before, .. } => assert_eq!(before, " "),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_line_round_trip() {
        let spec = ProcessSpec::new("/bin/sh").with_args(["-c", "read x; echo got:$x"]);
        let mut handle = ProcessHandle::spawn(&spec).unwrap();
        handle.send_line("abc").unwrap();

        let outcome = handle
            .await_pattern(&[Pattern::literal("got:abc")], Duration::from_secs(5))
            .await;
        assert!(matches!(outcome, ExpectOutcome::Matched { index: 0, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_eof_reports_exit_code() {
        let spec = ProcessSpec::new("/bin/sh").with_args(["-c", "exit 3"]);
        let mut handle = ProcessHandle::spawn(&spec).unwrap();

        let outcome = handle
            .await_pattern(&[Pattern::literal("never")], Duration::from_secs(5))
            .await;
        assert_eq!(
            outcome,
            ExpectOutcome::Eof {
                exit: Some(ExitInfo {
                    code: 3,
                    success: false
                })
            }
        );
        assert!(handle.send("late").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_then_terminate() {
        let spec = ProcessSpec::new("sleep").with_arg("30");
        let mut handle = ProcessHandle::spawn(&spec).unwrap();

        let outcome = handle
            .await_pattern(&[Pattern::literal("never")], Duration::from_millis(200))
            .await;
        assert_eq!(outcome, ExpectOutcome::Timeout);
        assert_eq!(handle.read_chunk(Duration::from_millis(50)).await, ReadOutcome::Timeout);

        handle.terminate();
        handle.wait(Duration::from_secs(5)).await;
        assert!(handle.is_finished());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deadline_clamps_waits() {
        let spec = ProcessSpec::new("sleep")
            .with_arg("30")
            .with_timeout(Duration::from_millis(100));
        let mut handle = ProcessHandle::spawn(&spec).unwrap();

        let started = std::time::Instant::now();
        let outcome = handle
            .await_pattern(&[Pattern::literal("never")], Duration::from_secs(30))
            .await;
        assert_eq!(outcome, ExpectOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(handle.is_expired());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_typed_input_not_echoed() {
        let spec = ProcessSpec::new("/bin/sh").with_args(["-c", "read x; echo got"]);
        let mut handle = ProcessHandle::spawn(&spec).unwrap();
        handle.send_line("secret-word").unwrap();

        handle.wait(Duration::from_secs(5)).await;
        let transcript = String::from_utf8_lossy(handle.transcript()).into_owned();
        assert!(transcript.contains("got"));
        assert!(!transcript.contains("secret-word"));
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let spec = ProcessSpec::new("/nonexistent/arbor-test-binary");
        let err = ProcessHandle::spawn(&spec).unwrap_err();
        assert!(matches!(err, ArborError::Spawn(_)));
    }
}
