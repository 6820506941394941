// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rich session event-log machinery: the append-only `events.ndjson`
//! tailer, the replay filter, and the `prompt.fifo` write path.
//!
//! The AI CLI owns the log file; we only ever read it. Tailing is the
//! union of a `notify` filesystem watch and a low-rate poll so editors
//! or CLIs that rename-rotate don't lose updates.

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::sys::stat::Mode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Layout of a rich session's on-disk state under `DATA_DIR/rich/<name>/`.
#[derive(Debug, Clone)]
pub struct RichDir {
    dir: PathBuf,
}

impl RichDir {
    pub fn new(data_dir: &Path, session_name: &str) -> Self {
        Self { dir: data_dir.join("rich").join(session_name) }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join("events.ndjson")
    }

    pub fn fifo_path(&self) -> PathBuf {
        self.dir.join("prompt.fifo")
    }

    /// Create the directory and the prompt FIFO if missing.
    pub fn ensure(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let fifo = self.fifo_path();
        if !fifo.exists() {
            match nix::unistd::mkfifo(&fifo, Mode::from_bits_truncate(0o600)) {
                Ok(()) | Err(Errno::EEXIST) => {}
                Err(e) => return Err(anyhow::Error::new(e).context("mkfifo failed")),
            }
        }
        Ok(())
    }
}

/// Extract the `type` field of an event line.
pub fn event_type(event: &serde_json::Value) -> Option<&str> {
    event.get("type").and_then(|t| t.as_str())
}

/// Per-connection filter deciding which event lines reach a browser.
///
/// `stream_event` records never pass. Of `system`/`init` records, only the
/// first one on the connection passes; the AI CLI re-emits init blocks on
/// restart and browsers must not re-initialize mid-stream.
#[derive(Debug, Default)]
pub struct EventFilter {
    init_seen: bool,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, event: &serde_json::Value) -> bool {
        match event_type(event) {
            Some("stream_event") => false,
            Some("system") => {
                let is_init =
                    event.get("subtype").and_then(|s| s.as_str()) == Some("init");
                if is_init {
                    if self.init_seen {
                        return false;
                    }
                    self.init_seen = true;
                }
                true
            }
            _ => true,
        }
    }
}

/// Tails newline-delimited JSON appended to a log file after a tracked
/// byte offset. Partial final lines are held until the newline arrives.
pub struct EventTail {
    path: PathBuf,
    offset: u64,
    poll_interval: Duration,
}

impl EventTail {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: 0, poll_interval: Duration::from_millis(500) }
    }

    /// Start reading from a specific byte offset (fork replay, reconnect).
    pub fn with_offset(path: PathBuf, offset: u64) -> Self {
        Self { path, offset, poll_interval: Duration::from_millis(500) }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Current byte offset into the log file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read new complete lines appended since the last read.
    ///
    /// The offset only ever advances past newline-terminated lines, so a
    /// partially-written final line is re-read (whole) on the next call.
    pub fn read_new_lines(&mut self) -> anyhow::Result<Vec<String>> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        // Truncation (e.g. a log rewrite): re-read from the beginning.
        if let Ok(meta) = file.metadata() {
            if meta.len() < self.offset {
                self.offset = 0;
            }
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = String::new();
        file.read_to_string(&mut chunk)?;

        let mut lines = Vec::new();
        let mut consumed = 0usize;
        for segment in chunk.split_inclusive('\n') {
            if !segment.ends_with('\n') {
                break;
            }
            consumed += segment.len();
            let trimmed = segment.trim_end();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_owned());
            }
        }
        self.offset += consumed as u64;

        Ok(lines)
    }

    /// Watch the file, sending batches of new lines to `line_tx`.
    ///
    /// Wakes on filesystem events and on a poll tick; runs until the
    /// token is cancelled or the receiver goes away. Read errors are
    /// retried on the next wake.
    pub async fn run(mut self, line_tx: mpsc::Sender<Vec<String>>, shutdown: CancellationToken) {
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let _watcher = self.setup_notify_watcher(wake_tx);

        let mut poll = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake_rx.recv() => {}
                _ = poll.tick() => {}
            }

            match self.read_new_lines() {
                Ok(lines) if !lines.is_empty() => {
                    // Bounded channel: a slow consumer suspends the tail
                    // here rather than dropping events.
                    if line_tx.send(lines).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(path = %self.path.display(), err = %e, "event tail read failed");
                }
            }
        }
    }

    /// Watch the parent directory so file creation is detected too.
    fn setup_notify_watcher(
        &self,
        wake_tx: mpsc::Sender<()>,
    ) -> Option<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};

        let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
            let _ = wake_tx.try_send(());
        })
        .ok()?;

        let watch_path = self.path.parent().unwrap_or(self.path.as_ref());
        watcher.watch(watch_path, RecursiveMode::NonRecursive).ok()?;

        Some(watcher)
    }
}

/// Write path for user prompts: one JSON line per prompt, non-blocking.
#[derive(Debug, Clone)]
pub struct PromptFifo {
    path: PathBuf,
}

impl PromptFifo {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Write one line to the FIFO without blocking.
    ///
    /// Returns `Ok(false)` when no reader has the FIFO open: the prompt
    /// is dropped and the caller is never blocked.
    pub fn write_line(&self, line: &str) -> anyhow::Result<bool> {
        // O_NONBLOCK on a writer-side FIFO open fails with ENXIO when no
        // reader exists; that is the drop signal, not an error.
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e)
                if e.raw_os_error() == Some(Errno::ENXIO as i32)
                    || e.kind() == std::io::ErrorKind::NotFound =>
            {
                return Ok(false)
            }
            Err(e) => return Err(anyhow::Error::new(e).context("open prompt fifo")),
        };

        // Prompt lines stay well under PIPE_BUF, so the write is atomic; a
        // full pipe reads as a drop rather than a stall.
        match file.write_all(line.as_bytes()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(anyhow::Error::new(e).context("write prompt fifo")),
        }
    }
}

/// One rich session's local resources: event log, prompt FIFO, and the
/// backing emulator session. Shared by the hub (local placement) and the
/// agent (remote placement) so the two paths cannot diverge.
pub struct RichSession {
    dir: RichDir,
    tmux: crate::tmux::TmuxControl,
    emulator_name: String,
}

impl RichSession {
    pub fn new(dir: RichDir, tmux: crate::tmux::TmuxControl, emulator_name: String) -> Self {
        Self { dir, tmux, emulator_name }
    }

    pub fn dir(&self) -> &RichDir {
        &self.dir
    }

    /// Whether the backing AI process' emulator session exists.
    pub async fn process_alive(&self) -> bool {
        self.tmux.exists(&self.emulator_name).await
    }

    /// Start streaming filtered events: full replay from offset 0, then
    /// tail. The replay prefix fully precedes tailed events, parse errors
    /// skip the line, and `stream_event` records never pass.
    ///
    /// The returned channel is bounded; a slow consumer suspends the tail
    /// rather than dropping events.
    pub fn spawn_event_stream(
        &self,
        shutdown: CancellationToken,
    ) -> mpsc::Receiver<serde_json::Value> {
        let (event_tx, event_rx) = mpsc::channel::<serde_json::Value>(64);
        let tail = EventTail::new(self.dir.events_path());

        tokio::spawn(async move {
            let mut filter = EventFilter::new();
            let (line_tx, mut line_rx) = mpsc::channel::<Vec<String>>(8);
            tokio::spawn(tail.run(line_tx, shutdown));

            while let Some(lines) = line_rx.recv().await {
                for line in lines {
                    let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                        continue;
                    };
                    if filter.admit(&value) && event_tx.send(value).await.is_err() {
                        return;
                    }
                }
            }
        });

        event_rx
    }

    /// Relay one user prompt. Returns whether it reached a reader.
    pub fn send_prompt(&self, text: &str) -> anyhow::Result<bool> {
        let fifo = PromptFifo::new(self.dir.fifo_path());
        fifo.write_line(&crate::protocol::encode_prompt_line(text))
    }

    /// Cancel the in-flight turn by sending Ctrl-C to the emulator session.
    pub async fn interrupt(&self) -> anyhow::Result<()> {
        self.tmux.send_ctrl_c(&self.emulator_name).await
    }
}

/// Wrap a rich command so its stdin reads the prompt FIFO and its stdout
/// appends to the event log.
///
/// The FIFO opens read-write: the process itself keeps a writer alive, so
/// prompt writers closing never delivers EOF to the AI CLI (the same
/// trick hook pipes use to avoid spurious EOF).
pub fn wrap_command(command: &str, dir: &RichDir) -> String {
    let fifo = dir.fifo_path();
    let events = dir.events_path();
    let stderr = dir.path().join("stderr.log");
    format!(
        "exec {command} 0<> '{}' >> '{}' 2>> '{}'",
        fifo.display(),
        events.display(),
        stderr.display()
    )
}

/// Copy the parent's event log up to its last complete line into the
/// child's directory, so a forked session replays the parent's context
/// from birth. A partial trailing line belongs to the parent's in-flight
/// event and is not copied.
pub fn copy_event_prefix(parent: &RichDir, child: &RichDir) -> anyhow::Result<()> {
    child.ensure()?;
    let source = parent.events_path();
    if !source.exists() {
        return Ok(());
    }
    let contents = std::fs::read(&source)?;
    let cut = contents.iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
    std::fs::write(child.events_path(), &contents[..cut])?;
    Ok(())
}

/// Summary of a rich session's on-disk state for diagnostics.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RichDiagnostics {
    pub events_path: String,
    pub events_bytes: u64,
    pub event_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_type: Option<String>,
    pub fifo_present: bool,
}

/// Inspect a rich session directory.
pub fn diagnose(dir: &RichDir) -> RichDiagnostics {
    let events_path = dir.events_path();
    let (events_bytes, event_count, last_event_type) = match std::fs::read_to_string(&events_path) {
        Ok(contents) => {
            let count = contents.lines().filter(|l| !l.trim().is_empty()).count() as u64;
            let last = contents
                .lines()
                .rev()
                .find_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
                .and_then(|v| event_type(&v).map(str::to_owned));
            (contents.len() as u64, count, last)
        }
        Err(_) => (0, 0, None),
    };
    RichDiagnostics {
        events_path: events_path.to_string_lossy().into_owned(),
        events_bytes,
        event_count,
        last_event_type,
        fifo_present: dir.fifo_path().exists(),
    }
}

#[cfg(test)]
#[path = "richlog_tests.rs"]
mod tests;
