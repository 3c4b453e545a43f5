//! Log multiplexing
//!
//! Turns a container's raw stdout/stderr into structured [`Line`]s on the
//! pipeline's shared pipe. Each step gets its own multiplexer; positions
//! count from zero per step and the stream always ends with exactly one
//! exit-code line once the process state is known.

use sluice_core::domain::{ExitState, Line, LineKind};
use std::borrow::Cow;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::runtime::{LogReader, LogStream};

/// Replacement for masked values
pub const MASK: &str = "********";

/// Redacts secret values from output text
#[derive(Debug, Clone, Default)]
pub struct Masker {
    secrets: Vec<String>,
}

impl Masker {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        // Longest first so a secret containing another is masked whole
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets.dedup();
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn mask<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut masked = Cow::Borrowed(text);
        for secret in &self.secrets {
            if masked.contains(secret.as_str()) {
                masked = Cow::Owned(masked.replace(secret.as_str(), MASK));
            }
        }
        masked
    }
}

/// Per-step log producer
pub struct LogMultiplexer {
    step: String,
    pipe: mpsc::Sender<Line>,
    clock: Instant,
    masker: Masker,
    pos: usize,
}

impl LogMultiplexer {
    pub fn new(
        step: impl Into<String>,
        pipe: mpsc::Sender<Line>,
        clock: Instant,
        masker: Masker,
    ) -> Self {
        Self {
            step: step.into(),
            pipe,
            clock,
            masker,
            pos: 0,
        }
    }

    /// Forwards every output line, then the exit code
    ///
    /// Both streams are read concurrently until they reach EOF. The exit
    /// code line is only emitted if `exit` resolves; a dropped sender means
    /// the process state never became known.
    pub async fn run(mut self, logs: LogStream, exit: oneshot::Receiver<ExitState>) {
        let mut stdout = Some(LineReader::new(logs.stdout));
        let mut stderr = logs.stderr.map(LineReader::new);

        while stdout.is_some() || stderr.is_some() {
            let (kind, read) = tokio::select! {
                read = next_line(&mut stdout), if stdout.is_some() => (LineKind::Stdout, read),
                read = next_line(&mut stderr), if stderr.is_some() => (LineKind::Stderr, read),
            };

            match read {
                Ok(Some(text)) => {
                    if !self.emit(kind, text).await {
                        return;
                    }
                }
                Ok(None) => close(kind, &mut stdout, &mut stderr),
                Err(e) => {
                    warn!(step = %self.step, "Failed to read {} stream: {}", kind, e);
                    close(kind, &mut stdout, &mut stderr);
                }
            }
        }

        match exit.await {
            Ok(state) => {
                self.emit(LineKind::ExitCode, state.exit_code.to_string())
                    .await;
            }
            Err(_) => debug!(step = %self.step, "Exit state unavailable, no exit line"),
        }
    }

    /// Sends one line; returns false once the pipe is closed
    async fn emit(&mut self, kind: LineKind, out: String) -> bool {
        let out = self.masker.mask(&out).into_owned();
        let line = Line::new(
            self.step.clone(),
            self.clock.elapsed().as_secs(),
            kind,
            self.pos,
            out,
        );
        self.pos += 1;

        if self.pipe.send(line).await.is_err() {
            debug!(step = %self.step, "Log pipe closed, dropping remaining output");
            return false;
        }
        true
    }
}

/// Newline-delimited reader tolerant of invalid UTF-8
///
/// Partial reads stay buffered across calls, so `next_line` may be
/// cancelled inside `select!` without losing bytes.
struct LineReader {
    reader: BufReader<LogReader>,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(reader: LogReader) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let mut raw = std::mem::take(&mut self.buf);
        if raw.last() == Some(&b'\n') {
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
    }
}

async fn next_line(reader: &mut Option<LineReader>) -> std::io::Result<Option<String>> {
    match reader {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

fn close(kind: LineKind, stdout: &mut Option<LineReader>, stderr: &mut Option<LineReader>) {
    match kind {
        LineKind::Stderr => *stderr = None,
        _ => *stdout = None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(text: &str) -> LogReader {
        bytes(text.as_bytes())
    }

    fn bytes(raw: &[u8]) -> LogReader {
        Box::new(Cursor::new(raw.to_vec()))
    }

    async fn collect(logs: LogStream, exit: Option<ExitState>, masker: Masker) -> Vec<Line> {
        let (tx, mut rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        if let Some(state) = exit {
            exit_tx.send(state).unwrap();
        } else {
            drop(exit_tx);
        }

        LogMultiplexer::new("build", tx, Instant::now(), masker)
            .run(logs, exit_rx)
            .await;

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_positions_increase_and_exit_is_last() {
        let logs = LogStream::split(reader("one\ntwo\n"), reader("warn\n"));
        let lines = collect(logs, Some(ExitState::exited(3)), Masker::default()).await;

        assert_eq!(lines.len(), 4);
        let positions: Vec<usize> = lines.iter().map(|l| l.pos).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);

        let last = lines.last().unwrap();
        assert_eq!(last.kind, LineKind::ExitCode);
        assert_eq!(last.out, "3");
        assert!(lines.iter().all(|l| l.step == "build"));
        assert_eq!(
            lines.iter().filter(|l| l.kind == LineKind::Stderr).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_stdout_order_preserved() {
        let logs = LogStream::combined(reader("a\nb\nc"));
        let lines = collect(logs, Some(ExitState::exited(0)), Masker::default()).await;

        let out: Vec<&str> = lines.iter().map(|l| l.out.as_str()).collect();
        assert_eq!(out, vec!["a", "b", "c", "0"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_truncate_stream() {
        let logs = LogStream::combined(bytes(b"before\n\xff\xfe binary\r\nafter\n"));
        let lines = collect(logs, Some(ExitState::exited(0)), Masker::default()).await;

        let out: Vec<&str> = lines.iter().map(|l| l.out.as_str()).collect();
        assert_eq!(out, vec!["before", "\u{fffd}\u{fffd} binary", "after", "0"]);
    }

    #[tokio::test]
    async fn test_no_exit_line_without_state() {
        let logs = LogStream::combined(reader("partial\n"));
        let lines = collect(logs, None, Masker::default()).await;

        assert_eq!(lines.len(), 1);
        assert!(lines.iter().all(|l| l.kind != LineKind::ExitCode));
    }

    #[tokio::test]
    async fn test_secrets_are_masked() {
        let logs = LogStream::combined(reader("token=s3cr3t\n"));
        let lines = collect(
            logs,
            Some(ExitState::exited(0)),
            Masker::new(["s3cr3t"]),
        )
        .await;

        assert_eq!(lines[0].out, "token=********");
    }

    #[tokio::test]
    async fn test_closed_pipe_stops_quietly() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (exit_tx, exit_rx) = oneshot::channel();
        exit_tx.send(ExitState::exited(0)).unwrap();

        LogMultiplexer::new("build", tx, Instant::now(), Masker::default())
            .run(LogStream::combined(reader("x\ny\n")), exit_rx)
            .await;
    }

    #[test]
    fn test_masker_prefers_longest_secret() {
        let masker = Masker::new(["abc", "abcdef", ""]);
        assert_eq!(masker.mask("key=abcdef"), "key=********");
        assert_eq!(masker.mask("nothing here"), "nothing here");
        assert!(Masker::new(Vec::<String>::new()).is_empty());
    }
}
