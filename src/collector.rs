//! Drains a remote process's output and collects its exit code.

use std::io::{self, BufRead, Read};

use crate::ExecutionResult;
use crate::broker::RemoteProcess;
use crate::error::{BrokerError, Result};

/// Upper bound on captured output.
///
/// When bounded, output is kept up to `max_bytes` and the rest is read and
/// discarded, so the remote process never stalls on a full pipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputLimit {
    max_bytes: Option<usize>,
}

impl OutputLimit {
    pub fn new(max_bytes: Option<usize>) -> Self {
        Self { max_bytes }
    }

    pub fn unbounded() -> Self {
        Self { max_bytes: None }
    }

    pub fn bytes(max_bytes: usize) -> Self {
        Self { max_bytes: Some(max_bytes) }
    }

    pub fn max_bytes(&self) -> Option<usize> {
        self.max_bytes
    }
}

/// Accumulates lines under an [`OutputLimit`].
struct OutputBuffer {
    text: String,
    limit: OutputLimit,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: OutputLimit) -> Self {
        Self { text: String::new(), limit, truncated: false }
    }

    /// Largest read that can still decide whether the next line fits:
    /// the remaining room plus one byte. `None` when unbounded.
    fn read_cap(&self) -> Option<u64> {
        self.limit
            .max_bytes
            .map(|max| max.saturating_sub(self.text.len()) as u64 + 1)
    }

    fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }

        let Some(max) = self.limit.max_bytes else {
            self.text.push_str(line);
            self.text.push('\n');
            return;
        };

        let remaining = max.saturating_sub(self.text.len());
        if line.len() < remaining {
            self.text.push_str(line);
            self.text.push('\n');
            return;
        }

        // Keep the head, cut on a char boundary.
        let mut end = remaining.min(line.len());
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&line[..end]);
        self.truncated = true;
    }

    fn finish(self, exit_code: i32) -> ExecutionResult {
        ExecutionResult {
            exit_code,
            output: self.text,
            truncated: self.truncated,
        }
    }
}

/// Strips a trailing `\n` or `\r\n`.
fn strip_terminator(line: &[u8]) -> &[u8] {
    match line.strip_suffix(b"\n") {
        Some(line) => line.strip_suffix(b"\r").unwrap_or(line),
        None => line,
    }
}

fn read_error(err: io::Error) -> BrokerError {
    BrokerError::ExecutionFailed(format!("failed to read process output: {err}"))
}

/// Reads `stdout` to end-of-data into a buffer bounded by `limit`.
///
/// While bounded, no single read takes more than one byte past the remaining
/// room, so a line without a terminator cannot grow memory. Once truncated,
/// the rest of the stream is discarded as it is read.
fn drain(
    mut stdout: Box<dyn BufRead + Send>,
    limit: OutputLimit,
) -> Result<(OutputBuffer, usize)> {
    let mut buffer = OutputBuffer::new(limit);
    let mut line = Vec::new();
    let mut lines = 0usize;
    loop {
        line.clear();
        let read = match buffer.read_cap() {
            Some(cap) => Read::take(&mut stdout, cap).read_until(b'\n', &mut line),
            None => stdout.read_until(b'\n', &mut line),
        }
        .map_err(read_error)?;
        if read == 0 {
            break;
        }
        lines += 1;
        buffer.push_line(&String::from_utf8_lossy(strip_terminator(&line)));

        if buffer.truncated {
            io::copy(&mut stdout, &mut io::sink()).map_err(read_error)?;
            break;
        }
    }
    Ok((buffer, lines))
}

/// Reads the process output to the end, then waits for it to exit.
///
/// Each line is appended followed by `\n`. The exit code is retrieved only
/// after the output stream reports end-of-data. A nonzero exit code is
/// returned as data.
///
/// # Errors
/// Returns [`BrokerError::ExecutionFailed`] if the output stream is missing or
/// cannot be read; anything read so far is discarded. The process is still
/// waited on so it does not linger unreaped.
pub fn collect(mut process: Box<dyn RemoteProcess>, limit: OutputLimit) -> Result<ExecutionResult> {
    let Some(stdout) = process.take_stdout() else {
        let _ = process.wait_for_exit();
        return Err(BrokerError::ExecutionFailed(
            "process output stream is unavailable".to_string(),
        ));
    };

    // `drain` drops the stream before returning, so a writer still blocked
    // on the pipe gets EPIPE instead of hanging the wait below.
    let (buffer, lines) = match drain(stdout, limit) {
        Ok(drained) => drained,
        Err(err) => {
            if let Err(wait_err) = process.wait_for_exit() {
                tracing::warn!(error = %wait_err, "Failed to reap process after read error");
            }
            return Err(err);
        }
    };

    let exit_code = process.wait_for_exit()?;
    tracing::debug!(
        pid = process.id(),
        exit_code,
        lines,
        truncated = buffer.truncated,
        "Collected process output"
    );
    Ok(buffer.finish(exit_code))
}
