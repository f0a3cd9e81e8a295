//! Bounded capture of a child's stdout/stderr for diagnostics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::task::JoinHandle;
use tracing::debug;

/// Lines retained per stream.
pub const TAIL_LINES: usize = 64;

/// Ring buffer of the last [`TAIL_LINES`] lines of one stream.
#[derive(Debug, Default)]
pub(crate) struct OutputTail {
    lines: Mutex<VecDeque<String>>,
}

impl OutputTail {
    pub(crate) fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }
}

/// Drain `lines` into `tail` until EOF, logging each line at debug.
pub(crate) fn spawn_capture<R>(
    mut lines: Lines<BufReader<R>>,
    tail: Arc<OutputTail>,
    plugin: String,
    stream: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(plugin = %plugin, stream, line = %line, "plugin output");
                    tail.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(plugin = %plugin, stream, error = %e, "stopped reading plugin output");
                    break;
                }
            }
        }
    })
}

/// Convenience for a raw pipe.
pub(crate) fn capture_reader<R>(
    reader: R,
    tail: Arc<OutputTail>,
    plugin: String,
    stream: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    spawn_capture(BufReader::new(reader).lines(), tail, plugin, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_only_the_most_recent_lines() {
        let tail = OutputTail::default();
        for i in 0..(TAIL_LINES + 10) {
            tail.push(format!("line {i}"));
        }
        let lines = tail.snapshot();
        assert_eq!(lines.len(), TAIL_LINES);
        assert_eq!(lines[0], "line 10");
        assert_eq!(lines.last().unwrap(), &format!("line {}", TAIL_LINES + 9));
    }

    #[tokio::test]
    async fn capture_reads_until_eof() {
        let tail = Arc::new(OutputTail::default());
        let input: &[u8] = b"one\ntwo\nthree";
        capture_reader(input, Arc::clone(&tail), "p".into(), "stderr")
            .await
            .unwrap();
        assert_eq!(tail.snapshot(), ["one", "two", "three"]);
    }
}
