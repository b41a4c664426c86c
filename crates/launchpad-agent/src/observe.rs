//! The observation window: a freshly spawned candidate is watched for a fixed
//! time and rejected if anything resembling "error" shows up on its stderr.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

const NEEDLE: &[u8] = b"error";
const MAX_EXCERPT_BYTES: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The window elapsed without a match.
    Clean,
    /// Stderr matched; carries the offending text (trimmed, bounded).
    ErrorOutput(String),
}

/// Case-insensitive substring search that tolerates the needle being split
/// across reads.
#[derive(Debug, Default)]
pub(crate) struct ErrorMatcher {
    carry: Vec<u8>,
}

impl ErrorMatcher {
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> bool {
        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(chunk);

        let hit = window
            .windows(NEEDLE.len())
            .any(|w| w.eq_ignore_ascii_case(NEEDLE));

        let keep = NEEDLE.len() - 1;
        let start = window.len().saturating_sub(keep);
        self.carry = window[start..].to_vec();
        hit
    }
}

fn excerpt(chunk: &[u8]) -> String {
    let text = String::from_utf8_lossy(chunk);
    let text = text.trim();
    crate::error::truncate_utf8(text, MAX_EXCERPT_BYTES)
}

async fn scan_for_error<R>(stderr: &mut R) -> String
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut matcher = ErrorMatcher::default();
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => {
                // Stream closed without a match: nothing more can change the
                // verdict, so wait out the window.
                std::future::pending::<()>().await;
            }
            Ok(n) => {
                if matcher.feed(&buf[..n]) {
                    return excerpt(&buf[..n]);
                }
            }
        }
    }
}

async fn discard<R>(stderr: &mut R)
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 4096];
    while let Ok(n) = stderr.read(&mut buf).await {
        if n == 0 {
            break;
        }
    }
    std::future::pending::<()>().await;
}

/// Watches stderr for the whole `window`. A match only flags the verdict:
/// the window still runs to completion before it is returned.
///
/// The stream is borrowed, not consumed, so the caller keeps draining it
/// afterwards; dropping the read end would hand the child a SIGPIPE.
pub async fn observe<R>(stderr: Option<&mut R>, window: Duration) -> Verdict
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = tokio::time::Instant::now() + window;
    let Some(stderr) = stderr else {
        tokio::time::sleep_until(deadline).await;
        return Verdict::Clean;
    };

    match tokio::time::timeout_at(deadline, scan_for_error(&mut *stderr)).await {
        Ok(text) => {
            // Keep the pipe moving until the window closes.
            let _ = tokio::time::timeout_at(deadline, discard(stderr)).await;
            Verdict::ErrorOutput(text)
        }
        Err(_) => Verdict::Clean,
    }
}

/// Forwards remaining stderr lines to the log until the child closes it.
pub fn drain_stderr<R>(project: String, pid: u32, stderr: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    tracing::debug!(project = %project, pid, "[stderr] {}", text.trim_end());
                }
            }
        }
    });
}
