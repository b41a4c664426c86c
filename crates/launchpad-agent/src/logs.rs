use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

const TAIL_LIMIT_BYTES: u64 = 64 * 1024;
pub const DEFAULT_TAIL_LINES: usize = 20;
pub const MAX_TAIL_LINES: usize = 50;

pub fn clamp_lines(requested: Option<usize>) -> usize {
    match requested {
        None | Some(0) => DEFAULT_TAIL_LINES,
        Some(n) => n.min(MAX_TAIL_LINES),
    }
}

fn split_lines_from_tail(buf: &[u8], max_lines: usize, from_start: bool) -> Vec<String> {
    // Best-effort UTF-8: invalid sequences are replaced.
    let text = String::from_utf8_lossy(buf);
    let mut lines: Vec<&str> = text.lines().collect();

    // A read that began mid-file almost always starts mid-line.
    if !from_start && !lines.is_empty() {
        lines.remove(0);
    }

    let skip = lines.len().saturating_sub(max_lines);
    lines.into_iter().skip(skip).map(|l| l.to_string()).collect()
}

/// Last `max_lines` lines of `path`. A missing or unreadable file has no lines.
pub async fn tail_file(path: &Path, max_lines: usize) -> Vec<String> {
    match read_tail(path, max_lines).await {
        Ok(lines) => lines,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "log tail unavailable");
            Vec::new()
        }
    }
}

async fn read_tail(path: &Path, max_lines: usize) -> std::io::Result<Vec<String>> {
    let mut f = tokio::fs::File::open(path).await?;
    let size = f.metadata().await?.len();
    let start = size.saturating_sub(TAIL_LIMIT_BYTES);
    f.seek(std::io::SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((size - start) as usize);
    f.read_to_end(&mut buf).await?;
    Ok(split_lines_from_tail(&buf, max_lines, start == 0))
}
