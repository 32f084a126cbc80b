use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
    pub truncated: bool,
}

impl OutputLine {
    #[must_use]
    pub fn to_detail(&self) -> Value {
        if self.truncated {
            json!({"stream": self.stream, "line": self.line, "truncated": true})
        } else {
            json!({"stream": self.stream, "line": self.line})
        }
    }
}

/// Bytes kept past the limit so a character straddling it is not split.
const CHAR_SLACK: usize = 4;

/// Forward each line of `reader` as soon as it is complete. Stops at EOF or
/// once the receiver is gone. At most `max_line_bytes` (plus a few bytes of
/// slack) of a line is ever buffered; the rest is dropped up to the next newline.
pub fn spawn_line_reader<R>(
    reader: R,
    stream: OutputStream,
    max_line_bytes: usize,
    tx: mpsc::Sender<OutputLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let capacity = max_line_bytes.saturating_add(CHAR_SLACK);
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();
        let mut pending = false;
        loop {
            let chunk = match reader.fill_buf().await {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if chunk.is_empty() {
                if pending {
                    let _ = tx.send(finish_line(stream, &buffer, max_line_bytes)).await;
                }
                break;
            }

            let newline = chunk.iter().position(|byte| *byte == b'\n');
            let content = &chunk[..newline.unwrap_or(chunk.len())];
            let room = capacity.saturating_sub(buffer.len());
            buffer.extend_from_slice(&content[..content.len().min(room)]);
            pending = true;
            let consumed = newline.map_or(chunk.len(), |index| index + 1);
            reader.consume(consumed);

            if newline.is_some() {
                let message = finish_line(stream, &buffer, max_line_bytes);
                buffer.clear();
                pending = false;
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        }
    })
}

fn finish_line(stream: OutputStream, raw: &[u8], max_line_bytes: usize) -> OutputLine {
    let text = String::from_utf8_lossy(raw);
    let (line, truncated) = truncate_line(text.trim_end_matches('\r'), max_line_bytes);
    OutputLine {
        stream,
        line,
        truncated,
    }
}

/// Cut `line` to at most `max_bytes`, never splitting a character.
#[must_use]
pub fn truncate_line(line: &str, max_bytes: usize) -> (String, bool) {
    if line.len() <= max_bytes {
        return (line.to_string(), false);
    }
    let cut = (0..=max_bytes)
        .rev()
        .find(|index| line.is_char_boundary(*index))
        .unwrap_or(0);
    (line[..cut].to_string(), true)
}
