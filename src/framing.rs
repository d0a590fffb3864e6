use crate::protocol::ResponseFrame;

const ROOT_KEY: &[u8] = b"\"heos\"";

/// Heartbeat replies are identical every time and are never suppressed
const HEARTBEAT_COMMAND: &str = "system/heart_beat";

/// Splits the inbound byte stream into decoded frames
///
/// A read may carry any number of complete frames followed by at most one
/// partial frame. The partial tail is kept and prepended to the next read.
/// A frame identical to the one delivered just before it is dropped, except
/// for heartbeat replies.
#[derive(Debug, Default)]
pub struct FrameDemux {
    tail: Vec<u8>,
    last: Option<Vec<u8>>,
}

impl FrameDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read and return the frames it completed, in arrival order
    pub fn push(&mut self, data: &[u8]) -> Vec<ResponseFrame> {
        let mut buffer = std::mem::take(&mut self.tail);
        buffer.extend(data.iter().copied().filter(|b| *b != b'\r' && *b != b'\n'));

        let starts = frame_starts(&buffer);
        let mut frames = Vec::new();

        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(buffer.len());
            let candidate = trim(&buffer[start..end]);
            if candidate.is_empty() {
                continue;
            }

            match serde_json::from_slice::<ResponseFrame>(candidate) {
                Ok(frame) => {
                    let heartbeat = frame.heos.command == HEARTBEAT_COMMAND;
                    if !heartbeat && self.last.as_deref() == Some(candidate) {
                        tracing::debug!("Dropping duplicate frame: {}", frame.heos.command);
                        continue;
                    }
                    self.last = Some(candidate.to_vec());
                    frames.push(frame);
                }
                Err(e) if i + 1 == starts.len() => {
                    tracing::trace!("Buffering partial frame ({} bytes): {}", candidate.len(), e);
                    self.tail = candidate.to_vec();
                }
                Err(e) => {
                    tracing::debug!(
                        "Discarding unparsable frame: {} ({})",
                        String::from_utf8_lossy(candidate),
                        e
                    );
                }
            }
        }

        frames
    }

    /// Bytes currently held back as a partial frame
    pub fn pending(&self) -> usize {
        self.tail.len()
    }

    pub fn reset(&mut self) {
        self.tail.clear();
        self.last = None;
    }
}

/// Offsets of every `{` that opens an object whose first key is `"heos"`
///
/// The buffer start is always a candidate so leading fragments are kept.
fn frame_starts(buffer: &[u8]) -> Vec<usize> {
    let mut starts = vec![0];
    for (i, &b) in buffer.iter().enumerate().skip(1) {
        if b != b'{' {
            continue;
        }
        let rest = trim_start(&buffer[i + 1..]);
        if rest.starts_with(ROOT_KEY) {
            starts.push(i);
        }
    }
    starts
}

fn trim_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn trim(bytes: &[u8]) -> &[u8] {
    let bytes = trim_start(bytes);
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1);
    &bytes[..end]
}
