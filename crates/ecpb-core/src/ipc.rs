use std::io::Write;
use std::sync::mpsc;

use serde::{Deserialize, Serialize};

/// Maximum payload length carried by a progress record, mirroring the
/// fixed-size message layout of the worker pipe protocol.
pub const MAX_PAYLOAD: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    JobStart,
    JobProgress,
    JobComplete,
    JobFailed,
    ChunkStored,
    SnapshotReady,
    Shutdown,
    Heartbeat,
}

/// One progress record from a worker. In multi-process mode these cross
/// the child's stdout as newline-delimited JSON; in-process they travel
/// over an mpsc channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub kind: MessageKind,
    pub job_id: i64,
    pub worker_pid: u32,
    pub value1: u64,
    pub value2: u64,
    pub payload: String,
}

impl ProgressMessage {
    pub fn new(kind: MessageKind, job_id: i64, value1: u64, value2: u64) -> Self {
        Self {
            kind,
            job_id,
            worker_pid: std::process::id(),
            value1,
            value2,
            payload: String::new(),
        }
    }

    pub fn with_payload(mut self, payload: &str) -> Self {
        self.payload = truncate_payload(payload);
        self
    }
}

/// Clamp a payload to `MAX_PAYLOAD` bytes on a char boundary.
fn truncate_payload(payload: &str) -> String {
    if payload.len() <= MAX_PAYLOAD {
        return payload.to_string();
    }
    let mut end = MAX_PAYLOAD;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    payload[..end].to_string()
}

/// Destination for worker progress records.
pub trait ProgressSink {
    fn send(&self, message: ProgressMessage);
}

/// In-process sink: forwards into an mpsc channel. Send failures are
/// ignored; a dropped receiver just means nobody is watching.
pub struct ChannelSink {
    sender: mpsc::Sender<ProgressMessage>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<ProgressMessage>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelSink {
    fn send(&self, message: ProgressMessage) {
        let _ = self.sender.send(message);
    }
}

/// Child-process sink: one JSON record per line on stdout, flushed so the
/// parent's reader thread sees records promptly.
pub struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn send(&self, message: ProgressMessage) {
        if let Ok(line) = serde_json::to_string(&message) {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            let _ = writeln!(handle, "{line}");
            let _ = handle.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_line_roundtrip() {
        let msg = ProgressMessage::new(MessageKind::JobProgress, 42, 1024, 4096);
        let line = serde_json::to_string(&msg).unwrap();
        let parsed: ProgressMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.kind, MessageKind::JobProgress);
        assert_eq!(parsed.job_id, 42);
        assert_eq!(parsed.value1, 1024);
        assert_eq!(parsed.value2, 4096);
    }

    #[test]
    fn payload_is_truncated() {
        let long = "x".repeat(MAX_PAYLOAD * 2);
        let msg = ProgressMessage::new(MessageKind::JobFailed, 1, 0, 0).with_payload(&long);
        assert_eq!(msg.payload.len(), MAX_PAYLOAD);
    }

    #[test]
    fn payload_truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_PAYLOAD);
        let msg = ProgressMessage::new(MessageKind::JobFailed, 1, 0, 0).with_payload(&long);
        assert!(msg.payload.len() <= MAX_PAYLOAD);
        assert!(msg.payload.chars().all(|c| c == 'é'));
    }

    #[test]
    fn channel_sink_delivers() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);
        sink.send(ProgressMessage::new(MessageKind::JobStart, 7, 0, 0));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind, MessageKind::JobStart);
        assert_eq!(received.job_id, 7);
    }
}
