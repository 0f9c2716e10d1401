use crate::model::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Ingest,
    Retrieve,
    Lifecycle,
    Graph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    Denied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Assigned by the sink; sequence order always matches write order.
    pub sequence: u64,
    pub at_ms: i64,
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AuditEvent {
    pub fn new(operation: AuditOperation, outcome: AuditOutcome) -> Self {
        Self {
            sequence: 0,
            at_ms: 0,
            operation,
            outcome,
            request_id: None,
            container_id: None,
            subject: None,
            agent_id: None,
            agent_name: None,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink lock poisoned")]
    LockPoisoned,
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Test and local-dev sink. The sequence is derived from the buffer length
/// under the same lock as the push, so no separate counter can drift.
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let events = self.events.lock().map_err(|_| AuditError::LockPoisoned)?;
        Ok(events.clone())
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, mut event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.lock().map_err(|_| AuditError::LockPoisoned)?;
        event.sequence = events.len() as u64 + 1;
        event.at_ms = now_ms();
        events.push(event);
        Ok(())
    }
}

struct JsonlState {
    file: File,
    next_sequence: u64,
}

/// Append-only JSONL trail. The sequence survives restarts: opening scans
/// the tail of the existing file and continues from the last recorded
/// event. Each record is a single unbuffered write; denials and failures
/// are additionally fsynced before `record` returns, since those are the
/// lines an operator reads after an incident.
pub struct JsonlAuditSink {
    state: Mutex<JsonlState>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let next_sequence = last_recorded_sequence(path)? + 1;
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            state: Mutex::new(JsonlState {
                file,
                next_sequence,
            }),
        })
    }
}

/// Highest sequence already in the file, or 0 when the file is absent or
/// holds no parseable event. Scanned from the end because only the last
/// line matters.
fn last_recorded_sequence(path: &Path) -> Result<u64, AuditError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(AuditError::Io(err)),
    };

    for line in content.lines().rev() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(event) = serde_json::from_str::<AuditEvent>(line) {
            return Ok(event.sequence);
        }
    }
    Ok(0)
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, mut event: AuditEvent) -> Result<(), AuditError> {
        let mut state = self.state.lock().map_err(|_| AuditError::LockPoisoned)?;
        event.sequence = state.next_sequence;
        event.at_ms = now_ms();

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        state.file.write_all(&line)?;
        if event.outcome != AuditOutcome::Succeeded {
            state.file.sync_data()?;
        }

        state.next_sequence += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn in_memory_sink_sequences_and_stamps_events() {
        let sink = InMemoryAuditSink::default();

        sink.record(AuditEvent::new(
            AuditOperation::Ingest,
            AuditOutcome::Succeeded,
        ))
        .unwrap();
        sink.record(AuditEvent::new(
            AuditOperation::Retrieve,
            AuditOutcome::Denied,
        ))
        .unwrap();

        let events = sink.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(events[1].sequence, 2);
        assert!(events.iter().all(|e| e.at_ms > 0));
    }

    #[test]
    fn jsonl_sink_writes_operation_and_agent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let sink = JsonlAuditSink::open(&path).unwrap();

        let mut event = AuditEvent::new(AuditOperation::Retrieve, AuditOutcome::Succeeded);
        event.agent_id = Some("agent-7".to_string());
        event.container_id = Some("ct_art".to_string());
        sink.record(event).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("\"operation\":\"retrieve\""));
        assert!(content.contains("\"agent_id\":\"agent-7\""));
    }

    #[test]
    fn jsonl_sequence_resumes_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");

        {
            let sink = JsonlAuditSink::open(&path).unwrap();
            sink.record(AuditEvent::new(
                AuditOperation::Ingest,
                AuditOutcome::Succeeded,
            ))
            .unwrap();
            sink.record(AuditEvent::new(
                AuditOperation::Lifecycle,
                AuditOutcome::Failed,
            ))
            .unwrap();
        }

        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.record(AuditEvent::new(
            AuditOperation::Retrieve,
            AuditOutcome::Succeeded,
        ))
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let last = content.lines().last().unwrap();
        let event: AuditEvent = serde_json::from_str(last).unwrap();
        assert_eq!(event.sequence, 3);
    }

    #[test]
    fn unparseable_tail_restarts_sequence_safely() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(&path, "not json\n").unwrap();

        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.record(AuditEvent::new(
            AuditOperation::Graph,
            AuditOutcome::Succeeded,
        ))
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let event: AuditEvent =
            serde_json::from_str(content.lines().last().unwrap()).unwrap();
        assert_eq!(event.sequence, 1);
    }
}
