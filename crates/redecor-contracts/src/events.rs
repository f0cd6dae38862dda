use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

const ENVELOPE_KEYS: [&str; 3] = ["type", "session_id", "ts"];

/// Request lifecycle log, one JSON object per line.
///
/// A line is the envelope (`type`, `session_id`, `ts`) plus the payload keys
/// that do not collide with it. The file is opened on first use and the handle
/// is shared by every clone, so lines from concurrent requests stay whole.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<EventLog>,
}

#[derive(Debug)]
struct EventLog {
    path: PathBuf,
    session_id: String,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(EventLog {
                path: path.into(),
                session_id: session_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Appends one event and returns the object that was written.
    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let event = self.envelope(event_type, payload);
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut slot = self.shared.file.lock();
        if slot.is_none() {
            *slot = Some(self.open()?);
        }
        if let Some(file) = slot.as_mut() {
            file.write_all(&line)
                .with_context(|| format!("failed appending to {}", self.shared.path.display()))?;
        }
        Ok(event)
    }

    /// Every line that still parses, oldest first. A missing log is empty.
    pub fn read_all(&self) -> anyhow::Result<Vec<Value>> {
        let raw = match std::fs::read_to_string(&self.shared.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    fn envelope(&self, event_type: &str, payload: EventPayload) -> Value {
        let mut event = Map::new();
        event.insert("type".into(), event_type.into());
        event.insert("session_id".into(), self.shared.session_id.clone().into());
        event.insert(
            "ts".into(),
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Micros, false)
                .into(),
        );
        event.extend(
            payload
                .into_iter()
                .filter(|(key, _)| !ENVELOPE_KEYS.contains(&key.as_str())),
        );
        Value::Object(event)
    }

    fn open(&self) -> anyhow::Result<File> {
        let path = &self.shared.path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed opening event log {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::DateTime;

    use super::*;

    fn payload(pairs: &[(&str, Value)]) -> EventPayload {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn request_event_lands_on_disk_with_envelope() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-1");

        let emitted = writer.emit(
            "request_received",
            payload(&[("request_id", Value::from("req-9"))]),
        )?;

        let raw = std::fs::read_to_string(&path)?;
        assert_eq!(raw.lines().count(), 1);
        let on_disk: Value = serde_json::from_str(raw.trim_end())?;
        assert_eq!(on_disk, emitted);
        assert_eq!(on_disk["type"], "request_received");
        assert_eq!(on_disk["session_id"], "session-1");
        assert_eq!(on_disk["request_id"], "req-9");
        DateTime::parse_from_rfc3339(on_disk["ts"].as_str().unwrap_or_default())?;
        Ok(())
    }

    #[test]
    fn payload_keys_never_replace_envelope() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "session-1");

        let emitted = writer.emit(
            "artifact_created",
            payload(&[
                ("type", Value::from("spoofed")),
                ("session_id", Value::from("other")),
                ("ts", Value::from("yesterday")),
                ("artifact_id", Value::from("a-1")),
            ]),
        )?;

        assert_eq!(emitted["type"], "artifact_created");
        assert_eq!(emitted["session_id"], "session-1");
        assert_ne!(emitted["ts"], "yesterday");
        assert_eq!(emitted["artifact_id"], "a-1");
        Ok(())
    }

    #[test]
    fn parallel_requests_never_split_a_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("nested/events.jsonl"), "session-1");

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let writer = writer.clone();
                thread::spawn(move || -> anyhow::Result<()> {
                    for _ in 0..25 {
                        writer.emit("tick", payload(&[("worker", Value::from(worker))]))?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("emitter thread panicked"))??;
        }

        let raw = std::fs::read_to_string(writer.path())?;
        assert_eq!(raw.lines().count(), 200);
        assert_eq!(writer.read_all()?.len(), 200);
        Ok(())
    }

    #[test]
    fn read_all_skips_torn_lines_and_missing_log() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-1");
        assert!(writer.read_all()?.is_empty());

        writer.emit("service_started", EventPayload::new())?;
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"{\"type\": \"request_rec")?;

        let events = writer.read_all()?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "service_started");
        Ok(())
    }
}
