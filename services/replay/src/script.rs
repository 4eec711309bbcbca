//! Recorded event logs and the cursor that replays them.
//!
//! A log is JSON lines. Each line carries an `offset_ms` from the start of the
//! recording and either a protocol `event` object or a `transport_error`
//! string that simulates the transport dropping. Blank lines and lines starting
//! with `#` are skipped.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::io::BufRead;
use std::path::Path;
use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayAction {
    /// Raw JSON of a protocol event, sent as-is.
    Event(String),
    TransportError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayStep {
    pub offset: Duration,
    pub action: ReplayAction,
}

#[derive(Deserialize)]
struct RawLine {
    offset_ms: u64,
    #[serde(default)]
    event: Option<serde_json::Value>,
    #[serde(default)]
    transport_error: Option<String>,
}

/// Parses an event log. Offsets must not decrease.
pub fn parse_log(reader: impl BufRead) -> Result<Vec<ReplayStep>> {
    let mut steps: Vec<ReplayStep> = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let number = index + 1;
        let line = line.with_context(|| format!("Failed to read line {}", number))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let raw: RawLine = serde_json::from_str(trimmed)
            .with_context(|| format!("Line {} is not a valid replay entry", number))?;
        let action = match (raw.event, raw.transport_error) {
            (Some(event), None) => {
                if event.get("type").and_then(|t| t.as_str()).is_none() {
                    bail!("Line {}: event has no \"type\"", number);
                }
                ReplayAction::Event(event.to_string())
            }
            (None, Some(reason)) => ReplayAction::TransportError(reason),
            _ => bail!(
                "Line {}: expected exactly one of \"event\" or \"transport_error\"",
                number
            ),
        };

        let offset = Duration::from_millis(raw.offset_ms);
        if let Some(previous) = steps.last() {
            if offset < previous.offset {
                bail!("Line {}: offset_ms goes backwards", number);
            }
        }
        steps.push(ReplayStep { offset, action });
    }
    Ok(steps)
}

pub fn load(path: &Path) -> Result<Vec<ReplayStep>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open event log {}", path.display()))?;
    parse_log(std::io::BufReader::new(file))
        .with_context(|| format!("Failed to parse event log {}", path.display()))
}

/// Shared replay position. Every peer created during a session (including
/// after a reconnection) continues from where the previous one stopped.
pub struct ReplayScript {
    steps: Vec<ReplayStep>,
    speed: f64,
    cursor: Mutex<usize>,
    done: AtomicBool,
    done_notify: Notify,
}

impl ReplayScript {
    pub fn new(steps: Vec<ReplayStep>, speed: f64) -> Self {
        let done = steps.is_empty();
        Self {
            steps,
            speed,
            cursor: Mutex::new(0),
            done: AtomicBool::new(done),
            done_notify: Notify::new(),
        }
    }

    /// The next step and how long to wait before it, scaled by the speed.
    pub fn next_step(&self) -> Option<(Duration, ReplayAction)> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let index = *cursor;
        let step = self.steps.get(index)?;
        let previous = match index {
            0 => Duration::ZERO,
            _ => self.steps[index - 1].offset,
        };
        *cursor += 1;
        let delay = step.offset.saturating_sub(previous).div_f64(self.speed);
        Some((delay, step.action.clone()))
    }

    pub fn remaining(&self) -> usize {
        let cursor = *self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        self.steps.len().saturating_sub(cursor)
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.done_notify.notify_waiters();
    }

    /// Resolves once every step has been delivered.
    pub async fn finished(&self) {
        loop {
            let notified = self.done_notify.notified();
            if self.done.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LOG: &str = r#"
# captured at the front desk
{"offset_ms": 0, "event": {"type": "input_audio_buffer.speech_started"}}
{"offset_ms": 3000, "event": {"type": "input_audio_buffer.speech_stopped"}}

{"offset_ms": 3200, "transport_error": "ice failed"}
"#;

    #[test]
    fn test_parse_log_skips_comments_and_blanks() {
        let steps = parse_log(LOG.as_bytes()).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].offset, Duration::from_millis(3000));
        assert!(matches!(&steps[0].action, ReplayAction::Event(raw) if raw.contains("speech_started")));
        assert_eq!(
            steps[2].action,
            ReplayAction::TransportError("ice failed".to_string())
        );
    }

    #[test]
    fn test_parse_log_rejects_bad_lines() {
        let backwards = r#"{"offset_ms": 10, "event": {"type": "response.done"}}
{"offset_ms": 5, "event": {"type": "response.done"}}"#;
        let err = parse_log(backwards.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Line 2"));

        let both = r#"{"offset_ms": 0, "event": {"type": "response.done"}, "transport_error": "x"}"#;
        assert!(parse_log(both.as_bytes()).is_err());

        let untyped = r#"{"offset_ms": 0, "event": {"delta": "hi"}}"#;
        assert!(parse_log(untyped.as_bytes()).is_err());

        assert!(parse_log("not json".as_bytes()).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LOG.as_bytes()).unwrap();

        let steps = load(file.path()).unwrap();
        assert_eq!(steps.len(), 3);

        let missing = load(Path::new("/definitely/not/here.jsonl")).unwrap_err();
        assert!(format!("{:#}", missing).contains("Failed to open"));
    }

    #[test]
    fn test_cursor_scales_delays() {
        let script = ReplayScript::new(parse_log(LOG.as_bytes()).unwrap(), 2.0);
        assert_eq!(script.remaining(), 3);

        let (delay, _) = script.next_step().unwrap();
        assert_eq!(delay, Duration::ZERO);
        let (delay, _) = script.next_step().unwrap();
        assert_eq!(delay, Duration::from_millis(1500));
        let (delay, action) = script.next_step().unwrap();
        assert_eq!(delay, Duration::from_millis(100));
        assert!(matches!(action, ReplayAction::TransportError(_)));
        assert!(script.next_step().is_none());
        assert_eq!(script.remaining(), 0);
    }

    #[tokio::test]
    async fn test_finished_resolves_after_mark_done() {
        let script = std::sync::Arc::new(ReplayScript::new(parse_log(LOG.as_bytes()).unwrap(), 1.0));
        let waiter = tokio::spawn({
            let script = script.clone();
            async move { script.finished().await }
        });
        tokio::task::yield_now().await;
        script.mark_done();
        waiter.await.unwrap();

        // An empty script is finished from the start.
        ReplayScript::new(Vec::new(), 1.0).finished().await;
    }
}
