//! Line classifier for remote-execution output.
//!
//! Recognized shapes, first match wins:
//! 1. task-start markers (`TASK [...]`), phase tag found by bracket matching
//! 2. inline progress payloads, bare or inside a `{"msg": "..."}` wrapper
//! 3. task-timing payloads (`duration_s`)
//! 4. generic `"msg"` lines and host status lines
//!
//! Anything else renders under the current phase/host context, or is dropped
//! when no context has been set.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::render::{bullet, find_matching_bracket, split_phase_tag, strip_module_qualifier};
use super::{Event, EventError, ProgressUpdate, TaskTiming, TimingOutcome};
use crate::journal::{RunJournal, RunStatus, TaskKey, META_REPETITIONS};

/// Prefix the remote playbooks put in front of progress payloads.
pub const PROGRESS_MARKER: &str = "LB_EVENT";

const TASK_MARKERS: &[&str] = &["TASK [", "RUNNING HANDLER ["];
const STATUS_PREFIXES: &[&str] = &["ok", "changed", "skipping", "failed", "fatal", "unreachable"];
const MAX_UNESCAPE_PASSES: usize = 3;
const SNIPPET_LEN: usize = 120;

/// Counters over everything the parser has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParserStats {
    pub lines: u64,
    pub events: u64,
    pub malformed: u64,
    pub dropped: u64,
}

/// Result of decoding a structured payload.
enum Structured {
    Event(Event),
    /// Free text from a generic debug message.
    Message(String),
}

/// Stateful classifier. The phase and host context are set by the caller and
/// only used to render lines that do not carry their own.
#[derive(Debug, Default)]
pub struct StreamParser {
    phase: Option<String>,
    host: Option<String>,
    stats: ParserStats,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_phase(&mut self, phase: impl Into<String>) {
        self.phase = Some(phase.into());
    }

    pub fn clear_phase(&mut self) {
        self.phase = None;
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = Some(host.into());
    }

    pub fn clear_host(&mut self) {
        self.host = None;
    }

    pub fn phase(&self) -> Option<&str> {
        self.phase.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Classify one line. Malformed structured lines are logged and dropped.
    pub fn parse_line(&mut self, line: &str) -> Option<Event> {
        self.stats.lines += 1;
        match self.try_parse_line(line) {
            Ok(Some(event)) => {
                self.stats.events += 1;
                Some(event)
            }
            Ok(None) => {
                self.stats.dropped += 1;
                None
            }
            Err(e) => {
                self.stats.malformed += 1;
                warn!(error = %e, line = %snippet(line), "dropping malformed event line");
                None
            }
        }
    }

    /// Classify one line, reporting malformed payloads as errors.
    pub fn try_parse_line(&self, line: &str) -> Result<Option<Event>, EventError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        if let Some(event) = self.parse_task_start(trimmed) {
            return Ok(Some(event));
        }

        let status = parse_status_prefix(trimmed);
        match self.parse_structured(trimmed)? {
            Some(Structured::Event(event)) => return Ok(Some(event)),
            Some(Structured::Message(text)) => {
                return Ok(Some(match status {
                    Some((status, host)) => self.status_line(status, host, Some(&text)),
                    None => self.generic(&text),
                }))
            }
            None => {}
        }

        if let Some((status, host)) = status {
            return Ok(Some(self.status_line(status, host, None)));
        }

        if self.phase.is_none() && self.host.is_none() {
            debug!(line = %snippet(trimmed), "no phase or host context, dropping line");
            return Ok(None);
        }
        Ok(Some(self.generic(trimmed)))
    }

    /// Apply a progress event to the journal. Returns whether a task changed.
    ///
    /// Tasks that were never planned are created on the fly and flagged.
    pub fn apply(&self, event: &Event, journal: &mut RunJournal) -> bool {
        let Event::Progress { update, .. } = event else {
            return false;
        };
        if let Some(run_id) = update.run_id.as_deref() {
            // An anonymous journal accepts progress from any run.
            if !journal.run_id.is_empty() && run_id != journal.run_id {
                warn!(
                    event_run_id = run_id,
                    journal_run_id = %journal.run_id,
                    "ignoring progress event for a different run"
                );
                return false;
            }
        }

        let key = TaskKey::new(&update.host, &update.workload, update.repetition);
        if !journal.contains(&key) {
            warn!(task = %key, "progress event for an unplanned task, tracking it");
        }
        if let Some(total) = update.total_repetitions {
            if journal.repetitions().is_none() {
                journal
                    .metadata
                    .insert(META_REPETITIONS.to_string(), Value::from(total));
            }
        }

        let task = journal.get_task(&update.host, &update.workload, update.repetition);
        let mut changed = task.apply_status(update.status, Utc::now());
        if let Some(message) = &update.message {
            task.current_action = Some(message.clone());
            changed = true;
        }
        if let Some(error_type) = &update.error_type {
            task.record_error(error_type.as_str(), update.error_context.clone().unwrap_or_default());
            changed = true;
        } else if let Some(context) = &update.error_context {
            task.error_context = Some(context.clone());
            changed = true;
        }
        debug!(task = %key, status = %update.status, changed, "applied progress event");
        changed
    }

    /// `parse_line` followed by `apply`.
    pub fn handle_line(&mut self, line: &str, journal: &mut RunJournal) -> Option<Event> {
        let event = self.parse_line(line)?;
        self.apply(&event, journal);
        Some(event)
    }

    // -----------------------------------------------------------------------
    // Shapes
    // -----------------------------------------------------------------------

    fn parse_task_start(&self, line: &str) -> Option<Event> {
        let marker = TASK_MARKERS.iter().find(|m| line.starts_with(*m))?;
        let open = marker.len() - 1;
        let close = find_matching_bracket(line, open)
            .or_else(|| line.rfind(']').filter(|&c| c > open))?;
        let name = strip_module_qualifier(line[open + 1..close].trim());

        let (phase, label) = match split_phase_tag(name) {
            Some((tag, label)) => (Some(tag.to_string()), label.to_string()),
            None => (self.phase.clone(), name.to_string()),
        };
        let line = bullet(phase.as_deref(), self.host.as_deref(), &label);
        Some(Event::TaskStart {
            phase,
            task_label: label,
            line,
        })
    }

    fn parse_structured(&self, line: &str) -> Result<Option<Structured>, EventError> {
        // Multi-line debug output puts the message on a line of its own.
        if let Some(rest) = line.strip_prefix("\"msg\":") {
            let text = decode_string_literal(rest.trim().trim_end_matches(','));
            return self.classify_message(&text).map(Some);
        }

        if !line.contains('{') {
            return Ok(None);
        }
        match decode_object(line) {
            Some(object) => self.classify_object(&object),
            None if line.contains(PROGRESS_MARKER) => Err(EventError::malformed(
                "progress",
                "payload is not valid JSON even after unescaping",
            )),
            None if line.contains("duration_s") => Err(EventError::malformed(
                "task_timing",
                "payload is not valid JSON even after unescaping",
            )),
            None => Ok(None),
        }
    }

    fn classify_object(&self, object: &Map<String, Value>) -> Result<Option<Structured>, EventError> {
        if is_progress(object) {
            return self.progress_event(object).map(|e| Some(Structured::Event(e)));
        }
        if object.contains_key("duration_s") {
            return self.timing_event(object).map(|e| Some(Structured::Event(e)));
        }
        match object.get("msg") {
            Some(Value::String(text)) => self.classify_message(text).map(Some),
            Some(Value::Object(inner)) => self.classify_object(inner),
            _ => Ok(None),
        }
    }

    /// Text of a debug message: either a wrapped payload or free text.
    fn classify_message(&self, text: &str) -> Result<Structured, EventError> {
        let text = text.trim();
        let marked = text.starts_with(PROGRESS_MARKER);
        let payload = if marked {
            text[PROGRESS_MARKER.len()..].trim_start()
        } else {
            text
        };

        if marked || payload.starts_with('{') {
            if let Some(object) = decode_object(payload) {
                if is_progress(&object) {
                    return self.progress_event(&object).map(Structured::Event);
                }
                if object.contains_key("duration_s") {
                    return self.timing_event(&object).map(Structured::Event);
                }
            }
            if marked {
                return Err(EventError::malformed(
                    "progress",
                    format!("cannot decode payload: {}", snippet(payload)),
                ));
            }
        }
        Ok(Structured::Message(text.to_string()))
    }

    fn progress_event(&self, object: &Map<String, Value>) -> Result<Event, EventError> {
        let missing = |field: &str| EventError::malformed("progress", format!("missing field '{}'", field));

        let host = str_field(object, "host")
            .or_else(|| self.host.clone())
            .ok_or_else(|| missing("host"))?;
        let workload = str_field(object, "workload").ok_or_else(|| missing("workload"))?;
        let repetition = u32_field(object, "repetition")
            .filter(|r| *r > 0)
            .ok_or_else(|| EventError::malformed("progress", "repetition must be a positive integer"))?;
        let raw_status = str_field(object, "status").ok_or_else(|| missing("status"))?;
        let status: RunStatus = raw_status
            .parse()
            .map_err(|reason: String| EventError::malformed("progress", reason))?;

        let update = ProgressUpdate {
            run_id: str_field(object, "run_id"),
            host,
            workload,
            repetition,
            total_repetitions: u32_field(object, "total_repetitions"),
            status,
            message: str_field(object, "message").or_else(|| str_field(object, "current_action")),
            error_type: str_field(object, "error_type"),
            error_context: str_field(object, "error_context"),
        };

        let mut text = match update.total_repetitions {
            Some(total) => format!("{} rep {}/{} {}", update.workload, update.repetition, total, update.status),
            None => format!("{} rep {} {}", update.workload, update.repetition, update.status),
        };
        if let Some(message) = &update.message {
            text.push_str(": ");
            text.push_str(message);
        }
        let line = bullet(self.phase.as_deref(), Some(&update.host), &text);
        Ok(Event::Progress { update, line })
    }

    fn timing_event(&self, object: &Map<String, Value>) -> Result<Event, EventError> {
        let task = str_field(object, "task")
            .ok_or_else(|| EventError::malformed("task_timing", "missing field 'task'"))?;
        let duration = object
            .get("duration_s")
            .and_then(number)
            .filter(|d| d.is_finite() && *d >= 0.0)
            .ok_or_else(|| EventError::malformed("task_timing", "duration_s must be a non-negative number"))?;
        let outcome = match str_field(object, "status") {
            Some(raw) => TimingOutcome::from_wire(&raw).ok_or_else(|| {
                EventError::malformed("task_timing", format!("unknown status '{}'", raw))
            })?,
            None => TimingOutcome::Done,
        };
        let host = str_field(object, "host").or_else(|| self.host.clone());

        let name = strip_module_qualifier(task.trim());
        let (phase, label) = match split_phase_tag(name) {
            Some((tag, label)) => (Some(tag.to_string()), strip_label_module(label).to_string()),
            None => (self.phase.clone(), name.to_string()),
        };

        let text = match outcome {
            TimingOutcome::Done => format!("{} done in {:.1}s", label, duration),
            TimingOutcome::Skipped => format!("{} skipped", label),
            TimingOutcome::Failed => format!("{} failed", label),
            TimingOutcome::Unreachable => format!("{} unreachable", label),
        };
        let line = bullet(phase.as_deref(), host.as_deref(), &text);
        Ok(Event::TaskTiming {
            timing: TaskTiming {
                host,
                phase,
                task_label: label,
                duration_seconds: duration,
                outcome,
            },
            line,
        })
    }

    fn status_line(&self, status: &str, host: &str, message: Option<&str>) -> Event {
        let text = match message {
            Some(message) => format!("{}: {}", status, message),
            None => status.to_string(),
        };
        Event::StatusLine {
            host: host.to_string(),
            status: status.to_string(),
            line: bullet(self.phase.as_deref(), Some(host), &text),
        }
    }

    fn generic(&self, text: &str) -> Event {
        Event::PlainLog {
            line: bullet(self.phase.as_deref(), self.host.as_deref(), text),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding helpers
// ---------------------------------------------------------------------------

fn is_progress(object: &Map<String, Value>) -> bool {
    object.contains_key("workload") && object.contains_key("repetition")
}

/// `ok: [host]`, `fatal: [host]: UNREACHABLE! => ...` and friends.
fn parse_status_prefix(line: &str) -> Option<(&str, &str)> {
    let (status, rest) = line.split_once(": [")?;
    if !STATUS_PREFIXES.contains(&status) {
        return None;
    }
    let host = rest.split(']').next()?;
    let host = host.split(" -> ").next().unwrap_or(host).trim();
    (!host.is_empty()).then_some((status, host))
}

/// `[phase] role : label` keeps only `label` when `role` is a single token.
fn strip_label_module(label: &str) -> &str {
    match label.split_once(" : ") {
        Some((module, rest))
            if !module.is_empty()
                && module
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "_-.".contains(c)) =>
        {
            rest.trim_start()
        }
        _ => label,
    }
}

/// Decode a JSON string literal, or undo backslash escaping by hand when the
/// literal is not valid JSON.
fn decode_string_literal(raw: &str) -> String {
    if let Ok(text) = serde_json::from_str::<String>(raw) {
        return text;
    }
    let inner = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);
    unescape(inner)
}

/// Find and decode a JSON object in `text`, peeling off up to
/// [`MAX_UNESCAPE_PASSES`] levels of residual backslash escaping.
fn decode_object(text: &str) -> Option<Map<String, Value>> {
    let mut candidate = text.to_string();
    for _ in 0..MAX_UNESCAPE_PASSES {
        if let Some(object) = object_in(&candidate) {
            return Some(object);
        }
        let next = unescape(&candidate);
        if next == candidate {
            return None;
        }
        candidate = next;
    }
    None
}

fn object_in(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let widest = text.rfind('}').filter(|&end| end > start);
    let balanced = balanced_brace_end(text, start);
    [widest, balanced]
        .into_iter()
        .flatten()
        .find_map(|end| match serde_json::from_str::<Value>(&text[start..=end]) {
            Ok(Value::Object(object)) => Some(object),
            _ => None,
        })
}

/// Closing brace for the `{` at `start`, counting braces only.
fn balanced_brace_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Undo one level of backslash escaping.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn str_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn u32_field(object: &Map<String, Value>, key: &str) -> Option<u32> {
    match object.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn snippet(line: &str) -> &str {
    let mut end = line.len().min(SNIPPET_LEN);
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}
