//! Folding of high-frequency polling steps into running counters.
//!
//! Known polling and delay steps are merged per (phase, host) into one
//! `Polling loop ...` line that is rewritten in place. Everything else,
//! including failed or unreachable polls, passes through as its own line.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::render::{split_display, unescape_brackets};

/// Base names counted as polls.
pub const POLL_TASKS: &[&str] = &[
    "Poll LB_EVENT stream",
    "Poll benchmark progress",
    "Check workload status",
];

/// Base names counted as delays between polls.
pub const DELAY_TASKS: &[&str] = &[
    "Delay before next poll",
    "Wait before next poll",
    "Sleep between polls",
];

/// Default number of buffered lines.
pub const DEFAULT_MAX_LINES: usize = 2000;

const SUMMARY_LABEL: &str = "Polling loop";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupMode {
    /// One synthesized line per (phase, host).
    #[default]
    Summary,
    /// One line per (phase, host, task, status class).
    Verbose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Category {
    Poll,
    Delay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StatusClass {
    Done,
    Skipped,
}

/// Counter key: (phase, host, base name, status class).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RollupKey {
    phase: Option<String>,
    host: Option<String>,
    base: String,
    class: StatusClass,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    count: u64,
    total_seconds: f64,
}

/// What owns a buffered line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LineKey {
    Summary {
        phase: Option<String>,
        host: Option<String>,
    },
    Verbose(RollupKey),
}

/// What `push` did with a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupAction {
    /// Added as a new buffer line at this index.
    Appended(usize),
    /// Rewrote the buffer line at this index.
    Updated(usize),
    /// Counted or ignored without touching the buffer.
    Absorbed,
}

/// Incremental line aggregator for a live log view.
#[derive(Debug)]
pub struct LogRollup {
    mode: RollupMode,
    max_lines: usize,
    lines: VecDeque<String>,
    /// Keys of rolled-up lines, parallel to `lines`.
    owners: VecDeque<Option<LineKey>>,
    index: HashMap<LineKey, usize>,
    counters: HashMap<RollupKey, Accumulator>,
}

impl Default for LogRollup {
    fn default() -> Self {
        Self::new(RollupMode::default())
    }
}

impl LogRollup {
    pub fn new(mode: RollupMode) -> Self {
        Self::with_capacity(mode, DEFAULT_MAX_LINES)
    }

    pub fn with_capacity(mode: RollupMode, max_lines: usize) -> Self {
        Self {
            mode,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
            owners: VecDeque::new(),
            index: HashMap::new(),
            counters: HashMap::new(),
        }
    }

    pub fn mode(&self) -> RollupMode {
        self.mode
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Drop all lines and counters.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.owners.clear();
        self.index.clear();
        self.counters.clear();
    }

    /// Feed one rendered display line.
    pub fn push(&mut self, line: &str) -> RollupAction {
        let parts = split_display(line);
        let message = unescape_brackets(parts.message);
        let (base, suffix) = split_suffix(&message);

        if category_of(base).is_none() {
            return self.append(line.to_string(), None);
        }
        let (class, seconds) = match suffix {
            Suffix::DoneIn(seconds) => (StatusClass::Done, seconds),
            Suffix::Skipped => (StatusClass::Skipped, 0.0),
            Suffix::Failed => return self.append(line.to_string(), None),
            // A bare start announcement of a polling step carries nothing.
            Suffix::None => return RollupAction::Absorbed,
        };

        let key = RollupKey {
            phase: parts.phase.map(str::to_string),
            host: parts.host.map(str::to_string),
            base: base.to_string(),
            class,
        };
        let acc = self.counters.entry(key.clone()).or_default();
        acc.count += 1;
        acc.total_seconds += seconds;
        let acc = *acc;

        let (line_key, text) = match self.mode {
            RollupMode::Summary => {
                let text = format!("{}{}", parts.prefix, self.summary_text(&key.phase, &key.host));
                (
                    LineKey::Summary {
                        phase: key.phase.clone(),
                        host: key.host.clone(),
                    },
                    text,
                )
            }
            RollupMode::Verbose => {
                let text = match class {
                    StatusClass::Done => format!(
                        "{}{} x{} done in {:.1}s",
                        parts.prefix, key.base, acc.count, acc.total_seconds
                    ),
                    StatusClass::Skipped => {
                        format!("{}{} x{} skipped", parts.prefix, key.base, acc.count)
                    }
                };
                (LineKey::Verbose(key), text)
            }
        };

        match self.index.get(&line_key) {
            Some(&idx) => {
                self.lines[idx] = text;
                RollupAction::Updated(idx)
            }
            None => self.append(text, Some(line_key)),
        }
    }

    /// `Polling loop poll xN Ts delay xM Us skipped xK`, zero parts omitted.
    fn summary_text(&self, phase: &Option<String>, host: &Option<String>) -> String {
        let mut poll = Accumulator::default();
        let mut delay = Accumulator::default();
        let mut skipped = 0u64;
        for (key, acc) in &self.counters {
            if &key.phase != phase || &key.host != host {
                continue;
            }
            match (key.class, category_of(&key.base)) {
                (StatusClass::Skipped, _) => skipped += acc.count,
                (StatusClass::Done, Some(Category::Poll)) => {
                    poll.count += acc.count;
                    poll.total_seconds += acc.total_seconds;
                }
                (StatusClass::Done, Some(Category::Delay)) => {
                    delay.count += acc.count;
                    delay.total_seconds += acc.total_seconds;
                }
                (StatusClass::Done, None) => {}
            }
        }

        let mut text = String::from(SUMMARY_LABEL);
        if poll.count > 0 {
            text.push_str(&format!(" poll x{} {:.1}s", poll.count, poll.total_seconds));
        }
        if delay.count > 0 {
            text.push_str(&format!(" delay x{} {:.1}s", delay.count, delay.total_seconds));
        }
        if skipped > 0 {
            text.push_str(&format!(" skipped x{}", skipped));
        }
        text
    }

    fn append(&mut self, text: String, owner: Option<LineKey>) -> RollupAction {
        if let Some(key) = &owner {
            self.index.insert(key.clone(), self.lines.len());
        }
        self.lines.push_back(text);
        self.owners.push_back(owner);

        if self.lines.len() > self.max_lines {
            let excess = self.lines.len() - self.max_lines;
            self.lines.drain(..excess);
            self.owners.drain(..excess);
            self.rebuild_index();
        }
        RollupAction::Appended(self.lines.len() - 1)
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .owners
            .iter()
            .enumerate()
            .filter_map(|(i, owner)| owner.clone().map(|key| (key, i)))
            .collect();
    }
}

enum Suffix {
    DoneIn(f64),
    Skipped,
    Failed,
    None,
}

/// Split a message into its base task name and status suffix.
fn split_suffix(message: &str) -> (&str, Suffix) {
    let message = message.trim();
    if let Some((base, rest)) = message.rsplit_once(" done in ") {
        if let Some(seconds) = rest.strip_suffix('s').and_then(|s| s.parse::<f64>().ok()) {
            return (base.trim(), Suffix::DoneIn(seconds));
        }
    }
    if let Some(base) = message.strip_suffix(" skipped") {
        return (base.trim(), Suffix::Skipped);
    }
    if let Some(base) = message
        .strip_suffix(" failed")
        .or_else(|| message.strip_suffix(" unreachable"))
    {
        return (base.trim(), Suffix::Failed);
    }
    (message, Suffix::None)
}

fn category_of(base: &str) -> Option<Category> {
    if POLL_TASKS.contains(&base) {
        Some(Category::Poll)
    } else if DELAY_TASKS.contains(&base) {
        Some(Category::Delay)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(rollup: &mut LogRollup, lines: &[&str]) {
        for line in lines {
            rollup.push(line);
        }
    }

    fn buffer(rollup: &LogRollup) -> Vec<String> {
        rollup.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_summary_collapses_polls_for_any_n() {
        for n in [1usize, 3, 10, 50] {
            let mut rollup = LogRollup::default();
            for _ in 0..n {
                rollup.push("Poll LB_EVENT stream done in 1.0s");
            }
            assert_eq!(
                buffer(&rollup),
                vec![format!("Polling loop poll x{} {:.1}s", n, n as f64)]
            );
        }
    }

    #[test]
    fn test_summary_mixes_polls_delays_and_skips() {
        let mut rollup = LogRollup::default();
        feed(
            &mut rollup,
            &[
                "• [run:w1] (node-a) Run workload done in 30.0s",
                "• [run:w1] (node-a) Poll LB_EVENT stream done in 1.0s",
                "• [run:w1] (node-a) Delay before next poll done in 5.0s",
                "• [run:w1] (node-a) Poll LB_EVENT stream done in 1.5s",
                "• [run:w1] (node-a) Delay before next poll skipped",
                "• [run:w1] (node-b) Poll LB_EVENT stream done in 2.0s",
            ],
        );
        assert_eq!(
            buffer(&rollup),
            vec![
                "• [run:w1] (node-a) Run workload done in 30.0s",
                "• [run:w1] (node-a) Polling loop poll x2 2.5s delay x1 5.0s skipped x1",
                "• [run:w1] (node-b) Polling loop poll x1 2.0s",
            ]
        );
    }

    #[test]
    fn test_parenthesized_message_is_not_taken_for_a_host() {
        use crate::events::render::bullet;

        let mut rollup = LogRollup::default();
        let cached = bullet(Some("run:w1"), None, "(cached) Poll LB_EVENT stream done in 1.0s");
        feed(
            &mut rollup,
            &[
                "• [run:w1] (cached) Poll LB_EVENT stream done in 1.0s",
                cached.as_str(),
                bullet(Some("run:w1"), None, "Poll LB_EVENT stream done in 2.0s").as_str(),
            ],
        );
        assert_eq!(
            buffer(&rollup),
            vec![
                "• [run:w1] (cached) Polling loop poll x1 1.0s".to_string(),
                cached.clone(),
                "• [run:w1] Polling loop poll x1 2.0s".to_string(),
            ]
        );
    }

    #[test]
    fn test_failures_are_never_merged() {
        let mut rollup = LogRollup::default();
        feed(
            &mut rollup,
            &[
                "Poll LB_EVENT stream done in 1.0s",
                "Poll LB_EVENT stream failed",
                "Poll LB_EVENT stream unreachable",
                "Poll LB_EVENT stream done in 1.0s",
                "Poll LB_EVENT stream failed",
            ],
        );
        assert_eq!(
            buffer(&rollup),
            vec![
                "Polling loop poll x2 2.0s",
                "Poll LB_EVENT stream failed",
                "Poll LB_EVENT stream unreachable",
                "Poll LB_EVENT stream failed",
            ]
        );
    }

    #[test]
    fn test_verbose_mode_one_line_per_class() {
        let mut rollup = LogRollup::new(RollupMode::Verbose);
        feed(
            &mut rollup,
            &[
                "• [run:w1] Poll LB_EVENT stream done in 1.0s",
                "• [run:w1] Delay before next poll skipped",
                "• [run:w1] Poll LB_EVENT stream done in 2.0s",
                "• [run:w1] Delay before next poll skipped",
            ],
        );
        assert_eq!(
            buffer(&rollup),
            vec![
                "• [run:w1] Poll LB_EVENT stream x2 done in 3.0s",
                "• [run:w1] Delay before next poll x2 skipped",
            ]
        );
    }

    #[test]
    fn test_start_announcements_are_absorbed() {
        let mut rollup = LogRollup::default();
        assert_eq!(rollup.push("• [run:w1] Poll LB_EVENT stream"), RollupAction::Absorbed);
        assert_eq!(rollup.push("• [run:w1] Something else"), RollupAction::Appended(0));
        assert_eq!(rollup.push("• [run:w1] Poll LB_EVENT stream done in 1.0s"), RollupAction::Appended(1));
        assert_eq!(rollup.push("• [run:w1] Poll LB_EVENT stream done in 1.0s"), RollupAction::Updated(1));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let stream = [
            "Poll LB_EVENT stream done in 1.0s",
            "other line",
            "Delay before next poll done in 2.0s",
            "Poll LB_EVENT stream done in 1.0s",
        ];
        let mut first = LogRollup::default();
        feed(&mut first, &stream);
        let mut second = LogRollup::default();
        feed(&mut second, &stream);
        assert_eq!(buffer(&first), buffer(&second));
        assert_eq!(buffer(&first)[0], "Polling loop poll x2 2.0s delay x1 2.0s");
    }

    #[test]
    fn test_eviction_rebuilds_index() {
        let mut rollup = LogRollup::with_capacity(RollupMode::Summary, 3);
        feed(
            &mut rollup,
            &["Poll LB_EVENT stream done in 1.0s", "a", "b", "c"],
        );
        // The summary line was evicted; the next poll starts a fresh line
        // that still carries the running totals.
        assert_eq!(rollup.push("Poll LB_EVENT stream done in 1.0s"), RollupAction::Appended(2));
        assert_eq!(buffer(&rollup), vec!["b", "c", "Polling loop poll x2 2.0s"]);

        assert_eq!(rollup.push("Poll LB_EVENT stream done in 1.0s"), RollupAction::Updated(2));
        rollup.push("d");
        assert_eq!(rollup.push("Poll LB_EVENT stream done in 1.0s"), RollupAction::Updated(1));
        assert_eq!(buffer(&rollup), vec!["c", "Polling loop poll x4 4.0s", "d"]);
    }
}
