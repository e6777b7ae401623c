//! Control loop over a remote-engine output stream.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Event, EventKind, LogRollup, StreamParser};
use crate::journal::RunJournal;

/// Totals for one followed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FollowStats {
    pub lines: u64,
    pub events: u64,
    pub progress_events: u64,
    pub tasks_updated: u64,
    pub malformed: u64,
    /// True when the stream ended because of cancellation.
    pub cancelled: bool,
}

/// Read `reader` line by line until EOF or cancellation. Each line is parsed,
/// progress is applied to `journal`, the display line goes through `rollup`,
/// and `on_event` sees every event in arrival order.
///
/// This loop is the only writer to the journal and the rollup while it runs.
pub async fn follow_stream<R, F>(
    reader: R,
    parser: &mut StreamParser,
    journal: &mut RunJournal,
    rollup: &mut LogRollup,
    cancel: &CancellationToken,
    mut on_event: F,
) -> std::io::Result<FollowStats>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&Event),
{
    let mut stats = FollowStats::default();
    let malformed_before = parser.stats().malformed;
    let mut lines = reader.lines();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("follow cancelled");
                stats.cancelled = true;
                break;
            }
            next = lines.next_line() => next?,
        };
        let Some(line) = next else {
            break;
        };
        stats.lines += 1;

        let Some(event) = parser.parse_line(&line) else {
            continue;
        };
        stats.events += 1;
        if event.kind() == EventKind::Progress {
            stats.progress_events += 1;
            if parser.apply(&event, journal) {
                stats.tasks_updated += 1;
            }
        }
        rollup.push(event.line());
        on_event(&event);
    }

    stats.malformed = parser.stats().malformed - malformed_before;
    info!(
        lines = stats.lines,
        events = stats.events,
        progress = stats.progress_events,
        malformed = stats.malformed,
        cancelled = stats.cancelled,
        "finished following remote output"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{RunStatus, TaskKey};
    use tokio::io::BufReader;

    const STREAM: &str = r#"TASK [[run:lb-worker-1] Run benchmark tests=["cpu"]] ****
ok: [node-a] => {"msg": "LB_EVENT {\"run_id\": \"r1\", \"host\": \"node-a\", \"workload\": \"cpu\", \"repetition\": 1, \"total_repetitions\": 2, \"status\": \"running\"}"}
{"host": "node-a", "task": "[run:lb-worker-1] Poll LB_EVENT stream", "duration_s": 1.0}
{"host": "node-a", "task": "[run:lb-worker-1] Poll LB_EVENT stream", "duration_s": 1.0}
    "msg": "LB_EVENT {broken"
ok: [node-a] => {"msg": "LB_EVENT {\"run_id\": \"r1\", \"host\": \"node-a\", \"workload\": \"cpu\", \"repetition\": 1, \"total_repetitions\": 2, \"status\": \"completed\"}"}
{"host": "node-a", "task": "[run:lb-worker-1] Poll LB_EVENT stream", "duration_s": 1.0}
"#;

    #[tokio::test]
    async fn test_follow_updates_journal_and_rollup() {
        let mut parser = StreamParser::new();
        let mut journal = RunJournal::new("r1");
        journal.get_task("node-a", "cpu", 1);
        journal.get_task("node-a", "cpu", 2);
        let mut rollup = LogRollup::default();
        let mut seen = Vec::new();

        let stats = follow_stream(
            BufReader::new(STREAM.as_bytes()),
            &mut parser,
            &mut journal,
            &mut rollup,
            &CancellationToken::new(),
            |event| seen.push(event.kind()),
        )
        .await
        .unwrap();

        assert_eq!(stats.lines, 7);
        assert_eq!(stats.events, 6);
        assert_eq!(stats.progress_events, 2);
        assert_eq!(stats.malformed, 1);
        assert!(!stats.cancelled);
        assert_eq!(seen[0], EventKind::TaskStart);

        let task = journal.task(&TaskKey::new("node-a", "cpu", 1)).unwrap();
        assert_eq!(task.status, RunStatus::Completed);

        let lines: Vec<_> = rollup.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "• [run:lb-worker-1] (node-a) Polling loop poll x3 3.0s");
    }

    #[tokio::test]
    async fn test_cancelled_follow_stops() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (reader, _writer) = tokio::io::duplex(64);

        let stats = follow_stream(
            BufReader::new(reader),
            &mut StreamParser::new(),
            &mut RunJournal::new("r"),
            &mut LogRollup::default(),
            &cancel,
            |_| {},
        )
        .await
        .unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.lines, 0);
    }
}
