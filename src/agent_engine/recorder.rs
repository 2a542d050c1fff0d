use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::agent_engine::state::Turn;
use crate::errors::RecorderError;

type Committed = Arc<Vec<Arc<Turn>>>;

/// Written once when a run's directory is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub instruction: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Redacted copy of the effective configuration.
    pub config: serde_json::Value,
}

/// Durable per-run turn log. Only the run's worker holds one.
pub struct RunRecorder {
    run_dir: PathBuf,
    turns_path: PathBuf,
    file: std::fs::File,
    save_snapshots: bool,
    committed: watch::Sender<Committed>,
}

impl RunRecorder {
    /// Creates `<root>/<run_id>/` with `meta.json` and an empty `turns.jsonl`.
    pub fn create(root: &Path, meta: &RunMeta, save_snapshots: bool) -> Result<Self, RecorderError> {
        let run_dir = root.join(&meta.run_id);
        std::fs::create_dir_all(&run_dir)?;
        if save_snapshots {
            std::fs::create_dir_all(run_dir.join("snapshots"))?;
        }
        std::fs::write(run_dir.join("meta.json"), serde_json::to_vec_pretty(meta)?)?;

        let turns_path = run_dir.join("turns.jsonl");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&turns_path)?;
        let (committed, _) = watch::channel(Arc::new(Vec::new()));
        tracing::debug!(run_id = %meta.run_id, dir = %run_dir.display(), "run recorder created");
        Ok(Self {
            run_dir,
            turns_path,
            file,
            save_snapshots,
            committed,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn turns_path(&self) -> &Path {
        &self.turns_path
    }

    /// Reader handle over the committed prefix.
    pub fn log(&self) -> TurnLog {
        TurnLog {
            rx: self.committed.subscribe(),
        }
    }

    pub fn len(&self) -> usize {
        self.committed.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persists the snapshot for turn `index` and returns its reference.
    /// With snapshot saving disabled the reference only names the turn.
    pub fn save_snapshot(&self, index: u32, bytes: &[u8], mime: &str) -> Result<String, RecorderError> {
        if !self.save_snapshots {
            return Ok(format!("unsaved:{index:04}"));
        }
        let ext = match mime {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        };
        let rel = format!("snapshots/{index:04}.{ext}");
        std::fs::write(self.run_dir.join(&rel), bytes)?;
        Ok(rel)
    }

    /// Appends one turn. The index must equal the number of turns already recorded.
    pub fn append(&mut self, turn: Turn) -> Result<(), RecorderError> {
        let expected = self.len() as u32;
        if turn.index != expected {
            return Err(RecorderError::OutOfOrder {
                expected,
                got: turn.index,
            });
        }
        let line = serde_json::to_string(&turn)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;

        // Durable first, visible second: readers never see a turn that is not on disk.
        let turn = Arc::new(turn);
        self.committed.send_modify(|turns| Arc::make_mut(turns).push(turn));
        tracing::debug!(path = %self.turns_path.display(), index = expected, "turn recorded");
        Ok(())
    }

    /// Reads a run log from offset 0, checking that indices run `0..k` without gaps.
    pub fn replay_file(path: &Path) -> Result<Vec<Turn>, RecorderError> {
        let file = std::fs::File::open(path)?;
        let mut turns = Vec::new();
        for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let turn: Turn = serde_json::from_str(&line).map_err(|e| RecorderError::Corrupt {
                line: line_no + 1,
                reason: e.to_string(),
            })?;
            let expected = turns.len() as u32;
            if turn.index != expected {
                return Err(RecorderError::OutOfOrder {
                    expected,
                    got: turn.index,
                });
            }
            turns.push(turn);
        }
        Ok(turns)
    }
}

/// Read-only view of a run's committed turns. Cloning is cheap and reads never
/// touch the file.
#[derive(Clone)]
pub struct TurnLog {
    rx: watch::Receiver<Committed>,
}

impl TurnLog {
    fn snapshot(&self) -> Committed {
        self.rx.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.rx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Turn> {
        let turns = self.snapshot();
        let start = turns.len().saturating_sub(n);
        turns[start..].iter().map(|t| Turn::clone(t)).collect()
    }

    /// Every committed turn in index order.
    pub fn replay(&self) -> Vec<Turn> {
        self.snapshot().iter().map(|t| Turn::clone(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_engine::state::ExecutionResult;
    use crate::protocol::{Action, ActionKind};

    fn meta(run_id: &str) -> RunMeta {
        RunMeta {
            run_id: run_id.into(),
            instruction: "open settings".into(),
            created_at: chrono::Utc::now(),
            config: serde_json::json!({}),
        }
    }

    fn turn(index: u32) -> Turn {
        let now = chrono::Utc::now();
        Turn {
            index,
            snapshot_ref: format!("unsaved:{index:04}"),
            raw_output: "Thought: t\nAction: wait()".into(),
            thought: "t".into(),
            action: Action::new(ActionKind::Wait),
            execution: ExecutionResult::success("waited"),
            injected: Vec::new(),
            parse_attempts: 1,
            cached: false,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn append_is_visible_to_readers_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RunRecorder::create(dir.path(), &meta("r1"), false).unwrap();
        let log = rec.log();
        for i in 0..3 {
            rec.append(turn(i)).unwrap();
        }
        assert_eq!(log.len(), 3);
        let recent: Vec<u32> = log.recent(2).iter().map(|t| t.index).collect();
        assert_eq!(recent, vec![1, 2]);
        assert_eq!(log.recent(10).len(), 3);

        let from_disk = RunRecorder::replay_file(rec.turns_path()).unwrap();
        assert_eq!(from_disk, log.replay());
        assert!(dir.path().join("r1").join("meta.json").exists());
    }

    #[test]
    fn out_of_order_append_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RunRecorder::create(dir.path(), &meta("r2"), false).unwrap();
        rec.append(turn(0)).unwrap();
        let err = rec.append(turn(2)).unwrap_err();
        assert!(matches!(err, RecorderError::OutOfOrder { expected: 1, got: 2 }));
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn reader_snapshot_is_stable_across_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RunRecorder::create(dir.path(), &meta("r3"), false).unwrap();
        rec.append(turn(0)).unwrap();
        let before = rec.log().replay();
        rec.append(turn(1)).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(rec.log().replay().len(), 2);
    }

    #[test]
    fn replay_file_detects_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turns.jsonl");
        let lines = [
            serde_json::to_string(&turn(0)).unwrap(),
            serde_json::to_string(&turn(2)).unwrap(),
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();
        let err = RunRecorder::replay_file(&path).unwrap_err();
        assert!(matches!(err, RecorderError::OutOfOrder { expected: 1, got: 2 }));
    }

    #[test]
    fn replay_file_reports_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turns.jsonl");
        std::fs::write(&path, format!("{}\n{{\"index\":", serde_json::to_string(&turn(0)).unwrap()))
            .unwrap();
        let err = RunRecorder::replay_file(&path).unwrap_err();
        assert!(matches!(err, RecorderError::Corrupt { line: 2, .. }));
    }

    #[test]
    fn snapshots_are_written_under_the_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let rec = RunRecorder::create(dir.path(), &meta("r4"), true).unwrap();
        let rel = rec.save_snapshot(7, b"jpeg", "image/jpeg").unwrap();
        assert_eq!(rel, "snapshots/0007.jpg");
        assert_eq!(std::fs::read(rec.run_dir().join(rel)).unwrap(), b"jpeg");
    }
}
