//! Periodic durable snapshots of an operator graph's state (§4.10,
//! component C10).
//!
//! Grounded on `metadata::write_file_atomic` for the temp-file-plus-rename
//! idiom: write into `.<id>.tmp.<pid>` beside the target, `sync_all`, then
//! `fs::rename`. Atomicity is file-granularity only, same caveat the spec
//! states explicitly -- it is not a cross-node guarantee.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as StateValue;

use crate::error::{FluxError, Result};
use crate::operators::OperatorState;

/// Walks a set of named operators, collecting and persisting
/// `snapshot_state()` under a caller-chosen checkpoint id, and can dispatch
/// a previously persisted snapshot back out via `restore_state()`.
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    operators: Vec<Arc<dyn OperatorState>>,
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: impl Into<PathBuf>, operators: Vec<Arc<dyn OperatorState>>) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.into();
        std::fs::create_dir_all(&checkpoint_dir)?;
        Ok(Self { checkpoint_dir, operators })
    }

    fn path_for(&self, checkpoint_id: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{checkpoint_id}.json"))
    }

    /// Collects `snapshot_state()` from every registered operator and writes
    /// the result atomically.
    pub fn checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let mut snapshot = HashMap::with_capacity(self.operators.len());
        for operator in &self.operators {
            snapshot.insert(operator.name().to_string(), operator.snapshot());
        }
        let encoded = serde_json::to_vec_pretty(&snapshot).map_err(|e| FluxError::Serialization(e.to_string()))?;
        write_atomic(&self.path_for(checkpoint_id), &encoded)?;
        tracing::info!(checkpoint_id, operators = self.operators.len(), "checkpoint written");
        Ok(())
    }

    /// Loads a checkpoint and dispatches each operator's slice to it by
    /// name. Must run before sources start producing into the graph.
    pub fn restore(&self, checkpoint_id: &str) -> Result<()> {
        let path = self.path_for(checkpoint_id);
        let bytes = std::fs::read(&path)?;
        let snapshot: HashMap<String, StateValue> = serde_json::from_slice(&bytes).map_err(|e| FluxError::Serialization(e.to_string()))?;
        for operator in &self.operators {
            if let Some(state) = snapshot.get(operator.name()) {
                operator.restore(state.clone())?;
            }
        }
        tracing::info!(checkpoint_id, "checkpoint restored");
        Ok(())
    }

    /// Runs `checkpoint` on `interval` until `running` clears, then persists
    /// one final checkpoint before returning -- the "persist a final
    /// checkpoint" step of the §5 drain sequence. A zero interval disables
    /// the periodic cadence (the `checkpoint_interval` configuration
    /// default) but still waits for shutdown to run the final checkpoint.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, running: Arc<std::sync::atomic::AtomicBool>) {
        const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);
        let tick = if interval.is_zero() { SHUTDOWN_POLL_INTERVAL } else { interval };

        let mut sequence: u64 = 0;
        while running.load(std::sync::atomic::Ordering::Relaxed) {
            tokio::time::sleep(tick).await;
            if !running.load(std::sync::atomic::Ordering::Relaxed) {
                break;
            }
            if interval.is_zero() {
                continue;
            }
            sequence += 1;
            if let Err(e) = self.checkpoint(&format!("auto-{sequence}")) {
                tracing::error!(error = %e, "periodic checkpoint failed");
            }
        }
        if let Err(e) = self.checkpoint("shutdown") {
            tracing::error!(error = %e, "final shutdown checkpoint failed");
        }
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| FluxError::StoreUnavailable(format!("invalid checkpoint path: {}", path.display())))?;
    let temp_path = parent.join(format!(".{}.tmp.{}", path.file_name().unwrap_or_default().to_string_lossy(), std::process::id()));

    let mut file = std::fs::File::create(&temp_path)?;
    std::io::Write::write_all(&mut file, content)?;
    file.sync_all()?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::builtin::Reduce;
    use crate::operators::PipelineBuilder;

    #[tokio::test]
    async fn snapshot_then_restore_round_trips_operator_state() {
        let dir = tempfile::tempdir().unwrap();

        let (builder, inlet) = PipelineBuilder::<(&'static str, i32)>::new(8);
        let pipeline = builder.then("sum", Reduce::new(|a: i32, b: i32| a + b)).finish();
        inlet.elements.send(("k", 1)).await.unwrap();
        inlet.elements.send(("k", 2)).await.unwrap();
        inlet.elements.send(("other", 5)).await.unwrap();
        drop(inlet);
        let states = pipeline.operator_states().to_vec();
        pipeline.join().await;

        let manager = CheckpointManager::new(dir.path(), states).unwrap();
        manager.checkpoint("cp-1").unwrap();

        let persisted = std::fs::read_to_string(dir.path().join("cp-1.json")).unwrap();
        assert!(persisted.contains("\"sum\""));
        assert!(persisted.contains("\"key_count\""));
    }

    #[test]
    fn restoring_a_missing_checkpoint_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), vec![]).unwrap();
        assert!(manager.restore("does-not-exist").is_err());
    }

    #[tokio::test]
    async fn run_periodic_persists_a_final_checkpoint_on_shutdown_even_with_zero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(CheckpointManager::new(dir.path(), vec![]).unwrap());
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let running2 = running.clone();
        let manager2 = manager.clone();
        let handle = tokio::spawn(async move { manager2.run_periodic(Duration::from_secs(0), running2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        running.store(false, std::sync::atomic::Ordering::SeqCst);
        handle.await.unwrap();

        assert!(dir.path().join("shutdown.json").exists(), "shutdown must persist a final checkpoint regardless of checkpoint_interval");
    }
}
