use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use cloudbench_core::prelude::AbortListener;
use cloudbench_summary_model::{IterationResult, WorkloadSummary};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::runtime::Runtime;
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::report::ReportCollector;

/// Write every raw iteration result and workload summary to disk as JSON lines.
///
/// Writing happens on a background task so that the result consumer never waits on the disk.
pub struct JsonlFileReportCollector {
    join_handle: JoinHandle<()>,
    writer: Mutex<Option<UnboundedSender<Value>>>,
    flush_complete: Arc<AtomicBool>,
    path: PathBuf,
}

impl JsonlFileReportCollector {
    pub fn new(
        runtime: &Runtime,
        abort: AbortListener,
        dir: PathBuf,
        task_id: String,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
        let path = dir.join(format!("{}-{}.jsonl", task_id, crate::unix_now() as u64));

        let flush_complete = Arc::new(AtomicBool::new(false));
        let (writer, receiver) = tokio::sync::mpsc::unbounded_channel();
        let join_handle = runtime.spawn(write_task(
            abort,
            path.clone(),
            receiver,
            flush_complete.clone(),
        ));

        Ok(Self {
            join_handle,
            writer: Mutex::new(Some(writer)),
            flush_complete,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_send(&self, line: Value) {
        let writer = self.writer.lock();
        let Some(writer) = writer.as_ref() else {
            log::warn!("Result reported after the file reporter was finalized");
            return;
        };

        if let Err(e) = writer.send(line) {
            if self.flush_complete.load(Ordering::Relaxed) {
                log::info!("Failed to record result because the write task has finished: {e}");
            } else {
                log::warn!("Failed to record result: {e}");
            }
        }
    }
}

impl ReportCollector for JsonlFileReportCollector {
    fn add_iteration(&mut self, scenario_name: &str, result: &IterationResult) {
        self.try_send(json!({
            "kind": "iteration",
            "scenario": scenario_name,
            "result": result,
        }));
    }

    fn add_workload(&mut self, summary: &WorkloadSummary) {
        self.try_send(json!({
            "kind": "workload",
            "summary": summary,
        }));
    }

    fn finalize(&self) {
        // Closing the channel lets the write task drain and exit.
        self.writer.lock().take();

        let wait_started = Instant::now();
        let mut notify_timer = Instant::now();
        while !self.flush_complete.load(Ordering::Relaxed) {
            if notify_timer.elapsed().as_secs() > 10 {
                log::warn!(
                    "Still waiting for results to flush after {} seconds.",
                    wait_started.elapsed().as_secs()
                );
                notify_timer = Instant::now();
            }

            // If the write task has exited then there's no point trying to wait for it to finish
            // any longer.
            if self.join_handle.is_finished() {
                break;
            }

            std::thread::sleep(Duration::from_millis(20));
        }

        log::debug!(
            "Results written to {} after {:.2} seconds",
            self.path.display(),
            wait_started.elapsed().as_secs_f64()
        );
    }
}

async fn write_task(
    abort: AbortListener,
    path: PathBuf,
    mut receiver: UnboundedReceiver<Value>,
    flush_complete: Arc<AtomicBool>,
) {
    if let Err(e) = write_lines(&abort, &path, &mut receiver).await {
        log::error!("File reporter failed writing to {}: {e:?}", path.display());
    }

    // Signal the 'finalize' method that the write task has finished.
    flush_complete.store(true, Ordering::Relaxed);
}

async fn write_lines(
    abort: &AbortListener,
    path: &Path,
    receiver: &mut UnboundedReceiver<Value>,
) -> anyhow::Result<()> {
    let file = File::options()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut file = BufWriter::new(file);

    // Listen and write results until the channel closes or the run is hard aborted
    loop {
        select! {
            _ = abort.wait_for_hard_abort() => {
                log::debug!("Hard abort, stopping file reporter");
                break;
            }
            line = receiver.recv() => {
                match line {
                    Some(line) => write_line(&mut file, &line).await?,
                    None => break,
                }
            }
        }
    }

    let mut drain_count = 0;
    while let Ok(line) = receiver.try_recv() {
        write_line(&mut file, &line).await?;
        drain_count += 1;

        if drain_count % 1000 == 0 {
            log::debug!("Drained {} remaining results", drain_count);
        }
    }

    // Ensure everything that's buffered has been written to disk.
    file.flush().await?;

    log::debug!("Drained {} remaining results", drain_count);

    Ok(())
}

#[inline]
async fn write_line<W>(writer: &mut W, line: &Value) -> anyhow::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(line.to_string().as_bytes()).await?;
    writer.write_all(b"\n").await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudbench_core::prelude::AbortHandle;
    use cloudbench_summary_model::ScenarioOutput;
    use std::io::BufRead;

    #[test]
    fn writes_one_line_per_iteration() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let abort = AbortHandle::new();

        let mut collector = JsonlFileReportCollector::new(
            &runtime,
            abort.new_listener(),
            dir.path().to_path_buf(),
            "task".to_string(),
        )
        .unwrap();

        for iteration in 1..=3 {
            collector.add_iteration(
                "Dummy.dummy",
                &IterationResult {
                    iteration,
                    timestamp: 0.0,
                    duration: 0.1,
                    idle_duration: 0.0,
                    error: None,
                    atomic_actions: Vec::new(),
                    output: ScenarioOutput::default(),
                },
            );
        }
        collector.finalize();

        let file = std::fs::File::open(collector.path()).unwrap();
        let lines = std::io::BufReader::new(file)
            .lines()
            .map(|l| serde_json::from_str::<Value>(&l.unwrap()).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(3, lines.len());
        assert_eq!(json!(3), lines[2]["result"]["iteration"]);
        assert_eq!(json!("Dummy.dummy"), lines[0]["scenario"]);
    }
}
