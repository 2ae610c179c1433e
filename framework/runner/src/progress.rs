use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressState, ProgressStyle};

use crate::dispatch::RunnerConfig;

/// Displays a progress bar while a workload is running to show the user how much is left.
///
/// Count based runners advance the bar as results come in. Duration based runners advance it with
/// the wall clock from a background thread.
pub(crate) struct Progress {
    bar: ProgressBar,
    count_based: bool,
    stop: Arc<AtomicBool>,
    ticker: Option<JoinHandle<()>>,
}

fn format_hms(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

pub(crate) fn start_progress(scenario_name: &str, runner: &RunnerConfig) -> anyhow::Result<Progress> {
    let stop = Arc::new(AtomicBool::new(false));

    if let Some(times) = runner.times() {
        let bar = ProgressBar::new(times as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} {spinner:.green} [{wide_bar:.cyan/blue}] {pos}/{len} [{elapsed_precise}]",
            )?
            .progress_chars("#>-"),
        );
        bar.set_message(scenario_name.to_string());
        bar.enable_steady_tick(Duration::from_millis(200));

        return Ok(Progress {
            bar,
            count_based: true,
            stop,
            ticker: None,
        });
    }

    let planned = runner.duration().unwrap_or_default();
    let bar = ProgressBar::new(planned.as_secs().max(1));
    bar.set_style(
        ProgressStyle::with_template(
            "{msg} {spinner:.green} [{wide_bar:.cyan/blue}] [{elapsed_precise} / {planned_runtime}]",
        )?
        .with_key("planned_runtime", {
            let planned = format_hms(planned);
            move |_state: &ProgressState, w: &mut dyn Write| {
                let _ = w.write_str(&planned);
            }
        })
        .progress_chars("#>-"),
    );
    bar.set_message(scenario_name.to_string());

    let ticker = std::thread::Builder::new()
        .name("progress".to_string())
        .spawn({
            let bar = bar.clone();
            let stop = stop.clone();
            move || {
                let start_time = Instant::now();
                while !stop.load(Ordering::Relaxed) {
                    bar.set_position(start_time.elapsed().as_secs().min(planned.as_secs()));
                    std::thread::sleep(Duration::from_millis(250));
                }
                log::trace!("Progress thread shutting down");
            }
        })?;

    Ok(Progress {
        bar,
        count_based: false,
        stop,
        ticker: Some(ticker),
    })
}

impl Progress {
    /// Record a finished iteration.
    pub(crate) fn inc(&self) {
        if self.count_based {
            self.bar.inc(1);
        }
    }

    pub(crate) fn finish(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(ticker) = self.ticker.take() {
            if ticker.join().is_err() {
                log::warn!("Progress thread panicked");
            }
        }
        self.bar.finish_and_clear();
    }
}
