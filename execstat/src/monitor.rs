//! Periodic sample → aggregate → publish loop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

use crate::aggregate::{AggregatedStat, Report, aggregate};
use crate::decode::{Decoded, SchemaMismatch, decode_entry};
use crate::error::SourceError;
use crate::source::MapSource;
use crate::telemetry::MetricPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sampling,
    Publishing,
    Stopped,
}

/// Reads and decodes one full pass of the map.
pub struct Sampler {
    source: Box<dyn MapSource + Send>,
}

impl Sampler {
    pub fn new(source: Box<dyn MapSource + Send>) -> Self {
        Self { source }
    }

    /// Read, decode and aggregate one pass.
    ///
    /// Any source error discards everything read so far in this pass.
    pub fn sample(&mut self) -> Result<Vec<AggregatedStat>, SourceError> {
        let mut records = Vec::new();
        let mut mismatch: Option<SchemaMismatch> = None;
        let mut mismatched = 0usize;
        let mut undecodable = 0usize;
        let mut seen = HashSet::new();

        for entry in self.source.entries()? {
            let entry = entry?;
            // Each key counts once per pass.
            if !seen.insert(entry.key) {
                debug!("Key {} returned twice in one pass; ignoring repeat", entry.key);
                continue;
            }
            let decoded = decode_entry(&entry);
            if let Decoded::Raw(raw) = &decoded {
                debug!("Raw fallback for key {}: {}", raw.key, raw.hex);
                mismatch = raw.mismatch;
                mismatched += 1;
            }
            match decoded.into_record() {
                Some(record) => records.push(record),
                None => undecodable += 1,
            }
        }

        if let Some(mismatch) = mismatch {
            warn!(
                "{} of {} entries in {}: {}; using leading fields where possible",
                mismatched,
                records.len() + undecodable,
                self.source.describe(),
                mismatch
            );
        }
        if undecodable > 0 {
            warn!(
                "{} entries too short to decode were left out of this sample",
                undecodable
            );
        }

        Ok(aggregate(records))
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }
}

/// Drives sampling cycles on a fixed interval until told to stop.
///
/// Cycles never overlap: the next tick is only awaited once the previous cycle has been
/// published or has failed.
pub struct Scheduler {
    sampler: Arc<Mutex<Sampler>>,
    publisher: MetricPublisher,
    interval: Duration,
    phase: Phase,
    print_report: bool,
    cycles: u64,
    failures: u64,
}

impl Scheduler {
    pub fn new(sampler: Sampler, publisher: MetricPublisher, interval: Duration) -> Self {
        Self {
            sampler: Arc::new(Mutex::new(sampler)),
            publisher,
            interval,
            phase: Phase::Idle,
            print_report: false,
            cycles: 0,
            failures: 0,
        }
    }

    /// Print the tabular report to stdout after every successful cycle.
    pub fn with_report(mut self, print_report: bool) -> Self {
        self.print_report = print_report;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn publisher(&self) -> &MetricPublisher {
        &self.publisher
    }

    /// Completed and failed cycle counts.
    pub fn cycles(&self) -> (u64, u64) {
        (self.cycles, self.failures)
    }

    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Sampling {} every {:?}",
            self.sampler_description(),
            self.interval
        );

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // The stop flag is checked between cycles only.
            self.run_cycle().await;
        }

        self.phase = Phase::Stopped;
        info!(
            "Sampling stopped after {} cycles ({} failed)",
            self.cycles, self.failures
        );
    }

    async fn run_cycle(&mut self) {
        self.phase = Phase::Sampling;
        let sampler = self.sampler.clone();
        let sampled = tokio::task::spawn_blocking(move || {
            let mut sampler = sampler.lock().unwrap_or_else(|p| p.into_inner());
            sampler.sample()
        })
        .await;

        match sampled {
            Ok(Ok(stats)) => {
                self.phase = Phase::Publishing;
                self.publisher.publish(&stats);
                self.cycles += 1;
                if self.print_report {
                    println!("{}", Report::new(stats));
                }
            }
            Ok(Err(e)) => {
                self.failures += 1;
                error!("Cycle skipped: {}", e);
            }
            Err(e) => {
                self.failures += 1;
                error!("Sampling task failed: {}", e);
            }
        }
        self.phase = Phase::Idle;
    }

    fn sampler_description(&self) -> String {
        self.sampler
            .lock()
            .map(|s| s.describe())
            .unwrap_or_else(|p| p.into_inner().describe())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::PathBuf;

    use super::*;
    use crate::decode::ProcessRecord;
    use crate::source::{Entries, RawEntry};
    use crate::telemetry::{CounterState, init_metrics};

    /// Serves queued passes; an empty queue repeats the last pass.
    struct ScriptedSource {
        passes: VecDeque<Result<Vec<Result<RawEntry, ()>>, ()>>,
        last: Vec<RawEntry>,
    }

    impl ScriptedSource {
        fn new(passes: Vec<Result<Vec<Result<RawEntry, ()>>, ()>>) -> Self {
            Self {
                passes: passes.into(),
                last: Vec::new(),
            }
        }
    }

    fn unavailable() -> SourceError {
        SourceError::Iteration {
            path: PathBuf::from("/sys/fs/bpf/test"),
            source: std::io::Error::from_raw_os_error(libc::EIO),
        }
    }

    impl MapSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        fn entries(&mut self) -> Result<Entries<'_>, SourceError> {
            match self.passes.pop_front() {
                None => Ok(Box::new(self.last.clone().into_iter().map(Ok))),
                Some(Err(())) => Err(unavailable()),
                Some(Ok(pass)) => {
                    self.last = pass.iter().filter_map(|e| e.clone().ok()).collect();
                    Ok(Box::new(
                        pass.into_iter().map(|e| e.map_err(|()| unavailable())),
                    ))
                }
            }
        }
    }

    fn entry(key: u32, name: &str, pid: u32, count: u64) -> Result<RawEntry, ()> {
        Ok(RawEntry {
            key,
            value: ProcessRecord::new(name, pid, count).to_bytes().to_vec(),
        })
    }

    fn sampler(passes: Vec<Result<Vec<Result<RawEntry, ()>>, ()>>) -> Sampler {
        Sampler::new(Box::new(ScriptedSource::new(passes)))
    }

    #[test]
    fn test_sample_aggregates_pass() {
        let mut sampler = sampler(vec![Ok(vec![
            entry(1, "bash", 100, 5),
            entry(2, "bash", 101, 3),
            entry(3, "cron", 7, 20),
        ])]);

        let stats = sampler.sample().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "cron");
        assert_eq!(stats[1].total_count, 8);
        assert_eq!(stats[1].pids, vec![100, 101]);
    }

    #[test]
    fn test_sample_uses_partial_decode_of_long_values() {
        let mut value = ProcessRecord::new("bash", 100, 5).to_bytes().to_vec();
        value.extend_from_slice(&[0; 12]);
        let mut sampler = sampler(vec![Ok(vec![
            Ok(RawEntry { key: 1, value }),
            Ok(RawEntry {
                key: 2,
                value: vec![1, 2, 3],
            }),
        ])]);

        let stats = sampler.sample().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_count, 5);
    }

    #[test]
    fn test_repeated_keys_count_once() {
        let mut sampler = sampler(vec![Ok(vec![
            entry(1, "bash", 100, 5),
            entry(2, "bash", 101, 3),
            entry(1, "bash", 100, 5),
            entry(2, "bash", 101, 3),
        ])]);

        let stats = sampler.sample().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_count, 8);
        assert_eq!(stats[0].executions, 2);
        assert_eq!(stats[0].pids, vec![100, 101]);
    }

    #[test]
    fn test_mid_pass_error_discards_pass() {
        let mut sampler = sampler(vec![Ok(vec![
            entry(1, "bash", 100, 5),
            Err(()),
            entry(3, "cron", 7, 20),
        ])]);
        assert!(matches!(
            sampler.sample(),
            Err(SourceError::Iteration { .. })
        ));
    }

    async fn run_for(scheduler: &mut Scheduler, duration: Duration) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stopper = async move {
            tokio::time::sleep(duration).await;
            stop_tx.send(true).unwrap();
        };
        tokio::join!(stopper, scheduler.run(stop_rx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_publishes_and_stops() {
        let telemetry = init_metrics().unwrap();
        let publisher = MetricPublisher::new(&telemetry.meter(), CounterState::default());
        let mut scheduler = Scheduler::new(
            sampler(vec![Ok(vec![
                entry(1, "bash", 100, 5),
                entry(2, "bash", 101, 3),
            ])]),
            publisher,
            Duration::from_millis(20),
        );

        run_for(&mut scheduler, Duration::from_millis(150)).await;

        assert_eq!(scheduler.phase(), Phase::Stopped);
        let (cycles, failures) = scheduler.cycles();
        assert!(cycles >= 2, "expected repeated cycles, got {cycles}");
        assert_eq!(failures, 0);
        // Re-reading an unchanged map adds nothing.
        assert_eq!(scheduler.publisher().state().exposed("bash"), Some(8));
        assert_eq!(scheduler.publisher().state().global_exposed(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycles_do_not_stop_loop_or_touch_state() {
        let telemetry = init_metrics().unwrap();
        let publisher = MetricPublisher::new(&telemetry.meter(), CounterState::default());
        let mut scheduler = Scheduler::new(
            sampler(vec![
                Ok(vec![entry(1, "bash", 100, 100)]),
                Err(()),
                Ok(vec![entry(1, "bash", 100, 50), Err(())]),
                Ok(vec![entry(1, "bash", 100, 40)]),
                Ok(vec![entry(1, "bash", 100, 50)]),
            ]),
            publisher,
            Duration::from_millis(10),
        );

        run_for(&mut scheduler, Duration::from_millis(200)).await;

        let (cycles, failures) = scheduler.cycles();
        assert_eq!(failures, 2);
        assert!(cycles >= 3);
        // 100, then rebased to 40, then +10.
        assert_eq!(scheduler.publisher().state().exposed("bash"), Some(110));
    }

    #[tokio::test]
    async fn test_stop_before_first_tick() {
        let telemetry = init_metrics().unwrap();
        let publisher = MetricPublisher::new(&telemetry.meter(), CounterState::default());
        let mut scheduler = Scheduler::new(sampler(vec![]), publisher, Duration::from_secs(60));

        let (stop_tx, stop_rx) = watch::channel(true);
        scheduler.run(stop_rx).await;
        drop(stop_tx);

        assert_eq!(scheduler.phase(), Phase::Stopped);
        assert_eq!(scheduler.cycles(), (0, 0));
    }
}
