pub mod aggregate;
pub mod decode;
pub mod dump;
pub mod error;
pub mod monitor;
pub mod server;
pub mod settings;
pub mod source;
pub mod telemetry;

use std::io;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;

use crate::monitor::{Sampler, Scheduler};
use crate::settings::Settings;
use crate::telemetry::{CounterState, MetricPublisher, init_metrics};

pub struct ExecStatEngine {
    pub settings: Settings,
    print_report: bool,
}

impl ExecStatEngine {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            print_report: false,
        }
    }

    pub fn with_report(mut self, print_report: bool) -> Self {
        self.print_report = print_report;
        self
    }

    /// Sample until SIGINT or SIGTERM, serving metrics the whole time.
    pub async fn run(self) -> Result<()> {
        let telemetry = init_metrics()?;
        let publisher = MetricPublisher::new(&telemetry.meter(), CounterState::default());

        // Bind before spawning so a taken port fails startup.
        let listener = server::bind(self.settings.listen_addr()).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(server::serve(
            listener,
            self.settings.metrics_path(),
            telemetry.registry().clone(),
            stop_rx.clone(),
        ));
        let signals = tokio::spawn(wait_for_termination(stop_tx, signal::ctrl_c()));

        let sampler = Sampler::new(self.settings.build_source());
        let mut scheduler = Scheduler::new(sampler, publisher, self.settings.interval())
            .with_report(self.print_report);

        info!("Monitoring active. Press Ctrl-C to exit.");
        scheduler.run(stop_rx).await;

        if let Err(e) = server.await {
            warn!("Metrics server task ended abnormally: {}", e);
        }
        telemetry.shutdown();
        signals.await.context("Signal task failed")??;
        info!("Exiting...");

        Ok(())
    }
}

/// Set the stop flag once `interrupt` resolves or SIGTERM arrives.
///
/// If a handler cannot be installed the flag is left unset and the error returned; dropping
/// the sender still stops the loop, and the caller reports the failure.
async fn wait_for_termination<F>(stop: watch::Sender<bool>, interrupt: F) -> Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    let mut term = signal::unix::signal(SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = interrupt => result.context("Failed to listen for Ctrl-C")?,
        _ = term.recv() => {}
    }
    info!("Termination requested; finishing current cycle");
    let _ = stop.send(true);
    Ok(())
}

/// Parse arguments, exiting 1 on usage errors and 0 after `--help`/`--version`.
pub fn parse_args<T: Parser>() -> T {
    match T::try_parse() {
        Ok(opt) => opt,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    }
}
