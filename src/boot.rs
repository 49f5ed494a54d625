use std::{
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use env_logger::Builder;

use crate::{
    api::{
        handoff::{run_publisher, PublishQueue},
        orchestrator::Orchestrator,
        scheduler::BusScheduler,
        shutdown::ShutdownSignal,
        traits::PublishSink,
        transport::{Transport, TransportError},
        utils::open_transport_with_retry,
    },
    cli::{
        config::{BridgeConfig, BusConfig, LogLevel, TransportFailurePolicy},
        output::OutputSink,
    },
    mqtt::MqttSink,
};

/// Per-read timeout on the bus; the scheduler enforces the response deadline.
const TRANSPORT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Console logger with a timestamped single-line format. `RUST_LOG` still
/// overrides the configured level.
pub fn init_logger(level: LogLevel) {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(level.into())
        .parse_default_env();
    if builder.try_init().is_err() {
        log::debug!("Logger already initialized");
    }
}

fn open_sink(config: &BridgeConfig) -> Result<Box<dyn PublishSink>> {
    if let Some(output) = &config.output {
        let sink = output.parse::<OutputSink>()?;
        log::info!("Publishing records to {output}");
        return sink
            .open()
            .with_context(|| format!("Failed to open output {output}"));
    }
    let mqtt = config
        .mqtt
        .as_ref()
        .ok_or_else(|| anyhow!("No MQTT broker configured"))?;
    let packs: Vec<u8> = config.buses.iter().flat_map(BusConfig::addresses).collect();
    Ok(Box::new(MqttSink::connect(mqtt, &config.discovery, packs)))
}

async fn open_buses(config: &BridgeConfig) -> Result<Vec<Box<dyn Transport>>> {
    let mut transports = Vec::with_capacity(config.buses.len());
    for bus in &config.buses {
        let target = bus.transport.clone();
        let baud_rate = bus.baud_rate();
        let transport = tokio::task::spawn_blocking(move || {
            open_transport_with_retry(&target, baud_rate, TRANSPORT_READ_TIMEOUT)
        })
        .await??;
        transports.push(transport);
    }
    Ok(transports)
}

#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// What the remaining workers do after one bus transport failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    KeepRunning,
    StopAll,
}

/// `live_buses` counts the buses still running after the failed one stopped.
fn on_transport_failure(policy: TransportFailurePolicy, live_buses: usize) -> FailureAction {
    match policy {
        TransportFailurePolicy::Exit => FailureAction::StopAll,
        TransportFailurePolicy::StopBus if live_buses == 0 => FailureAction::StopAll,
        TransportFailurePolicy::StopBus => FailureAction::KeepRunning,
    }
}

/// Under `stop_bus` the process only fails once no bus is left.
fn exits_with_failure(policy: TransportFailurePolicy, failed: usize, total: usize) -> bool {
    match policy {
        TransportFailurePolicy::Exit => failed > 0,
        TransportFailurePolicy::StopBus => failed > 0 && failed >= total,
    }
}

/// Run every bus until shutdown. Returns an error when startup fails or a
/// bus transport fails under [`TransportFailurePolicy::Exit`], or once every
/// bus has failed under [`TransportFailurePolicy::StopBus`].
pub async fn start(config: BridgeConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let config = Arc::new(config);
    log::info!(
        "Starting Seplos BMS poller: {} packs on {} bus(es)",
        config.pack_count(),
        config.buses.len()
    );

    let transports = open_buses(&config).await?;
    let sink = open_sink(&config)?;

    let shutdown = ShutdownSignal::new();
    let signal_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                result = wait_for_termination() => {
                    if let Err(err) = result {
                        log::warn!("Signal handler failed: {err}");
                    }
                    shutdown.trigger();
                }
                _ = shutdown.wait() => {}
            }
        }
    });

    let (queue, receiver) = PublishQueue::with_capacity(config.publish_queue_capacity);
    let publisher = tokio::task::spawn_blocking(move || run_publisher(receiver, sink));

    let live_buses = Arc::new(AtomicUsize::new(transports.len()));
    let mut workers = Vec::with_capacity(transports.len());
    for (index, transport) in transports.into_iter().enumerate() {
        let config = config.clone();
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        let live_buses = live_buses.clone();
        workers.push(tokio::task::spawn_blocking(move || {
            let bus = &config.buses[index];
            let scheduler = BusScheduler::new(transport, config.exchange_settings());
            let mut orchestrator =
                Orchestrator::new(scheduler, config.orchestrator_settings(bus), queue);
            let result = orchestrator.run(&shutdown);
            if let Err(err) = &result {
                let live = live_buses.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                log::error!("Bus {} stopped: {err}", bus.transport);
                match on_transport_failure(config.transport_failure, live) {
                    FailureAction::StopAll => shutdown.trigger(),
                    FailureAction::KeepRunning => {
                        log::warn!("Continuing with {live} bus(es)");
                    }
                }
            }
            result
        }));
    }
    drop(queue);

    let mut failures: Vec<TransportError> = Vec::new();
    for worker in workers {
        if let Err(err) = worker.await? {
            failures.push(err);
        }
    }
    shutdown.trigger();
    let _ = signal_task.await;

    let delivered = publisher.await?;
    log::info!("Delivered {delivered} records");

    let failed = failures.len();
    match failures.into_iter().next() {
        Some(err) if exits_with_failure(config.transport_failure, failed, config.buses.len()) => {
            Err(anyhow::Error::new(err).context(format!("{failed} bus(es) failed")))
        }
        _ => Ok(()),
    }
}
