use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{after, never, select, tick, Receiver};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use progminer::config::Options;
use progminer::farm::{Farm, FarmEvent};
use progminer::stratum::{ClientEvent, StratumClient};
use progminer::types::format_hashrate;

const STATS_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let options = Options::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let endpoint = options.endpoint()?;

    #[cfg(feature = "cuda")]
    let devices = if options.cuda_devices.is_empty() {
        progminer::backend::query_cuda_devices()?
            .iter()
            .map(|device| device.index)
            .collect()
    } else {
        options.cuda_devices.clone()
    };
    #[cfg(not(feature = "cuda"))]
    let devices: Vec<u32> = {
        if !options.cuda_devices.is_empty() {
            bail!("this build has no CUDA support; rebuild with `--features cuda`");
        }
        warn!("Built without CUDA support; running the pool session only");
        Vec::new()
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("failed to install the ctrl-c handler")?;
    }

    let (client_tx, client_events) = crossbeam_channel::unbounded();
    let client = StratumClient::spawn(endpoint.clone(), options.client_config(), client_tx)?;
    let (mut farm, farm_events) = Farm::new(options.farm_config(devices));
    farm.start()?;

    info!(pool = %endpoint, gpus = farm.device_count(), "Starting progminer");
    client.connect();

    let result = supervise(
        &options,
        &client,
        &mut farm,
        &client_events,
        &farm_events,
        &shutdown,
    );

    info!("Shutting down");
    farm.stop();
    client.disconnect();
    drop(client);
    result
}

/// The reconnect-and-dispatch loop: publishes work to the farm, forwards
/// solutions to the session, and re-drives `connect` after a drop.
fn supervise(
    options: &Options,
    client: &StratumClient,
    farm: &mut Farm,
    client_events: &Receiver<ClientEvent>,
    farm_events: &Receiver<FarmEvent>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let ticker = tick(STATS_INTERVAL);
    let mut reconnect = never::<std::time::Instant>();

    while !shutdown.load(Ordering::SeqCst) {
        select! {
            recv(client_events) -> event => {
                let Ok(event) = event else {
                    bail!("stratum client thread ended unexpectedly");
                };
                match event {
                    ClientEvent::Connected => info!("Connected to pool"),
                    ClientEvent::WorkReceived(work) => {
                        info!(
                            job = &work.job[..work.job_len.min(work.job.len())],
                            epoch = work.epoch,
                            height = work.height,
                            period = work.period(),
                            "New job"
                        );
                        farm.set_work(work);
                    }
                    ClientEvent::Disconnected => {
                        warn!("Disconnected from pool");
                        farm.pause();
                        if !shutdown.load(Ordering::SeqCst) {
                            reconnect = after(RECONNECT_DELAY);
                        }
                    }
                    ClientEvent::SolutionAccepted { stale } => {
                        farm.record_accepted(stale);
                        info!("**Accepted{}", if stale { " (stale)" } else { "" });
                    }
                    ClientEvent::SolutionRejected { stale } => {
                        farm.record_rejected(stale);
                        warn!("**Rejected{}", if stale { " (stale)" } else { "" });
                    }
                }
            },
            recv(farm_events) -> event => {
                let Ok(event) = event else {
                    bail!("farm event channel closed unexpectedly");
                };
                match event {
                    FarmEvent::SolutionFound(solution) => {
                        info!(
                            nonce = %format!("0x{:016x}", solution.nonce),
                            stale = solution.stale,
                            "Solution found; submitting"
                        );
                        client.submit(solution);
                    }
                    FarmEvent::WorkerError { index, message } => {
                        warn!(miner = index, "{message}");
                        if options.exit_on_error {
                            bail!("miner {index} failed: {message}");
                        }
                    }
                }
            },
            recv(ticker) -> _ => {
                let (total, per_miner) = farm.collect_hashrate();
                let gpus = per_miner
                    .iter()
                    .enumerate()
                    .map(|(index, rate)| format!("gpu{index} {}", format_hashrate(*rate)))
                    .collect::<Vec<_>>()
                    .join(", ");
                if per_miner.is_empty() {
                    info!("Speed {}", format_hashrate(total));
                } else {
                    info!("Speed {} [{}]", format_hashrate(total), gpus);
                }
                if options.report_hashrate {
                    client.submit_hashrate(format!("0x{:x}", total as u64));
                }
            },
            recv(reconnect) -> _ => {
                reconnect = never();
                if !shutdown.load(Ordering::SeqCst) {
                    info!("Reconnecting to pool");
                    client.connect();
                }
            },
        }
    }
    Ok(())
}
