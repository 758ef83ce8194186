//! Admin-surface collaborators: the stat formats and control signatures
//! the external JSON-RPC server calls into. The HTTP listener itself
//! lives outside this crate.

use std::time::Duration;

use serde_json::{json, Value};

use crate::farm::FarmStats;

/// Everything the stat endpoints read, sampled by the supervisor.
#[derive(Debug, Clone)]
pub struct StatSnapshot {
    pub version: String,
    pub runtime: Duration,
    pub pool: String,
    /// H/s, already aggregated.
    pub total_hashrate: f64,
    pub per_miner_hashrate: Vec<f64>,
    pub stats: FarmStats,
}

/// Claymore `miner_getstat1` layout: nine strings, hashrates in kH/s.
pub fn miner_getstat1(snapshot: &StatSnapshot) -> Vec<String> {
    let khs = |rate: f64| format!("{:.0}", rate / 1000.0);
    let per_gpu = snapshot
        .per_miner_hashrate
        .iter()
        .map(|rate| khs(*rate))
        .collect::<Vec<_>>()
        .join(";");
    let temps = snapshot
        .per_miner_hashrate
        .iter()
        .map(|_| "0;0".to_string())
        .collect::<Vec<_>>()
        .join(";");
    vec![
        snapshot.version.clone(),
        (snapshot.runtime.as_secs() / 60).to_string(),
        format!(
            "{};{};{}",
            khs(snapshot.total_hashrate),
            snapshot.stats.accepted,
            snapshot.stats.rejected
        ),
        per_gpu,
        "0;0;0".to_string(),
        "off;off".to_string(),
        temps,
        snapshot.pool.clone(),
        format!("{};0;0;0", snapshot.stats.failed_solutions),
    ]
}

/// Extended stats, H/s with no lossy kH rounding.
pub fn miner_getstathr(snapshot: &StatSnapshot) -> Value {
    json!({
        "version": snapshot.version,
        "runtime": snapshot.runtime.as_secs(),
        "pool": snapshot.pool,
        "ethhashrate": snapshot.total_hashrate as u64,
        "ethhashrates": snapshot
            .per_miner_hashrate
            .iter()
            .map(|rate| *rate as u64)
            .collect::<Vec<_>>(),
        "ethshares": snapshot.stats.accepted,
        "ethrejected": snapshot.stats.rejected,
        "ethinvalid": snapshot.stats.failed_solutions,
    })
}

/// Control operations the admin server forwards; the process owner wires
/// these to the farm and supervisor.
pub trait MinerControl {
    fn miner_restart(&self);
    fn miner_reboot(&self);
}
