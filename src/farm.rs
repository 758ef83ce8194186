use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::warn;

use crate::backend::dag::{DagLoadCoordinator, DagLoadMode};
use crate::types::{value_meets_boundary, H256};
use crate::work::{Solution, WorkPackage};

#[derive(Debug, Clone)]
pub struct FarmConfig {
    /// CUDA device indices to mine on.
    pub devices: Vec<u32>,
    pub grid_size: u32,
    pub block_size: u32,
    pub num_streams: usize,
    pub dag_load_mode: DagLoadMode,
    pub dag_create_device: u32,
    /// Trust the kernel's mix and skip host re-evaluation.
    pub no_eval: bool,
    /// Promote worker-fatal errors to process-fatal.
    pub exit_on_error: bool,
}

impl Default for FarmConfig {
    fn default() -> Self {
        FarmConfig {
            devices: Vec::new(),
            grid_size: 1024,
            block_size: 512,
            num_streams: 2,
            dag_load_mode: DagLoadMode::Parallel,
            dag_create_device: 0,
            no_eval: false,
            exit_on_error: false,
        }
    }
}

/// What workers push back to the supervisor.
#[derive(Debug)]
pub enum FarmEvent {
    SolutionFound(Solution),
    WorkerError { index: usize, message: String },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FarmStats {
    pub solutions_found: u64,
    pub failed_solutions: u64,
    pub accepted: u64,
    pub accepted_stale: u64,
    pub rejected: u64,
    pub rejected_stale: u64,
}

struct MinerSlot {
    new_work: AtomicBool,
    hash_count: AtomicU64,
}

struct FarmShared {
    work: Mutex<WorkPackage>,
    should_stop: AtomicBool,
    miners: Vec<MinerSlot>,
    event_tx: Sender<FarmEvent>,
    solutions_found: AtomicU64,
    failed_solutions: AtomicU64,
    accepted: AtomicU64,
    accepted_stale: AtomicU64,
    rejected: AtomicU64,
    rejected_stale: AtomicU64,
}

/// Owns the workers; workers hold only a [`MinerHandle`] back-reference,
/// so nothing keeps the farm alive from below.
pub struct Farm {
    config: FarmConfig,
    shared: Arc<FarmShared>,
    coordinator: Arc<DagLoadCoordinator>,
    workers: Vec<JoinHandle<()>>,
    current_epoch: Option<u64>,
    last_counts: Vec<u64>,
    last_tick: Instant,
}

impl Farm {
    pub fn new(config: FarmConfig) -> (Farm, Receiver<FarmEvent>) {
        let (event_tx, event_rx) = unbounded();
        let miners = config
            .devices
            .iter()
            .map(|_| MinerSlot {
                new_work: AtomicBool::new(false),
                hash_count: AtomicU64::new(0),
            })
            .collect::<Vec<_>>();
        let worker_count = config.devices.len();
        let coordinator = Arc::new(DagLoadCoordinator::new(
            config.dag_load_mode,
            config.dag_create_device,
            worker_count,
        ));
        let farm = Farm {
            shared: Arc::new(FarmShared {
                work: Mutex::new(WorkPackage::default()),
                should_stop: AtomicBool::new(false),
                miners,
                event_tx,
                solutions_found: AtomicU64::new(0),
                failed_solutions: AtomicU64::new(0),
                accepted: AtomicU64::new(0),
                accepted_stale: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                rejected_stale: AtomicU64::new(0),
            }),
            last_counts: vec![0; worker_count],
            last_tick: Instant::now(),
            current_epoch: None,
            coordinator,
            config,
            workers: Vec::new(),
        };
        (farm, event_rx)
    }

    pub fn device_count(&self) -> usize {
        self.config.devices.len()
    }

    /// Spawn one worker thread per configured device.
    #[cfg(feature = "cuda")]
    pub fn start(&mut self) -> Result<()> {
        use crate::backend::cuda::{CudaMiner, CudaSettings};

        for (index, &device_index) in self.config.devices.iter().enumerate() {
            let handle = self.handle(index);
            let coordinator = Arc::clone(&self.coordinator);
            let settings = CudaSettings {
                device_index,
                grid_size: self.config.grid_size,
                block_size: self.config.block_size,
                num_streams: self.config.num_streams,
                no_eval: self.config.no_eval,
                exit_on_error: self.config.exit_on_error,
            };
            let thread = std::thread::Builder::new()
                .name(format!("cuda-{index}"))
                .spawn(move || CudaMiner::new(handle, settings, coordinator).work_loop())?;
            self.workers.push(thread);
        }
        Ok(())
    }

    #[cfg(not(feature = "cuda"))]
    pub fn start(&mut self) -> Result<()> {
        if !self.config.devices.is_empty() {
            anyhow::bail!("this build has no CUDA support; rebuild with `--features cuda`");
        }
        Ok(())
    }

    pub fn handle(&self, index: usize) -> MinerHandle {
        MinerHandle {
            index,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Publish new work and kick every worker out of its current batch.
    pub fn set_work(&mut self, work: WorkPackage) {
        if !work.is_empty() && self.current_epoch != Some(work.epoch) {
            self.coordinator.reset_for_new_epoch();
            self.current_epoch = Some(work.epoch);
        }
        {
            let mut slot = self.shared.work.lock().expect("work lock");
            *slot = work;
        }
        self.kick_all();
    }

    /// No-work placeholder; workers idle until the next real package.
    pub fn pause(&mut self) {
        let mut slot = self.shared.work.lock().expect("work lock");
        *slot = WorkPackage::default();
        drop(slot);
        self.kick_all();
    }

    fn kick_all(&self) {
        for miner in &self.shared.miners {
            miner.new_work.store(true, Ordering::Release);
        }
    }

    pub fn stop(&mut self) {
        self.shared.should_stop.store(true, Ordering::Release);
        self.kick_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    /// Per-miner and total H/s since the previous call.
    pub fn collect_hashrate(&mut self) -> (f64, Vec<f64>) {
        let elapsed = self.last_tick.elapsed().as_secs_f64().max(1e-3);
        self.last_tick = Instant::now();
        let mut per_miner = Vec::with_capacity(self.shared.miners.len());
        let mut total = 0.0;
        for (miner, prev) in self.shared.miners.iter().zip(self.last_counts.iter_mut()) {
            let count = miner.hash_count.load(Ordering::Relaxed);
            let delta = count.wrapping_sub(*prev);
            *prev = count;
            let rate = delta as f64 / elapsed;
            per_miner.push(rate);
            total += rate;
        }
        (total, per_miner)
    }

    pub fn record_accepted(&self, stale: bool) {
        self.shared.accepted.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.shared.accepted_stale.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejected(&self, stale: bool) {
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.shared.rejected_stale.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> FarmStats {
        FarmStats {
            solutions_found: self.shared.solutions_found.load(Ordering::Relaxed),
            failed_solutions: self.shared.failed_solutions.load(Ordering::Relaxed),
            accepted: self.shared.accepted.load(Ordering::Relaxed),
            accepted_stale: self.shared.accepted_stale.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            rejected_stale: self.shared.rejected_stale.load(Ordering::Relaxed),
        }
    }
}

/// A worker's view of the farm: read work, consume kicks, report results.
#[derive(Clone)]
pub struct MinerHandle {
    index: usize,
    shared: Arc<FarmShared>,
}

impl MinerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn work(&self) -> WorkPackage {
        self.shared.work.lock().expect("work lock").clone()
    }

    pub fn should_stop(&self) -> bool {
        self.shared.should_stop.load(Ordering::Acquire)
    }

    /// True while a kick is pending; does not consume it.
    pub fn new_work_pending(&self) -> bool {
        self.shared.miners[self.index].new_work.load(Ordering::Acquire)
    }

    /// Consume the kick flag (single CAS true→false).
    pub fn take_new_work(&self) -> bool {
        self.shared.miners[self.index]
            .new_work
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear_new_work(&self) {
        self.shared.miners[self.index]
            .new_work
            .store(false, Ordering::Release);
    }

    pub fn add_hash_count(&self, hashes: u64) {
        self.shared.miners[self.index]
            .hash_count
            .fetch_add(hashes, Ordering::Relaxed);
    }

    pub fn submit_proof(&self, solution: Solution) {
        self.shared.solutions_found.fetch_add(1, Ordering::Relaxed);
        let _ = self.shared.event_tx.send(FarmEvent::SolutionFound(solution));
    }

    pub fn failed_solution(&self) {
        self.shared.failed_solutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_error(&self, message: String) {
        let _ = self.shared.event_tx.send(FarmEvent::WorkerError {
            index: self.index,
            message,
        });
    }
}

/// Hand a kernel-reported candidate to the farm, re-evaluating on the host
/// unless no-eval is set. A candidate whose recomputed value misses the
/// boundary is a defective GPU result: count it, submit nothing.
pub fn submit_candidate(
    miner: &MinerHandle,
    work: &WorkPackage,
    nonce: u64,
    kernel_mix: [u8; 32],
    no_eval: bool,
    stale: bool,
) {
    if no_eval {
        miner.submit_proof(Solution {
            nonce,
            mix_hash: H256(kernel_mix),
            work: work.clone(),
            stale,
        });
        return;
    }
    let result = progpow_spec::eval(work.epoch, &work.header.0, nonce);
    if value_meets_boundary(&result.value, &work.boundary) {
        miner.submit_proof(Solution {
            nonce,
            mix_hash: H256(result.mix_hash),
            work: work.clone(),
            stale,
        });
    } else {
        warn!(miner = miner.index(), nonce, "GPU gave incorrect result!");
        miner.failed_solution();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn farm_with_one_device() -> (Farm, Receiver<FarmEvent>) {
        Farm::new(FarmConfig {
            devices: vec![0],
            ..FarmConfig::default()
        })
    }

    fn work_with_boundary(boundary: [u8; 32]) -> WorkPackage {
        WorkPackage {
            header: H256([0x42; 32]),
            boundary: H256(boundary),
            epoch: 0,
            height: 100,
            job: "job".into(),
            job_len: 3,
            ..WorkPackage::default()
        }
    }

    #[test]
    fn set_work_publishes_and_kicks() {
        let (mut farm, _events) = farm_with_one_device();
        let miner = farm.handle(0);
        assert!(!miner.take_new_work());

        let work = work_with_boundary([0xff; 32]);
        farm.set_work(work.clone());
        assert_eq!(miner.work(), work);
        assert!(miner.take_new_work());
        assert!(!miner.take_new_work(), "kick is consumed exactly once");

        farm.pause();
        assert!(miner.work().is_empty());
        assert!(miner.take_new_work());
    }

    #[test]
    fn hash_counts_aggregate_into_rates() {
        let (mut farm, _events) = farm_with_one_device();
        let miner = farm.handle(0);
        std::thread::sleep(Duration::from_millis(20));
        miner.add_hash_count(100_000);
        let (total, per_miner) = farm.collect_hashrate();
        assert!(total > 0.0);
        assert_eq!(per_miner.len(), 1);
        assert!((total - per_miner[0]).abs() < f64::EPSILON);

        // Counter deltas reset each tick.
        let (total_after, _) = farm.collect_hashrate();
        assert_eq!(total_after, 0.0);
    }

    #[test]
    fn good_candidate_is_submitted() {
        let (farm, events) = farm_with_one_device();
        let miner = farm.handle(0);
        let work = work_with_boundary([0xff; 32]);

        submit_candidate(&miner, &work, 7, [0u8; 32], false, false);
        match events.recv_timeout(Duration::from_secs(1)) {
            Ok(FarmEvent::SolutionFound(solution)) => {
                assert_eq!(solution.nonce, 7);
                let expected = progpow_spec::eval(0, &work.header.0, 7);
                assert_eq!(solution.mix_hash, H256(expected.mix_hash));
            }
            other => panic!("expected a solution, got {other:?}"),
        }
        assert_eq!(farm.stats().solutions_found, 1);
        assert_eq!(farm.stats().failed_solutions, 0);
    }

    #[test]
    fn bad_gpu_result_is_counted_not_submitted() {
        let (farm, events) = farm_with_one_device();
        let miner = farm.handle(0);
        // An all-zero boundary is unbeatable; any candidate fails re-eval.
        let work = work_with_boundary([0u8; 32]);

        submit_candidate(&miner, &work, 1234, [0u8; 32], false, false);
        assert!(
            events.recv_timeout(Duration::from_millis(100)).is_err(),
            "no submission may reach the pool"
        );
        assert_eq!(farm.stats().failed_solutions, 1);
        assert_eq!(farm.stats().solutions_found, 0);
    }

    #[test]
    fn no_eval_trusts_the_kernel_mix() {
        let (farm, events) = farm_with_one_device();
        let miner = farm.handle(0);
        let work = work_with_boundary([0u8; 32]);

        let mut kernel_mix = [0u8; 32];
        kernel_mix[0] = 0xaa;
        submit_candidate(&miner, &work, 5, kernel_mix, true, true);
        match events.recv_timeout(Duration::from_secs(1)) {
            Ok(FarmEvent::SolutionFound(solution)) => {
                assert_eq!(solution.mix_hash, H256(kernel_mix));
                assert!(solution.stale);
            }
            other => panic!("expected a solution, got {other:?}"),
        }
        assert_eq!(farm.stats().solutions_found, 1);
    }

    #[test]
    fn acceptance_counters_track_staleness() {
        let (farm, _events) = farm_with_one_device();
        farm.record_accepted(false);
        farm.record_accepted(true);
        farm.record_rejected(true);
        let stats = farm.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.accepted_stale, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.rejected_stale, 1);
    }
}
