//! Per-device CUDA worker: owns the device context (cache, DAG, result
//! buffers, streams, compiled kernel) and runs the pipelined search loop.
//!
//! Driver-API failures outside the proactive memory check indicate
//! hardware or driver corruption that is unsafe to mine through; they
//! abort the process. A DAG that simply does not fit retires this worker
//! only.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use cudarc::driver::{
    CudaContext, CudaFunction, CudaSlice, CudaStream, DriverError, LaunchConfig, PushKernelArg,
};
use tracing::{debug, error, info, warn};

use progpow_spec::LOG2_MAX_MINERS;

use crate::backend::dag::{DagLoadCoordinator, DagLoadMode};
use crate::backend::pipeline::SearchPipeline;
use crate::backend::{
    decode_search_buffer, kernel, query_cuda_devices, CudaDeviceInfo, SEARCH_BUFFER_WORDS,
};
use crate::farm::{submit_candidate, MinerHandle};
use crate::types::H256;
use crate::work::WorkPackage;

const NO_WORK_POLL: Duration = Duration::from_millis(100);
const COMPILE_RETRY_DELAY: Duration = Duration::from_secs(1);
/// 64-byte DAG items written per thread per generation launch.
const DAG_ITEM_WORDS: u64 = 16;

#[derive(Debug, Clone, Copy)]
pub struct CudaSettings {
    pub device_index: u32,
    pub grid_size: u32,
    pub block_size: u32,
    pub num_streams: usize,
    pub no_eval: bool,
    pub exit_on_error: bool,
}

/// Everything tied to the live context; dropping it is the device reset.
struct DeviceContext {
    ctx: Arc<CudaContext>,
    streams: Vec<Arc<CudaStream>>,
    #[allow(dead_code)]
    light: CudaSlice<u8>,
    dag: CudaSlice<u8>,
    header: CudaSlice<u32>,
    search_buffers: Vec<CudaSlice<u32>>,
    kernel: Option<CudaFunction>,
    dag_bytes: u64,
}

pub struct CudaMiner {
    farm: MinerHandle,
    settings: CudaSettings,
    coordinator: Arc<DagLoadCoordinator>,
    device_info: Option<CudaDeviceInfo>,
    device: Option<DeviceContext>,
    pipeline: SearchPipeline,
    current_epoch: Option<u64>,
    current_period: Option<u64>,
    last_header: H256,
    last_target: u64,
}

impl CudaMiner {
    pub fn new(
        farm: MinerHandle,
        settings: CudaSettings,
        coordinator: Arc<DagLoadCoordinator>,
    ) -> CudaMiner {
        let pipeline =
            SearchPipeline::new(settings.num_streams, settings.grid_size, settings.block_size);
        CudaMiner {
            farm,
            settings,
            coordinator,
            device_info: None,
            device: None,
            pipeline,
            current_epoch: None,
            current_period: None,
            last_header: H256::ZERO,
            last_target: 0,
        }
    }

    /// The worker thread body: dispatch on work changes, then search.
    pub fn work_loop(mut self) {
        let mut current = WorkPackage::default();
        loop {
            if self.farm.should_stop() {
                self.farm.clear_new_work();
                break;
            }
            let work = self.farm.work();
            if work.is_empty() {
                debug!(miner = self.farm.index(), "No work.");
                thread::sleep(NO_WORK_POLL);
                continue;
            }

            if work.header != current.header
                || Some(work.epoch) != self.current_epoch
                || Some(work.period()) != self.current_period
            {
                if Some(work.epoch) != self.current_epoch {
                    match self.init_epoch(&work) {
                        Ok(()) => {}
                        Err(err) if is_driver_error(&err) => {
                            error!("Fatal GPU error: {err:#}");
                            error!("Terminating.");
                            std::process::exit(2);
                        }
                        Err(err) => {
                            warn!(miner = self.farm.index(), "Error CUDA mining: {err:#}");
                            self.farm.report_error(format!("{err:#}"));
                            // Peers in sequential/single mode still get
                            // their turn.
                            self.coordinator.finished_init();
                            if self.settings.exit_on_error {
                                std::process::exit(1);
                            }
                            break;
                        }
                    }
                }
                if Some(work.period()) != self.current_period {
                    if let Err(err) = self.build_period_kernel(&work) {
                        warn!(
                            miner = self.farm.index(),
                            "Kernel compilation failed: {err:#}"
                        );
                        thread::sleep(COMPILE_RETRY_DELAY);
                        continue;
                    }
                }
                current = work.clone();
            }

            let upper64 = current.boundary.upper64();
            let stratum = current.extra_size_bits >= 0;
            let mut start_nonce = current.start_nonce;
            if stratum {
                // Carve a per-device slice below the pool-assigned prefix.
                let used_bits = LOG2_MAX_MINERS + current.extra_size_bits as u32;
                if let Some(shift) = 64u32.checked_sub(used_bits) {
                    start_nonce |= (self.farm.index() as u64) << shift;
                }
            }

            match self.search(&current, upper64, stratum, start_nonce) {
                Ok(()) => {}
                Err(err) if is_driver_error(&err) => {
                    error!("Fatal GPU error: {err:#}");
                    error!("Terminating.");
                    std::process::exit(2);
                }
                Err(err) => {
                    warn!(miner = self.farm.index(), "Error CUDA mining: {err:#}");
                    self.farm.report_error(format!("{err:#}"));
                    if self.settings.exit_on_error {
                        std::process::exit(1);
                    }
                    break;
                }
            }
        }

        // Device reset: the dropped context releases every allocation.
        self.device = None;
        debug!(miner = self.farm.index(), "CUDA worker exiting");
    }

    fn resolve_device(&mut self) -> Result<CudaDeviceInfo> {
        if let Some(info) = &self.device_info {
            return Ok(info.clone());
        }
        let devices = query_cuda_devices()?;
        let info = devices
            .into_iter()
            .find(|device| device.index == self.settings.device_index)
            .ok_or_else(|| {
                anyhow!(
                    "CUDA device {} was not found by nvidia-smi",
                    self.settings.device_index
                )
            })?;
        info!(
            "Using device: {} ({} MiB)",
            info.name, info.memory_total_mib
        );
        self.device_info = Some(info.clone());
        Ok(info)
    }

    /// Rebuild the device context for a new epoch: reset, re-upload the
    /// light cache, and populate the DAG under the configured load mode.
    fn init_epoch(&mut self, work: &WorkPackage) -> Result<()> {
        self.coordinator.wait_for_turn(self.farm.index());

        let info = self.resolve_device()?;
        let dag_bytes = progpow_spec::dag_size_of_epoch(work.epoch);
        if info.memory_total_bytes() < dag_bytes {
            bail!(
                "CUDA device {} has insufficient GPU memory: {} bytes found < {} bytes required",
                info.name,
                info.memory_total_bytes(),
                dag_bytes
            );
        }

        info!(miner = self.farm.index(), epoch = work.epoch, "Initialising miner");

        // Free everything from the previous epoch before reallocating.
        self.device = None;
        let ctx = CudaContext::new(self.settings.device_index as usize)
            .map_err(|err| anyhow!("failed to open CUDA context: {err:?}"))?;
        let mut streams = Vec::with_capacity(self.settings.num_streams);
        for _ in 0..self.settings.num_streams {
            streams.push(ctx.new_stream()?);
        }
        let stream = Arc::clone(&streams[0]);

        let cache = progpow_spec::light_cache_of_epoch(work.epoch);
        info!("Allocating light with size: {}", cache.len());
        let mut light = unsafe { stream.alloc::<u8>(cache.len()) }?;
        stream.memcpy_htod(&cache, &mut light)?;

        let mut dag = unsafe { stream.alloc::<u8>(dag_bytes as usize) }?;

        if self.coordinator.generates_dag(self.settings.device_index) {
            info!(
                "Generating DAG for GPU #{} with dagBytes: {} gridSize: {}",
                self.settings.device_index, dag_bytes, self.settings.grid_size
            );
            let dag_kernel = kernel::build_dag_kernel(&ctx, dag_bytes)?;
            self.generate_dag(&stream, &dag_kernel, &mut dag, &light, &cache, dag_bytes)?;
            info!("Finished DAG");

            if self.coordinator.mode() == DagLoadMode::Single {
                info!(
                    "Copying DAG from GPU #{} to host",
                    self.settings.device_index
                );
                let mut host = vec![0u8; dag_bytes as usize];
                stream.memcpy_dtoh(&dag, &mut host)?;
                stream.synchronize()?;
                self.coordinator.publish_host_dag(host);
            }
        } else {
            let host = self.coordinator.wait_for_host_dag();
            info!(
                "Copying DAG from host to GPU #{}",
                self.settings.device_index
            );
            stream.memcpy_htod(host.as_slice(), &mut dag)?;
            stream.synchronize()?;
        }

        let mut search_buffers = Vec::with_capacity(self.settings.num_streams);
        for _ in 0..self.settings.num_streams {
            search_buffers.push(stream.alloc_zeros::<u32>(SEARCH_BUFFER_WORDS)?);
        }
        let header = stream.alloc_zeros::<u32>(8)?;
        stream.synchronize()?;

        self.device = Some(DeviceContext {
            ctx,
            streams,
            light,
            dag,
            header,
            search_buffers,
            kernel: None,
            dag_bytes,
        });
        self.current_epoch = Some(work.epoch);
        self.current_period = None;
        self.last_header = H256::ZERO;
        self.last_target = 0;
        self.pipeline.reset_index();
        self.coordinator.finished_init();
        Ok(())
    }

    fn generate_dag(
        &self,
        stream: &Arc<CudaStream>,
        dag_kernel: &CudaFunction,
        dag: &mut CudaSlice<u8>,
        light: &CudaSlice<u8>,
        cache: &[u8],
        dag_bytes: u64,
    ) -> Result<()> {
        let light_words = (cache.len() / 4) as u32;
        let dag_items = (dag_bytes / (DAG_ITEM_WORDS * 4)) as u32;
        let threads_per_launch = self.settings.grid_size * self.settings.block_size;
        let cfg = LaunchConfig {
            grid_dim: (self.settings.grid_size, 1, 1),
            block_dim: (self.settings.block_size, 1, 1),
            shared_mem_bytes: 0,
        };

        let mut base: u32 = 0;
        while base < dag_items {
            unsafe {
                let mut launch = stream.launch_builder(dag_kernel);
                launch
                    .arg(dag)
                    .arg(light)
                    .arg(&light_words)
                    .arg(&dag_items)
                    .arg(&base);
                launch.launch(cfg)?;
            }
            base = base.saturating_add(threads_per_launch);
        }
        stream.synchronize()?;
        Ok(())
    }

    fn build_period_kernel(&mut self, work: &WorkPackage) -> Result<()> {
        let device = self
            .device
            .as_mut()
            .context("device context not initialized")?;
        let function = kernel::build_search_kernel(&device.ctx, work.height, device.dag_bytes)?;
        device.kernel = Some(function);
        self.current_period = Some(work.period());
        debug!(period = work.period(), "Search kernel compiled");
        Ok(())
    }

    /// The pipelined core: keep `S` launches in flight, drain the stream
    /// whose previous batch just completed, and hand candidates to the
    /// farm. The new-work flag is consumed only at drain boundaries; an
    /// in-flight kernel always runs to completion.
    fn search(
        &mut self,
        work: &WorkPackage,
        target: u64,
        stratum: bool,
        start_nonce: u64,
    ) -> Result<()> {
        let CudaMiner {
            farm,
            settings,
            device,
            pipeline,
            last_header,
            last_target,
            ..
        } = self;
        let device = device.as_mut().context("device context not initialized")?;
        let function = device
            .kernel
            .clone()
            .context("search kernel not compiled")?;

        let mut initialize = false;
        if work.header != *last_header {
            let mut words = [0u32; 8];
            for (i, word) in words.iter_mut().enumerate() {
                *word = u32::from_le_bytes(
                    work.header.0[i * 4..(i + 1) * 4]
                        .try_into()
                        .expect("4-byte chunk"),
                );
            }
            device.streams[0].memcpy_htod(&words, &mut device.header)?;
            *last_header = work.header;
            initialize = true;
        }
        if target != *last_target {
            *last_target = target;
            initialize = true;
        }

        if initialize {
            // Let in-flight launches finish, then restart the pipeline
            // with clean result buffers.
            for stream in &device.streams {
                stream.synchronize()?;
            }
            for (stream, buffer) in device.streams.iter().zip(device.search_buffers.iter_mut()) {
                stream.memset_zeros(buffer)?;
            }
            pipeline.reset_index();
            if !stratum {
                pipeline.rebase(rand::random());
            }
        }
        if stratum && pipeline.start_nonce() != start_nonce {
            pipeline.rebase(start_nonce);
        }

        let batch_size = pipeline.batch_size();
        let cfg = LaunchConfig {
            grid_dim: (settings.grid_size, 1, 1),
            block_dim: (settings.block_size, 1, 1),
            shared_mem_bytes: 0,
        };
        let hack_false: u32 = 0;
        let mut host_words = [0u32; SEARCH_BUFFER_WORDS];

        loop {
            let launch = pipeline.advance();
            let mut found = Vec::new();

            if launch.drain_nonce_base.is_some() {
                let stream = &device.streams[launch.stream];
                stream.synchronize()?;
                let buffer = &mut device.search_buffers[launch.stream];
                stream.memcpy_dtoh(buffer, &mut host_words)?;
                if host_words[0] != 0 {
                    found = decode_search_buffer(&host_words);
                    stream.memset_zeros(buffer)?;
                }
            }

            {
                let stream = &device.streams[launch.stream];
                unsafe {
                    let mut builder = stream.launch_builder(&function);
                    builder
                        .arg(&launch.launch_nonce)
                        .arg(&device.header)
                        .arg(&target)
                        .arg(&device.dag)
                        .arg(&mut device.search_buffers[launch.stream])
                        .arg(&hack_false);
                    builder.launch(cfg)?;
                }
            }

            if let Some(nonce_base) = launch.drain_nonce_base {
                if !found.is_empty() {
                    let stale = farm.new_work_pending();
                    for hit in &found {
                        let nonce = nonce_base.wrapping_add(u64::from(hit.gid));
                        submit_candidate(farm, work, nonce, hit.mix_bytes(), settings.no_eval, stale);
                    }
                }
                farm.add_hash_count(batch_size);
                if farm.take_new_work() {
                    debug!(miner = farm.index(), "New work; leaving search");
                    break;
                }
                if farm.should_stop() {
                    farm.clear_new_work();
                    break;
                }
            }
        }
        Ok(())
    }
}

fn is_driver_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<DriverError>().is_some())
}
