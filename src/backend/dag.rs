//! DAG load coordination across workers.
//!
//! Three modes bound host-side pressure while multiple devices build the
//! same multi-gigabyte dataset:
//!
//! - **Parallel**: every device generates its own DAG from its cache.
//! - **Sequential**: workers initialize one at a time in index order.
//! - **Single**: one designated device generates the DAG and shares it
//!   through a host buffer; the others copy it down. The buffer is freed
//!   once every worker has finished initializing.
//!
//! Waiting is plain 100 ms polling; initialization is seconds-to-minutes
//! long, nothing here is hot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DagLoadMode {
    Parallel,
    Sequential,
    Single,
}

/// Shared between all workers of one farm; passed in at construction
/// instead of living in process-wide statics.
pub struct DagLoadCoordinator {
    mode: DagLoadMode,
    generate_device: u32,
    workers: usize,
    load_index: AtomicUsize,
    finished: AtomicUsize,
    host_dag: Mutex<Option<Arc<Vec<u8>>>>,
}

impl DagLoadCoordinator {
    pub fn new(mode: DagLoadMode, generate_device: u32, workers: usize) -> DagLoadCoordinator {
        DagLoadCoordinator {
            mode,
            generate_device,
            workers: workers.max(1),
            load_index: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            host_dag: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> DagLoadMode {
        self.mode
    }

    /// In sequential mode, worker `index` holds here until every
    /// lower-indexed worker has finished initializing.
    pub fn wait_for_turn(&self, worker_index: usize) {
        if self.mode != DagLoadMode::Sequential {
            return;
        }
        while self.load_index.load(Ordering::Acquire) < worker_index {
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// In single mode, only the designated device generates; everyone else
    /// copies from the shared host buffer.
    pub fn generates_dag(&self, device_index: u32) -> bool {
        self.mode != DagLoadMode::Single || device_index == self.generate_device
    }

    /// Publish the generated DAG for the waiting consumers. The swap from
    /// `None` to `Some` is the producer→consumer hand-off.
    pub fn publish_host_dag(&self, dag: Vec<u8>) {
        let mut slot = self.host_dag.lock().expect("host DAG lock");
        *slot = Some(Arc::new(dag));
    }

    /// Block (100 ms polls) until the designated device has published.
    pub fn wait_for_host_dag(&self) -> Arc<Vec<u8>> {
        loop {
            if let Some(dag) = self.host_dag.lock().expect("host DAG lock").clone() {
                return dag;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Every worker reports here after its device holds the DAG; the last
    /// one releases the shared host buffer and unblocks the next
    /// sequential worker.
    pub fn finished_init(&self) {
        self.load_index.fetch_add(1, Ordering::Release);
        let done = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        if self.mode == DagLoadMode::Single && done >= self.workers {
            let mut slot = self.host_dag.lock().expect("host DAG lock");
            *slot = None;
        }
    }

    /// A new epoch restarts the whole dance.
    pub fn reset_for_new_epoch(&self) {
        self.load_index.store(0, Ordering::Release);
        self.finished.store(0, Ordering::Release);
        let mut slot = self.host_dag.lock().expect("host DAG lock");
        *slot = None;
    }

    #[cfg(test)]
    fn host_dag_is_freed(&self) -> bool {
        self.host_dag.lock().expect("host DAG lock").is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn parallel_mode_lets_everyone_generate() {
        let coordinator = DagLoadCoordinator::new(DagLoadMode::Parallel, 0, 4);
        assert!(coordinator.generates_dag(0));
        assert!(coordinator.generates_dag(3));
        coordinator.wait_for_turn(3); // returns immediately
    }

    #[test]
    fn sequential_mode_orders_workers_by_index() {
        let coordinator = Arc::new(DagLoadCoordinator::new(DagLoadMode::Sequential, 0, 3));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in (0..3usize).rev() {
            let coordinator = Arc::clone(&coordinator);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                coordinator.wait_for_turn(index);
                order.lock().expect("order lock").push(index);
                coordinator.finished_init();
            }));
        }
        for handle in handles {
            handle.join().expect("worker thread");
        }
        assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2]);
    }

    /// Single mode with two devices, device 0 designated: device 1 polls
    /// until the host buffer appears, copies it, and after both workers
    /// report in, the host buffer is freed.
    #[test]
    fn single_mode_shares_then_frees_the_host_dag() {
        let coordinator = Arc::new(DagLoadCoordinator::new(DagLoadMode::Single, 0, 2));
        assert!(coordinator.generates_dag(0));
        assert!(!coordinator.generates_dag(1));

        let consumer = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                let started = Instant::now();
                let dag = coordinator.wait_for_host_dag();
                let waited = started.elapsed();
                let copy = dag.to_vec();
                drop(dag);
                coordinator.finished_init();
                (copy, waited)
            })
        };

        // Give the consumer time to observe the empty slot and sleep.
        thread::sleep(Duration::from_millis(250));
        coordinator.publish_host_dag(vec![0xda; 1024]);
        coordinator.finished_init();

        let (copy, waited) = consumer.join().expect("consumer thread");
        assert_eq!(copy, vec![0xda; 1024]);
        assert!(
            waited >= Duration::from_millis(100),
            "consumer should have polled while the producer generated"
        );
        assert!(coordinator.host_dag_is_freed());
    }

    #[test]
    fn epoch_reset_rearms_the_coordinator() {
        let coordinator = DagLoadCoordinator::new(DagLoadMode::Single, 0, 1);
        coordinator.publish_host_dag(vec![1, 2, 3]);
        coordinator.finished_init();
        assert!(coordinator.host_dag_is_freed());

        coordinator.reset_for_new_epoch();
        coordinator.publish_host_dag(vec![4, 5, 6]);
        assert_eq!(*coordinator.wait_for_host_dag(), vec![4, 5, 6]);
    }
}
