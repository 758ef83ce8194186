//! Bookkeeping for the multi-stream search pipeline.
//!
//! The CUDA worker keeps `S` kernel launches in flight, one per stream,
//! and drains a stream's result buffer only after its previous launch
//! completed. All index and nonce arithmetic lives here so the ordering
//! invariants are testable without a device:
//!
//! - buffer `i` is drained before stream `i` is relaunched, and only once
//!   `S` launches have been issued;
//! - `current_nonce - start_nonce` is always a multiple of the batch size;
//! - the drain's `nonce_base` is exactly the launch nonce issued `S`
//!   iterations earlier, so `nonce = nonce_base + gid` names the thread
//!   that produced a result.

/// One iteration of the pipeline: which stream to touch, the nonce to
/// launch with, and (once warmed up) the nonce base of the batch being
/// drained from that same stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launch {
    pub stream: usize,
    pub launch_nonce: u64,
    pub drain_nonce_base: Option<u64>,
}

#[derive(Debug)]
pub struct SearchPipeline {
    num_streams: u64,
    batch_size: u64,
    start_nonce: u64,
    current_nonce: u64,
    current_index: u64,
}

impl SearchPipeline {
    pub fn new(num_streams: usize, grid_size: u32, block_size: u32) -> SearchPipeline {
        SearchPipeline {
            num_streams: num_streams.max(1) as u64,
            batch_size: u64::from(grid_size) * u64::from(block_size),
            start_nonce: 0,
            current_nonce: 0,
            current_index: 0,
        }
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    pub fn start_nonce(&self) -> u64 {
        self.start_nonce
    }

    /// Iterations issued since the last index reset.
    pub fn current_index(&self) -> u64 {
        self.current_index
    }

    /// Forget in-flight launches; the caller synchronizes the device and
    /// zeroes the result buffers around this.
    pub fn reset_index(&mut self) {
        self.current_index = 0;
        self.start_nonce = 0;
        self.current_nonce = 0;
    }

    /// Move to a new nonce region (pool-assigned or random start).
    pub fn rebase(&mut self, start_nonce: u64) {
        self.start_nonce = start_nonce;
        self.current_nonce = start_nonce;
    }

    pub fn advance(&mut self) -> Launch {
        self.current_index += 1;
        self.current_nonce = self.current_nonce.wrapping_add(self.batch_size);
        let stream = (self.current_index % self.num_streams) as usize;
        let drain_nonce_base = (self.current_index >= self.num_streams).then(|| {
            self.current_nonce
                .wrapping_sub(self.num_streams * self.batch_size)
        });
        Launch {
            stream,
            launch_nonce: self.current_nonce,
            drain_nonce_base,
        }
    }
}
