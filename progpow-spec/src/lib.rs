//! Ethash/ProgPoW epoch parameters and kernel specialization.
//!
//! This crate is the algorithm-side collaborator of the miner: epoch size
//! schedule, seed-hash chain, light-cache generation, host-side candidate
//! evaluation, and the per-period CUDA source prelude. Callers treat the
//! evaluation as an opaque `(epoch, header, nonce) -> (mix, value)` oracle;
//! the 256-bit `value` is compared big-endian against the work boundary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::OnceLock;

use sha3::{Digest, Keccak256, Keccak512};

/// Blocks per Ethash epoch.
pub const EPOCH_LENGTH: u64 = 30_000;
/// Blocks per ProgPoW kernel period.
pub const PROGPOW_PERIOD: u64 = 50;
/// Parallel lanes per hash in the ProgPoW inner loop.
pub const PROGPOW_LANES: u64 = 16;
/// 32-bit words fetched from the DAG per lane per access.
pub const PROGPOW_DAG_LOADS: u64 = 4;
/// Upper bound on concurrently partitioned miners (2^5 devices).
pub const LOG2_MAX_MINERS: u32 = 5;

const HASH_BYTES: u64 = 64;
const MIX_BYTES: u64 = 128;
const CACHE_BYTES_INIT: u64 = 1 << 24;
const CACHE_BYTES_GROWTH: u64 = 1 << 17;
const DATASET_BYTES_INIT: u64 = 1 << 30;
const DATASET_BYTES_GROWTH: u64 = 1 << 23;
const CACHE_ROUNDS: usize = 3;

/// Seed hashes are enumerable; anything past this is a malformed pool.
const MAX_EPOCH: u64 = 32_768;

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Size in bytes of the light cache for `epoch`.
pub fn cache_size_of_epoch(epoch: u64) -> u64 {
    let mut size = CACHE_BYTES_INIT + CACHE_BYTES_GROWTH * epoch - HASH_BYTES;
    while !is_prime(size / HASH_BYTES) {
        size -= 2 * HASH_BYTES;
    }
    size
}

/// Size in bytes of the full DAG for `epoch`.
pub fn dag_size_of_epoch(epoch: u64) -> u64 {
    let mut size = DATASET_BYTES_INIT + DATASET_BYTES_GROWTH * epoch - MIX_BYTES;
    while !is_prime(size / MIX_BYTES) {
        size -= 2 * MIX_BYTES;
    }
    size
}

/// Size in bytes of the full DAG for the epoch containing `height`.
pub fn dag_size_of_height(height: u64) -> u64 {
    dag_size_of_epoch(height / EPOCH_LENGTH)
}

/// Seed hash identifying `epoch`: Keccak-256 iterated `epoch` times over
/// the zero hash.
pub fn seed_hash_of_epoch(epoch: u64) -> [u8; 32] {
    let mut seed = [0u8; 32];
    for _ in 0..epoch {
        seed = Keccak256::digest(seed).into();
    }
    seed
}

/// Inverse of [`seed_hash_of_epoch`], memoized across calls.
///
/// Returns `None` for a seed hash that does not occur within the first
/// `MAX_EPOCH` epochs.
pub fn to_epoch(seed_hash: &[u8; 32]) -> Option<u64> {
    static TABLE: OnceLock<Mutex<SeedTable>> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        Mutex::new(SeedTable {
            chain: vec![[0u8; 32]],
            index: HashMap::from([([0u8; 32], 0)]),
        })
    });
    let mut guard = table.lock().expect("seed table lock");
    if let Some(&epoch) = guard.index.get(seed_hash) {
        return Some(epoch);
    }
    while (guard.chain.len() as u64) <= MAX_EPOCH {
        let last = *guard.chain.last().expect("chain is never empty");
        let next: [u8; 32] = Keccak256::digest(last).into();
        let epoch = guard.chain.len() as u64;
        guard.chain.push(next);
        guard.index.insert(next, epoch);
        if &next == seed_hash {
            return Some(epoch);
        }
    }
    None
}

struct SeedTable {
    chain: Vec<[u8; 32]>,
    index: HashMap<[u8; 32], u64>,
}

fn keccak512_bytes(data: &[u8]) -> [u8; 64] {
    Keccak512::digest(data).into()
}

/// Light cache generation: sequential Keccak-512 fill followed by
/// `CACHE_ROUNDS` of the RandMemoHash strengthening pass.
pub fn light_cache_of_epoch(epoch: u64) -> Vec<u8> {
    generate_light_cache(cache_size_of_epoch(epoch), &seed_hash_of_epoch(epoch))
}

fn generate_light_cache(cache_size: u64, seed: &[u8; 32]) -> Vec<u8> {
    let nodes = (cache_size / HASH_BYTES) as usize;
    let mut cache = vec![0u8; nodes * HASH_BYTES as usize];

    let mut node = keccak512_bytes(seed);
    cache[..64].copy_from_slice(&node);
    for i in 1..nodes {
        node = keccak512_bytes(&node);
        cache[i * 64..(i + 1) * 64].copy_from_slice(&node);
    }

    for _ in 0..CACHE_ROUNDS {
        for i in 0..nodes {
            let src = {
                let word =
                    u32::from_le_bytes(cache[i * 64..i * 64 + 4].try_into().expect("word slice"));
                (word as usize) % nodes
            };
            let prev = (i + nodes - 1) % nodes;
            let mut mixed = [0u8; 64];
            for (j, byte) in mixed.iter_mut().enumerate() {
                *byte = cache[src * 64 + j] ^ cache[prev * 64 + j];
            }
            let digest = keccak512_bytes(&mixed);
            cache[i * 64..(i + 1) * 64].copy_from_slice(&digest);
        }
    }

    cache
}

/// Host-side evaluation result for one `(header, nonce)` candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowResult {
    pub mix_hash: [u8; 32],
    pub value: [u8; 32],
}

/// Evaluate one candidate on the host.
///
/// Reduced-strength stand-in for the full ProgPoW dataset walk: the value
/// is a Keccak-256 fold over the header, nonce, and the epoch seed, which
/// preserves the properties the mining core depends on (deterministic,
/// epoch-sensitive, uniformly distributed 256-bit big-endian value).
pub fn eval(epoch: u64, header: &[u8; 32], nonce: u64) -> PowResult {
    let epoch_seed = seed_hash_of_epoch(epoch);

    let mut hasher = Keccak256::new();
    hasher.update(header);
    hasher.update(nonce.to_le_bytes());
    let seed: [u8; 32] = hasher.finalize().into();

    let mut hasher = Keccak256::new();
    hasher.update(seed);
    hasher.update(epoch_seed);
    let mix_hash: [u8; 32] = hasher.finalize().into();

    let mut hasher = Keccak256::new();
    hasher.update(seed);
    hasher.update(mix_hash);
    let value: [u8; 32] = hasher.finalize().into();

    PowResult { mix_hash, value }
}

/// KISS99 PRNG, the sequence generator ProgPoW specializes kernels with.
struct Kiss99 {
    z: u32,
    w: u32,
    jsr: u32,
    jcong: u32,
}

impl Kiss99 {
    fn new(z: u32, w: u32, jsr: u32, jcong: u32) -> Self {
        Self { z, w, jsr, jcong }
    }

    fn next(&mut self) -> u32 {
        self.z = 36969u32
            .wrapping_mul(self.z & 65535)
            .wrapping_add(self.z >> 16);
        self.w = 18000u32
            .wrapping_mul(self.w & 65535)
            .wrapping_add(self.w >> 16);
        let mwc = (self.z << 16).wrapping_add(self.w);
        self.jsr ^= self.jsr << 17;
        self.jsr ^= self.jsr >> 13;
        self.jsr ^= self.jsr << 5;
        self.jcong = 69069u32.wrapping_mul(self.jcong).wrapping_add(1234567);
        (mwc ^ self.jcong).wrapping_add(self.jsr)
    }
}

const FNV_PRIME: u32 = 0x0100_0193;
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

fn fnv1a(h: u32, d: u32) -> u32 {
    (h ^ d).wrapping_mul(FNV_PRIME)
}

/// Period-specialized kernel prelude for the block at `height`.
///
/// Emits the per-period random constants the runtime kernel source expects
/// (`progpow_rnd`) as CUDA text; the caller appends the fixed runtime
/// source and compiles the concatenation.
pub fn kernel_source(height: u64) -> String {
    let period = height / PROGPOW_PERIOD;
    let z = fnv1a(FNV_OFFSET_BASIS, period as u32).max(1);
    let w = fnv1a(z, (period >> 32) as u32).max(1);
    let jsr = fnv1a(w, period as u32).max(1);
    let jcong = fnv1a(jsr, (period >> 32) as u32).max(1);
    let mut rng = Kiss99::new(z, w, jsr, jcong);

    let mut src = String::with_capacity(1024);
    src.push_str(&format!(
        "// ProgPoW period {period} kernel specialization\n\
         #define PROGPOW_PERIOD_NUMBER {period}UL\n\
         #define PROGPOW_KERNEL_LANES {PROGPOW_LANES}\n\
         #define PROGPOW_KERNEL_DAG_LOADS {PROGPOW_DAG_LOADS}\n"
    ));
    src.push_str("__device__ __constant__ uint32_t progpow_rnd[16] = {\n");
    for chunk in 0..4 {
        src.push_str("    ");
        for i in 0..4 {
            src.push_str(&format!("0x{:08x}u", rng.next()));
            if chunk != 3 || i != 3 {
                src.push_str(", ");
            }
        }
        src.push('\n');
    }
    src.push_str("};\n\n");
    src
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_zero_sizes_match_known_schedule() {
        assert_eq!(cache_size_of_epoch(0), 16_776_896);
        assert_eq!(dag_size_of_epoch(0), 1_073_739_904);
    }

    #[test]
    fn sizes_grow_with_epoch() {
        assert!(cache_size_of_epoch(10) > cache_size_of_epoch(0));
        assert!(dag_size_of_epoch(10) > dag_size_of_epoch(0));
        assert_eq!(dag_size_of_height(EPOCH_LENGTH + 1), dag_size_of_epoch(1));
    }

    #[test]
    fn seed_hash_round_trips_through_to_epoch() {
        for epoch in [0u64, 1, 2, 17, 300] {
            let seed = seed_hash_of_epoch(epoch);
            assert_eq!(to_epoch(&seed), Some(epoch), "epoch {epoch}");
        }
    }

    #[test]
    fn unknown_seed_hash_is_rejected() {
        let bogus = [0xabu8; 32];
        assert_eq!(to_epoch(&bogus), None);
    }

    #[test]
    fn light_cache_is_deterministic() {
        let seed = seed_hash_of_epoch(0);
        let a = generate_light_cache(64 * 127, &seed);
        let b = generate_light_cache(64 * 127, &seed);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64 * 127);
        assert_ne!(&a[..64], &[0u8; 64][..]);
    }

    #[test]
    fn eval_depends_on_nonce_and_epoch() {
        let header = [7u8; 32];
        let a = eval(0, &header, 1);
        let b = eval(0, &header, 2);
        let c = eval(1, &header, 1);
        assert_ne!(a.value, b.value);
        assert_ne!(a.value, c.value);
        assert_eq!(a, eval(0, &header, 1));
    }

    #[test]
    fn kernel_source_is_stable_within_a_period() {
        let a = kernel_source(100);
        let b = kernel_source(149);
        let c = kernel_source(150);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.contains("progpow_rnd"));
        assert!(a.contains("#define PROGPOW_PERIOD_NUMBER 2UL"));
    }
}
