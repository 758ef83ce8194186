//! GPU mining backend: device discovery, the search-result buffer layout,
//! DAG load coordination, and the CUDA worker itself.

use anyhow::{bail, Context, Result};

pub mod dag;
pub mod pipeline;

#[cfg(feature = "cuda")]
pub mod cuda;
#[cfg(feature = "cuda")]
pub mod kernel;

/// It is virtually impossible to get more than one solution per stream
/// batch; leave room for four.
pub const SEARCH_RESULTS: usize = 4;

/// One result slot is a gid word plus eight mix words.
const RESULT_STRIDE: usize = 9;

/// 32-bit words per search-result buffer: a count word plus the slots.
pub const SEARCH_BUFFER_WORDS: usize = 1 + SEARCH_RESULTS * RESULT_STRIDE;

/// One candidate the kernel reported: thread gid and the mix it computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundNonce {
    pub gid: u32,
    pub mix: [u32; 8],
}

impl FoundNonce {
    /// Kernel mix words laid out little-endian into the 32-byte hash.
    pub fn mix_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, word) in self.mix.iter().enumerate() {
            bytes[i * 4..(i + 1) * 4].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}

/// Decode a drained result buffer, clamping the count word to the slot
/// capacity (the kernel increments past it on overflow).
pub fn decode_search_buffer(words: &[u32; SEARCH_BUFFER_WORDS]) -> Vec<FoundNonce> {
    let count = (words[0] as usize).min(SEARCH_RESULTS);
    let mut found = Vec::with_capacity(count);
    for slot in 0..count {
        let base = 1 + slot * RESULT_STRIDE;
        let mut mix = [0u32; 8];
        mix.copy_from_slice(&words[base + 1..base + 9]);
        found.push(FoundNonce {
            gid: words[base],
            mix,
        });
    }
    found
}

#[derive(Debug, Clone)]
pub struct CudaDeviceInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mib: u64,
}

impl CudaDeviceInfo {
    pub fn memory_total_bytes(&self) -> u64 {
        self.memory_total_mib.saturating_mul(1024 * 1024)
    }
}

/// Enumerate CUDA devices through `nvidia-smi`; the driver API owns the
/// devices once workers start, this is only for selection and the
/// DAG-fits-in-memory check.
pub fn query_cuda_devices() -> Result<Vec<CudaDeviceInfo>> {
    let output = std::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .context("failed to execute nvidia-smi; ensure NVIDIA drivers are installed")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            bail!(
                "nvidia-smi returned non-zero exit status ({})",
                output.status
            );
        }
        bail!("nvidia-smi query failed: {stderr}");
    }

    let stdout = String::from_utf8(output.stdout).context("nvidia-smi output was not UTF-8")?;
    let devices = parse_nvidia_smi_query_output(&stdout)?;
    if devices.is_empty() {
        bail!("nvidia-smi reported no CUDA devices");
    }
    Ok(devices)
}

fn parse_nvidia_smi_query_output(raw: &str) -> Result<Vec<CudaDeviceInfo>> {
    let mut devices = Vec::new();
    for (line_idx, raw_line) in raw.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let columns = line.split(',').map(str::trim).collect::<Vec<_>>();
        if columns.len() < 3 {
            bail!(
                "unexpected nvidia-smi output at line {}: '{line}'",
                line_idx + 1
            );
        }

        let index = columns[0].parse::<u32>().with_context(|| {
            format!("invalid GPU index '{}' at line {}", columns[0], line_idx + 1)
        })?;
        let memory_column = columns.len() - 1;
        let memory_total_mib = columns[memory_column].parse::<u64>().with_context(|| {
            format!(
                "invalid GPU memory.total value '{}' at line {}",
                columns[memory_column],
                line_idx + 1
            )
        })?;
        // GPU names may themselves contain commas.
        let name = columns[1..memory_column].join(",").trim().to_string();
        if name.is_empty() {
            bail!("missing GPU name at line {}", line_idx + 1);
        }

        devices.push(CudaDeviceInfo {
            index,
            name,
            memory_total_mib,
        });
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nvidia_smi_query_output_parses_multiple_rows() {
        let parsed = parse_nvidia_smi_query_output(
            "0, NVIDIA GeForce RTX 3080, 10240\n1, NVIDIA RTX A4000, 16384\n",
        )
        .expect("query output should parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].index, 0);
        assert_eq!(parsed[0].name, "NVIDIA GeForce RTX 3080");
        assert_eq!(parsed[0].memory_total_mib, 10_240);
        assert_eq!(parsed[1].index, 1);
        assert_eq!(parsed[1].memory_total_bytes(), 16_384 * 1024 * 1024);
    }

    #[test]
    fn parse_nvidia_smi_query_output_rejects_invalid_rows() {
        let err =
            parse_nvidia_smi_query_output("abc, RTX, 8192").expect_err("invalid index should fail");
        assert!(format!("{err:#}").contains("invalid GPU index"));
    }

    #[test]
    fn decode_search_buffer_reads_slots_in_order() {
        let mut words = [0u32; SEARCH_BUFFER_WORDS];
        words[0] = 2;
        words[1] = 41; // gid of slot 0
        words[2..10].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        words[10] = 77; // gid of slot 1
        let found = decode_search_buffer(&words);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].gid, 41);
        assert_eq!(found[1].gid, 77);
        let bytes = found[0].mix_bytes();
        assert_eq!(&bytes[..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[28..], &8u32.to_le_bytes());
    }

    #[test]
    fn decode_search_buffer_clamps_overflowed_counts() {
        let mut words = [0u32; SEARCH_BUFFER_WORDS];
        words[0] = 250;
        let found = decode_search_buffer(&words);
        assert_eq!(found.len(), SEARCH_RESULTS);
    }
}
