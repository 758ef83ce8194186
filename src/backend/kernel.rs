//! Per-period JIT compilation of the search kernel.
//!
//! ProgPoW specializes its inner loop every `PROGPOW_PERIOD` blocks. The
//! period prelude comes from `progpow_spec::kernel_source`; the fixed
//! runtime source is embedded at build time and appended to it, then the
//! concatenation goes through NVRTC for the device's compute capability.
//! Neither source text nor PTX ever touches disk.

use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use cudarc::driver::{CudaContext, CudaFunction};
use cudarc::nvrtc::{result as nvrtc_result, sys as nvrtc_sys, Ptx};
use tracing::debug;

use progpow_spec::{PROGPOW_DAG_LOADS, PROGPOW_LANES};

/// Fixed runtime source for `progpow_search`.
const SEARCH_KERNEL_SOURCE: &str = include_str!("progpow_kernel.cu");
/// Standalone DAG-generation kernel, compiled once per epoch init.
const DAG_KERNEL_SOURCE: &str = include_str!("progpow_dag.cu");

/// DAG element count as the kernel macro wants it.
pub fn dag_elements(dag_bytes: u64) -> u64 {
    dag_bytes / (PROGPOW_LANES * PROGPOW_DAG_LOADS * 4)
}

/// Compile the period-specialized search kernel for the block at `height`
/// and load it into `ctx`.
pub fn build_search_kernel(
    ctx: &Arc<CudaContext>,
    height: u64,
    dag_bytes: u64,
) -> Result<CudaFunction> {
    let mut source = progpow_spec::kernel_source(height);
    source.push_str(SEARCH_KERNEL_SOURCE);
    load_kernel(ctx, &source, "progpow_kernel.cu", dag_bytes, "progpow_search")
}

/// Compile the standalone DAG-generation kernel.
pub fn build_dag_kernel(ctx: &Arc<CudaContext>, dag_bytes: u64) -> Result<CudaFunction> {
    load_kernel(
        ctx,
        DAG_KERNEL_SOURCE,
        "progpow_dag.cu",
        dag_bytes,
        "progpow_generate_dag",
    )
}

fn load_kernel(
    ctx: &Arc<CudaContext>,
    source: &str,
    program_name: &str,
    dag_bytes: u64,
    entry_point: &str,
) -> Result<CudaFunction> {
    let (major, minor) = ctx
        .compute_capability()
        .map_err(|err| anyhow!("failed to query compute capability: {err:?}"))?;
    let options = vec![
        format!("--gpu-architecture=compute_{major}{minor}"),
        format!("-DPROGPOW_DAG_ELEMENTS={}", dag_elements(dag_bytes)),
        "-lineinfo".to_string(),
    ];

    let ptx = compile_ptx_with_nvrtc(source, program_name, &options)?;
    let module = ctx
        .load_module(Ptx::from_src(ptx))
        .map_err(|err| anyhow!("failed to load compiled PTX: {err:?}"))?;
    module
        .load_function(entry_point)
        .map_err(|err| anyhow!("kernel symbol '{entry_point}' not found: {err:?}"))
}

fn compile_ptx_with_nvrtc(source: &str, program_name: &str, options: &[String]) -> Result<String> {
    let source_c = CString::new(source)
        .map_err(|_| anyhow!("CUDA kernel source contains interior NUL byte"))?;
    let program_name_c = CString::new(program_name)
        .map_err(|_| anyhow!("CUDA program name contains interior NUL byte"))?;

    let program = nvrtc_result::create_program(&source_c, Some(&program_name_c))
        .map_err(|err| anyhow!("nvrtcCreateProgram failed: {err:?}"))?;

    let compile_result = unsafe { nvrtc_result::compile_program(program, options) };
    let compile_log = unsafe { nvrtc_result::get_program_log(program).ok() }
        .map(|raw| nvrtc_log_to_string(&raw))
        .unwrap_or_default();
    if !compile_log.is_empty() {
        debug!("NVRTC compile log: {compile_log}");
    }
    if let Err(err) = compile_result {
        let _ = unsafe { nvrtc_result::destroy_program(program) };
        if compile_log.is_empty() {
            bail!("nvrtcCompileProgram failed: {err:?}");
        }
        bail!("nvrtcCompileProgram failed: {err:?}; log: {compile_log}");
    }

    let ptx = unsafe {
        let mut ptx_size: usize = 0;
        nvrtc_sys::nvrtcGetPTXSize(program, &mut ptx_size as *mut usize)
            .result()
            .map_err(|err| anyhow!("nvrtcGetPTXSize failed: {err:?}"))?;
        if ptx_size == 0 {
            bail!("nvrtcGetPTXSize returned zero bytes");
        }

        let mut buffer = vec![0u8; ptx_size];
        nvrtc_sys::nvrtcGetPTX(program, buffer.as_mut_ptr().cast::<c_char>())
            .result()
            .map_err(|err| anyhow!("nvrtcGetPTX failed: {err:?}"))?;
        String::from_utf8_lossy(&buffer)
            .trim_end_matches('\0')
            .to_string()
    };

    unsafe { nvrtc_result::destroy_program(program) }
        .map_err(|err| anyhow!("nvrtcDestroyProgram failed: {err:?}"))?;

    Ok(ptx)
}

fn nvrtc_log_to_string(raw: &[c_char]) -> String {
    if raw.is_empty() {
        return String::new();
    }
    unsafe { CStr::from_ptr(raw.as_ptr()) }
        .to_string_lossy()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dag_elements_follow_the_lane_load_stride() {
        // 16 lanes * 4 loads * 4 bytes = 256 bytes per element
        assert_eq!(dag_elements(1_073_739_904), 1_073_739_904 / 256);
    }

    #[test]
    fn embedded_sources_expose_the_entry_points() {
        assert!(SEARCH_KERNEL_SOURCE.contains("progpow_search"));
        assert!(DAG_KERNEL_SOURCE.contains("progpow_generate_dag"));
    }
}
