use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use crate::backend::dag::DagLoadMode;
use crate::farm::FarmConfig;
use crate::stratum::{ClientConfig, EndPoint};

#[derive(Debug, Clone, Parser)]
#[command(name = "progminer", version, about = "ProgPoW/Ethash GPU pool miner")]
pub struct Options {
    /// Pool URL: <dialect>+<transport>://user[:pass]@host:port
    /// (dialects: stratum, ethproxy, ethstratum; transports: tcp, tls,
    /// tls12, ssl)
    #[arg(short = 'P', long = "pool", verbatim_doc_comment)]
    pub pool: String,

    /// Email sent with the ethproxy login.
    #[arg(long)]
    pub email: Option<String>,

    /// Seconds without new work before the connection is dropped.
    #[arg(long, default_value_t = 180)]
    pub work_timeout: u64,

    /// Report hashrate to the pool via eth_submitHashrate.
    #[arg(long)]
    pub report_hashrate: bool,

    /// CUDA devices to mine on; default is every device nvidia-smi lists.
    #[arg(long = "cuda-devices", value_delimiter = ',')]
    pub cuda_devices: Vec<u32>,

    #[arg(long, default_value_t = 1024)]
    pub cuda_grid_size: u32,

    /// Threads per block; rounded up to a multiple of 8.
    #[arg(long, default_value_t = 512)]
    pub cuda_block_size: u32,

    /// Parallel CUDA streams (and in-flight search batches) per device.
    #[arg(long, default_value_t = 2)]
    pub cuda_streams: usize,

    #[arg(long, value_enum, default_value = "parallel")]
    pub dag_load_mode: DagLoadModeArg,

    /// Device that generates the DAG in `single` load mode.
    #[arg(long, default_value_t = 0)]
    pub dag_create_device: u32,

    /// Submit kernel results without host re-evaluation.
    #[arg(long)]
    pub no_eval: bool,

    /// Exit the whole process when a worker hits a device error.
    #[arg(long)]
    pub exit_on_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DagLoadModeArg {
    Parallel,
    Sequential,
    Single,
}

impl From<DagLoadModeArg> for DagLoadMode {
    fn from(arg: DagLoadModeArg) -> DagLoadMode {
        match arg {
            DagLoadModeArg::Parallel => DagLoadMode::Parallel,
            DagLoadModeArg::Sequential => DagLoadMode::Sequential,
            DagLoadModeArg::Single => DagLoadMode::Single,
        }
    }
}

impl Options {
    pub fn endpoint(&self) -> Result<EndPoint> {
        let mut endpoint: EndPoint = self.pool.parse()?;
        endpoint.email = self.email.clone();
        Ok(endpoint)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            work_timeout: Duration::from_secs(self.work_timeout.max(1)),
            report_hashrate: self.report_hashrate,
            ..ClientConfig::default()
        }
    }

    pub fn farm_config(&self, devices: Vec<u32>) -> FarmConfig {
        FarmConfig {
            devices,
            grid_size: self.cuda_grid_size.max(1),
            block_size: round_block_size(self.cuda_block_size),
            num_streams: self.cuda_streams.max(1),
            dag_load_mode: self.dag_load_mode.into(),
            dag_create_device: self.dag_create_device,
            no_eval: self.no_eval,
            exit_on_error: self.exit_on_error,
        }
    }
}

/// The kernel assumes warps of 8-aligned blocks.
pub fn round_block_size(block_size: u32) -> u32 {
    (block_size.max(1) + 7) / 8 * 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::Dialect;

    #[test]
    fn block_size_rounds_up_to_a_multiple_of_eight() {
        assert_eq!(round_block_size(1), 8);
        assert_eq!(round_block_size(8), 8);
        assert_eq!(round_block_size(9), 16);
        assert_eq!(round_block_size(512), 512);
    }

    #[test]
    fn options_parse_and_assemble_configs() {
        let options = Options::try_parse_from([
            "progminer",
            "-P",
            "ethstratum+tls://wallet.rig:pw@pool.example:4444",
            "--work-timeout",
            "60",
            "--cuda-devices",
            "0,2",
            "--cuda-block-size",
            "100",
            "--dag-load-mode",
            "single",
            "--report-hashrate",
        ])
        .expect("options should parse");

        let endpoint = options.endpoint().expect("endpoint should parse");
        assert_eq!(endpoint.dialect, Dialect::EthereumStratum);
        assert_eq!(endpoint.host, "pool.example");

        let client = options.client_config();
        assert_eq!(client.work_timeout, Duration::from_secs(60));
        assert!(client.report_hashrate);

        let farm = options.farm_config(options.cuda_devices.clone());
        assert_eq!(farm.devices, vec![0, 2]);
        assert_eq!(farm.block_size, 104);
        assert_eq!(farm.dag_load_mode, DagLoadMode::Single);
    }
}
