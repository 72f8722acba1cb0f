use std::ffi::OsString;
use std::path::PathBuf;

use structopt::StructOpt;
use structopt::clap::ErrorKind;

use rdmagen::error::ConfigError;
use rdmagen::meter::ReportMode;
use rdmagen::pipeline::{DEFAULT_BATCH, DEFAULT_DEPTH};
use rdmagen::pipeline::rx::DEFAULT_FRAME_SIZE;
use rdmagen::{PipelineConfig, PollMode, Replenish, RxConfig};

/// Exit status of a malformed command line.
pub const USAGE_EXIT: i32 = -1;

/// Send packets in a loop, as fast as the card takes them.
#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "rdmagen-tx")]
pub struct TxOptions {
    /// The RDMA device to send on, e.g. mlx5_0.
    pub device: String,

    /// A pcap capture whose packets are sent, instead of a single DNS query.
    #[structopt(parse(from_os_str))]
    pub capture: Option<PathBuf>,

    #[structopt(flatten)]
    pub pipeline: PipelineOptions,

    /// When to print throughput, `adaptive` or `fixed`.
    #[structopt(long, default_value = "adaptive")]
    pub report: ReportMode,
}

/// Receive a copy of all traffic of a port and count it.
#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "rdmagen-rx")]
pub struct RxOptions {
    /// The RDMA device to listen on, e.g. mlx5_0.
    pub device: String,

    #[structopt(flatten)]
    pub pipeline: PipelineOptions,

    /// Size of each receive buffer.
    #[structopt(long, default_value = "9216")]
    pub frame_size: usize,

    /// When to repost receive buffers, `boundary` or `counted`.
    #[structopt(long, default_value = "boundary")]
    pub replenish: Replenish,
}

#[derive(Clone, Debug, StructOpt)]
pub struct PipelineOptions {
    /// Number of batches kept in flight.
    #[structopt(long, default_value = "2")]
    pub depth: usize,

    /// Number of work requests per batch.
    #[structopt(long, default_value = "1024")]
    pub batch: usize,

    /// How to wait for completions, `spin` or `block`.
    #[structopt(long, default_value = "spin")]
    pub poll: PollMode,

    /// The port of the device.
    #[structopt(long, default_value = "1")]
    pub port: u8,
}

impl PipelineOptions {
    pub fn config(&self) -> Result<PipelineConfig, ConfigError> {
        Ok(PipelineConfig::new(self.depth, self.batch)?
            .with_poll(self.poll)
            .with_port(self.port))
    }
}

impl RxOptions {
    /// Options for `device` with every default.
    pub fn new(device: impl Into<String>) -> Self {
        RxOptions {
            device: device.into(),
            pipeline: PipelineOptions::default(),
            frame_size: DEFAULT_FRAME_SIZE,
            replenish: Replenish::Boundary,
        }
    }

    pub fn config(&self) -> Result<RxConfig, ConfigError> {
        Ok(RxConfig::new(self.pipeline.config()?, self.frame_size)?
            .with_replenish(self.replenish))
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            depth: DEFAULT_DEPTH,
            batch: DEFAULT_BATCH,
            poll: PollMode::Spin,
            port: rdmagen::nic::DEFAULT_PORT,
        }
    }
}

impl TxOptions {
    /// Options for `device` with every default.
    pub fn new(device: impl Into<String>) -> Self {
        TxOptions {
            device: device.into(),
            capture: None,
            pipeline: PipelineOptions::default(),
            report: ReportMode::Adaptive,
        }
    }
}

/// Parse the options from an argument list.
///
/// Help and version requests are printed and exit successfully. Anything else that is wrong
/// with the arguments is returned as the usage message.
pub fn parse_from<T, I>(args: I) -> Result<T, String>
where
    T: StructOpt,
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    match T::from_iter_safe(args) {
        Ok(options) => Ok(options),
        Err(err) => match err.kind {
            ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed => err.exit(),
            _ => Err(err.message),
        },
    }
}

/// Parse the options of the process, exiting with the usage on error.
pub fn parse<T: StructOpt>() -> T {
    match parse_from(std::env::args_os()) {
        Ok(options) => options,
        Err(usage) => {
            eprintln!("{}", usage);
            std::process::exit(USAGE_EXIT)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_defaults() {
        let options: TxOptions = parse_from(["rdmagen-tx", "mlx5_0"]).unwrap();
        assert_eq!(options.device, "mlx5_0");
        assert_eq!(options.capture, None);
        assert_eq!(options.report, ReportMode::Adaptive);
        assert_eq!(options.pipeline.config().unwrap(), PipelineConfig::default());
    }

    #[test]
    fn tx_capture_and_flags() {
        let options: TxOptions = parse_from([
            "rdmagen-tx", "mlx5_1", "dns.pcap",
            "--depth", "4", "--batch", "256", "--poll", "block", "--report", "fixed",
        ]).unwrap();
        assert_eq!(options.capture, Some(PathBuf::from("dns.pcap")));
        assert_eq!(options.report, ReportMode::FIXED);
        let config = options.pipeline.config().unwrap();
        assert_eq!((config.depth(), config.batch(), config.poll()), (4, 256, PollMode::Block));
    }

    #[test]
    fn wrong_arity() {
        assert!(parse_from::<TxOptions, _>(["rdmagen-tx"]).is_err());
        assert!(parse_from::<TxOptions, _>(["rdmagen-tx", "mlx5_0", "a.pcap", "b.pcap"]).is_err());
        assert!(parse_from::<RxOptions, _>(["rdmagen-rx", "mlx5_0", "a.pcap"]).is_err());
    }

    #[test]
    fn rx_flags() {
        let options: RxOptions = parse_from([
            "rdmagen-rx", "mlx5_0", "--replenish", "counted", "--frame-size", "2048", "--port", "2",
        ]).unwrap();
        let config = options.config().unwrap();
        assert_eq!(config.replenish(), Replenish::Counted);
        assert_eq!(config.frame_size(), 2048);
        assert_eq!(config.pipeline().port(), 2);
        assert!(parse_from::<RxOptions, _>(["rdmagen-rx", "mlx5_0", "--poll", "yield"]).is_err());
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let options: TxOptions = parse_from(["rdmagen-tx", "mlx5_0", "--batch", "0"]).unwrap();
        assert_eq!(options.pipeline.config(), Err(ConfigError::ZeroBatch));
        assert_eq!(RxOptions::new("mlx5_0").config().unwrap(), RxConfig::default());
    }
}
