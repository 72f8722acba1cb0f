//! The command line tools around the `rdmagen` pipelines.
//!
//! Both binaries do the same: parse the options, bring up a queue pair on the named device, and
//! run their pipeline until the process is killed. Diagnostics go to standard error through
//! `tracing`, throughput samples to standard output.
use core::convert::Infallible;

use rdmagen::meter::{Report, Sample};
use rdmagen::nic::{Access, Provider};
use rdmagen::{Corpus, Error, Kind, RxPipeline, Setup, TxPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;

use config::{RxOptions, TxOptions};

/// Log to standard error, filtered by `RUST_LOG` and `info` by default.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// The exit status for an error.
pub fn exit_code(err: &Error) -> i32 {
    match err.kind() {
        Kind::Input => 2,
        Kind::Configuration | Kind::Transport => 1,
    }
}

/// Log the error and end the process.
pub fn fail(err: Error) -> ! {
    tracing::error!(kind = ?err.kind(), "{}", err);
    std::process::exit(exit_code(&err))
}

/// Print each sample as a line of its own.
pub fn print_sample(sample: &Sample) {
    println!("{}", sample);
}

/// Bring up a sending queue pair and send the corpus until something fails.
pub fn transmit<P: Provider>(provider: &mut P, options: &TxOptions, report: &mut impl Report)
    -> rdmagen::Result<Infallible>
{
    let config = options.pipeline.config()?;
    let corpus = Corpus::open(options.capture.as_deref())?;

    let endpoint = Setup::for_tx(options.device.as_str(), &config)
        .bring_up(provider, corpus.span(), Access::NONE)?;
    let mut tx = TxPipeline::new(endpoint, &corpus, config, options.report)?;

    tracing::info!(
        device = %options.device,
        depth = config.depth(),
        batch = config.batch(),
        poll = %config.poll(),
        "sending");
    tx.run(report)
}

/// Bring up a receiving queue pair and count frames until something fails.
pub fn receive<P: Provider>(provider: &mut P, options: &RxOptions, report: &mut impl Report)
    -> rdmagen::Result<Infallible>
{
    let config = options.config()?;
    let pool = config.pool()?;

    let endpoint = Setup::for_rx(options.device.as_str(), config.pipeline())
        .bring_up(provider, pool.span(), Access::LOCAL_WRITE)?;
    let mut rx = RxPipeline::new(endpoint, pool, config)?;

    tracing::info!(
        device = %options.device,
        depth = config.pipeline().depth(),
        batch = config.pipeline().batch(),
        replenish = %config.replenish(),
        "receiving");
    rx.run(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdmagen::error::{ConfigError, Op, Step};
    use rdmagen::nic::QpState;
    use rdmagen::nic::loopback::{Devices, Fault};

    fn ignore(_: &Sample) {}

    #[test]
    fn transmit_until_poll_fails() {
        let mut devices = Devices::new(["mlx5_0"]).with_fault(Fault::Poll);
        let err = transmit(&mut devices, &TxOptions::new("mlx5_0"), &mut ignore).unwrap_err();
        assert!(matches!(err, Error::Transport { op: Op::PollCq, .. }));
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn receive_until_poll_fails() {
        let mut devices = Devices::new(["mlx5_0"]).with_fault(Fault::Poll);
        let err = receive(&mut devices, &RxOptions::new("mlx5_0"), &mut ignore).unwrap_err();
        assert!(matches!(err, Error::Transport { op: Op::PollCq, .. }));
    }

    #[test]
    fn configuration_errors() {
        let mut devices = Devices::new(["mlx5_0"]);
        let err = transmit(&mut devices, &TxOptions::new("mlx5_1"), &mut ignore).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(ref name) if name == "mlx5_1"));

        let mut options = RxOptions::new("mlx5_0");
        options.frame_size = 0;
        let err = receive(&mut devices, &options, &mut ignore).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ZeroFrameSize)));

        let mut devices = Devices::new(["mlx5_0"]).with_fault(Fault::Modify(QpState::ReadyToReceive));
        let err = receive(&mut devices, &RxOptions::new("mlx5_0"), &mut ignore).unwrap_err();
        assert!(matches!(err, Error::Setup { step: Step::ModifyQp(QpState::ReadyToReceive), .. }));
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn missing_capture_is_input_error() {
        let mut devices = Devices::new(["mlx5_0"]);
        let mut options = TxOptions::new("mlx5_0");
        options.capture = Some("/nonexistent/capture.pcap".into());
        let err = transmit(&mut devices, &options, &mut ignore).unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }
}
