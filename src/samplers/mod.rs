//! Sampler adapters, one per supported receiver kind.
//!
//! Every adapter does exactly one thing: produce one [`MetricRecord`] when
//! asked. The orchestrator selects the adapter matching the configured
//! demodulator at startup and never switches.

pub mod satip;
pub mod sdr;
pub mod standalone;
pub mod usb;

use std::fmt;

use crate::config::{MonitorContext, ReceiverConfig};
use crate::MetricRecord;

pub use satip::SatIpSampler;
pub use sdr::SdrSampler;
pub use standalone::StandaloneSampler;
pub use usb::UsbSampler;

/// Result type alias for sampling operations
pub type SampleResult = Result<MetricRecord, SampleError>;

/// Errors produced while taking one sample
#[derive(Debug)]
pub enum SampleError {
    /// The device did not answer in time; retried next tick
    ReceiverUnreachable(String),

    /// The device answered with something unparseable; retried next tick
    ReceiverMalformed(String),

    /// The metric source is gone for good (subprocess exited, pipe closed)
    SourceClosed(String),
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleError::ReceiverUnreachable(msg) => {
                write!(f, "receiver unreachable: {}", msg)
            }
            SampleError::ReceiverMalformed(msg) => {
                write!(f, "malformed receiver response: {}", msg)
            }
            SampleError::SourceClosed(msg) => write!(f, "metric source closed: {}", msg),
        }
    }
}

impl std::error::Error for SampleError {}

impl SampleError {
    /// Fatal errors terminate the orchestrator; everything else is retried
    /// on the next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SampleError::SourceClosed(_))
    }
}

/// The selected adapter, held by the orchestrator as an opaque capability.
pub enum Sampler {
    Standalone(StandaloneSampler),
    Usb(UsbSampler),
    Sdr(SdrSampler),
    SatIp(SatIpSampler),
}

impl Sampler {
    /// Build the adapter matching the configured receiver kind.
    pub async fn from_context(ctx: &MonitorContext) -> anyhow::Result<Self> {
        match &ctx.config.receiver {
            ReceiverConfig::Standalone {
                address,
                community,
                timeout,
            } => Ok(Sampler::Standalone(StandaloneSampler::new(
                address.clone(),
                community.clone(),
                std::time::Duration::from_secs(*timeout),
            ))),
            ReceiverConfig::Usb {
                adapter,
                frontend,
                channel_conf,
            } => Ok(Sampler::Usb(UsbSampler::launch(
                *adapter,
                *frontend,
                channel_conf,
            )?)),
            ReceiverConfig::Sdr { pipe } => Ok(Sampler::Sdr(SdrSampler::open(pipe).await?)),
            ReceiverConfig::SatIp {
                address,
                port,
                username,
                password,
            } => Ok(Sampler::SatIp(SatIpSampler::new(
                address,
                *port,
                username.clone(),
                password.clone(),
            )?)),
        }
    }

    /// Produce one record.
    pub async fn sample(&mut self) -> SampleResult {
        match self {
            Sampler::Standalone(sampler) => sampler.sample().await,
            Sampler::Usb(sampler) => sampler.sample().await,
            Sampler::Sdr(sampler) => sampler.sample().await,
            Sampler::SatIp(sampler) => sampler.sample().await,
        }
    }
}

/// Keep only finite numbers; adapters never emit NaN or infinities.
pub(crate) fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}
