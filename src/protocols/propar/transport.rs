//! Serial link abstraction
//!
//! The port driver talks to a boxed async byte stream so that production
//! code runs over tokio-serial while tests run over in-memory duplex pipes.
//! A factory seam lets the serializer rebuild the link after a fatal error.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use crate::config::SerialConfig;
use crate::error::{FlowSrvError, Result};

/// Object-safe byte-stream bound for one serial link.
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Link for T {}

/// Opens fresh links; implemented over tokio-serial in production and over
/// duplex pipes in tests.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Open a new link to the physical medium.
    async fn open(&self) -> Result<Box<dyn Link>>;

    /// Port path or label, for logging and event attribution.
    fn port_name(&self) -> &str;
}

/// Production factory opening a real serial port.
#[derive(Debug, Clone)]
pub struct SerialLinkFactory {
    config: SerialConfig,
}

impl SerialLinkFactory {
    pub fn new(config: SerialConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

#[async_trait]
impl LinkFactory for SerialLinkFactory {
    async fn open(&self) -> Result<Box<dyn Link>> {
        debug!("opening serial port: {}", self.config.port);

        #[cfg_attr(not(unix), allow(unused_mut))]
        let mut port = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(self.config.byte_timeout())
            .open_native_async()
            .map_err(|e| {
                FlowSrvError::port_lost(format!(
                    "failed to open serial port {}: {e}",
                    self.config.port
                ))
            })?;

        #[cfg(unix)]
        port.set_exclusive(false)
            .map_err(|e| FlowSrvError::port_lost(format!("failed to clear exclusive mode: {e}")))?;

        info!(
            "opened serial port {} at {} baud",
            self.config.port, self.config.baud_rate
        );
        Ok(Box::new(port))
    }

    fn port_name(&self) -> &str {
        &self.config.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_invalid_config() {
        let config = SerialConfig::default();
        assert!(SerialLinkFactory::new(config).is_err());
    }

    #[test]
    fn test_factory_reports_port_name() {
        let factory = SerialLinkFactory::new(SerialConfig::new("/dev/ttyUSB7")).unwrap();
        assert_eq!(factory.port_name(), "/dev/ttyUSB7");
    }

    #[tokio::test]
    async fn test_open_missing_device_is_port_lost() {
        let factory =
            SerialLinkFactory::new(SerialConfig::new("/dev/does-not-exist-propar")).unwrap();
        match factory.open().await {
            Err(err) => assert!(matches!(err, FlowSrvError::PortLost(_))),
            Ok(_) => panic!("expected open() to fail for a missing device"),
        }
    }
}
