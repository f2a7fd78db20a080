//! Bus transports
//!
//! The bridge talks to the bus through [`BusTransport`]. The receive loop and
//! the watch loop share one transport instance, so implementations must allow
//! a `send` while another thread is blocked in `receive`.

#[cfg(target_os = "linux")]
mod socket_can;
mod virtual_bus;

#[cfg(target_os = "linux")]
pub use socket_can::SocketCanTransport;
pub use virtual_bus::{VirtualBus, VirtualEndpoint};

use crate::types::{BusFrame, MirrorError, Result};
use std::sync::Arc;
use std::time::Duration;

/// Driver name of the in-process bus
pub const VIRTUAL_DRIVER: &str = "virtual";

/// Driver name of the Linux SocketCAN interface
pub const SOCKETCAN_DRIVER: &str = "socketcan";

/// A CAN bus endpoint
pub trait BusTransport: Send + Sync {
    /// Wait at most `timeout` for the next frame
    ///
    /// Returns `Ok(None)` when the timeout elapses without traffic.
    fn receive(&self, timeout: Duration) -> Result<Option<BusFrame>>;

    /// Put a frame on the bus
    fn send(&self, frame: &BusFrame) -> Result<()>;

    /// Name of the channel this transport is bound to
    fn channel(&self) -> &str;
}

/// Open a transport for `channel` with the named driver
pub fn open(channel: &str, driver: &str) -> Result<Arc<dyn BusTransport>> {
    log::info!("Opening CAN channel {} with driver {}", channel, driver);
    match driver {
        VIRTUAL_DRIVER => Ok(Arc::new(VirtualBus::new(channel).endpoint())),
        #[cfg(target_os = "linux")]
        SOCKETCAN_DRIVER => Ok(Arc::new(SocketCanTransport::open(channel)?)),
        other => Err(MirrorError::Config(format!(
            "Unsupported CAN driver '{}' on this platform",
            other
        ))),
    }
}

/// Default channel for the local platform
pub fn platform_default_channel() -> Result<&'static str> {
    if cfg!(target_os = "linux") {
        Ok("can0")
    } else {
        Err(MirrorError::Config(format!(
            "No default CAN channel on {}, pass one explicitly",
            std::env::consts::OS
        )))
    }
}

/// Default driver for the local platform
pub fn platform_default_driver() -> Result<&'static str> {
    if cfg!(target_os = "linux") {
        Ok(SOCKETCAN_DRIVER)
    } else {
        Err(MirrorError::Config(format!(
            "No default CAN driver on {}, pass one explicitly",
            std::env::consts::OS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_virtual_driver() {
        let transport = open("vcan-test", VIRTUAL_DRIVER).unwrap();
        assert_eq!(transport.channel(), "vcan-test");
        assert!(transport.receive(Duration::from_millis(1)).unwrap().is_none());
    }

    #[test]
    fn test_unknown_driver_is_rejected() {
        assert!(matches!(open("can0", "pcan"), Err(MirrorError::Config(_))));
    }
}
