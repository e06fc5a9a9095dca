//! Low-level probe transport.
//!
//! A transport is bound to exactly one probe address and only knows how to push
//! a command out and pull a fixed-size response back. Both calls block the
//! calling thread. Timing (the settle delay between write and read) belongs to
//! the caller.

use crate::error::TransportError;
use embedded_hal::i2c::{Error as _, I2c};

/// Largest response an Atlas-style probe returns: status byte plus payload.
pub const MAX_RESPONSE_LEN: usize = 32;

/// Blocking command/response transport for one probe.
pub trait SensorTransport: Send {
    /// Write a command to the probe.
    fn write_command(&mut self, cmd: &[u8]) -> Result<(), TransportError>;

    /// Read up to `max_len` bytes of response.
    fn read_response(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Human readable endpoint name for logs (e.g. `/dev/i2c-1@0x61`).
    fn describe(&self) -> String;
}

impl<T: SensorTransport + ?Sized> SensorTransport for Box<T> {
    fn write_command(&mut self, cmd: &[u8]) -> Result<(), TransportError> {
        (**self).write_command(cmd)
    }

    fn read_response(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read_response(max_len)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Probe transport over any blocking `embedded-hal` I2C bus.
///
/// Commands are sent as ASCII followed by a NUL terminator, the framing the
/// probes accept in I2C mode.
pub struct I2cTransport<I> {
    bus: I,
    address: u8,
    target: String,
}

impl<I: I2c> I2cTransport<I> {
    /// Bind `bus` to the probe at `address`. `label` names the bus in logs.
    pub fn new(bus: I, address: u8, label: impl Into<String>) -> Self {
        let target = format!("{}@0x{:02x}", label.into(), address);
        Self {
            bus,
            address,
            target,
        }
    }
}

impl<I> SensorTransport for I2cTransport<I>
where
    I: I2c + Send,
{
    fn write_command(&mut self, cmd: &[u8]) -> Result<(), TransportError> {
        let mut framed = Vec::with_capacity(cmd.len() + 1);
        framed.extend_from_slice(cmd);
        framed.push(0);

        self.bus
            .write(self.address, &framed)
            .map_err(|e| TransportError::Bus {
                target: self.target.clone(),
                reason: format!("{:?}", e.kind()),
            })
    }

    fn read_response(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buffer = vec![0u8; max_len.min(MAX_RESPONSE_LEN)];
        self.bus
            .read(self.address, &mut buffer)
            .map_err(|e| TransportError::Bus {
                target: self.target.clone(),
                reason: format!("{:?}", e.kind()),
            })?;
        Ok(buffer)
    }

    fn describe(&self) -> String {
        self.target.clone()
    }
}

/// Open `/dev/i2c-<bus>` and bind it to the probe at `address`.
///
/// Each probe gets its own file handle, so probes on the same bus can be
/// polled from different worker threads.
#[cfg(feature = "hardware_i2c")]
pub fn open_i2c(bus: u8, address: u8) -> Result<Box<dyn SensorTransport>, TransportError> {
    let path = format!("/dev/i2c-{}", bus);
    let dev = linux_embedded_hal::I2cdev::new(&path).map_err(|e| TransportError::Open {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    tracing::debug!(path = %path, address = format_args!("0x{:02x}", address), "Opened I2C bus");
    Ok(Box::new(I2cTransport::new(dev, address, path)))
}

/// I2C support is compiled out; every open fails.
#[cfg(not(feature = "hardware_i2c"))]
pub fn open_i2c(_bus: u8, _address: u8) -> Result<Box<dyn SensorTransport>, TransportError> {
    Err(TransportError::FeatureDisabled)
}
