//! Probe hardware access.
//!
//! - `transport` - the blocking [`SensorTransport`] contract and its I2C implementation
//! - `channel` - [`SharedChannel`] / [`ChannelGuard`] exclusive owner access
//! - `mock` - scripted and simulated transports
//! - `array` - the six-probe [`ProbeArray`] and its startup check

pub mod array;
pub mod channel;
pub mod mock;
pub mod transport;

pub use array::ProbeArray;
pub use channel::{ChannelGuard, SharedChannel, INFO_COMMAND, READ_COMMAND};
pub use mock::{MockTransport, SimulatedProbe};
pub use transport::{open_i2c, I2cTransport, SensorTransport, MAX_RESPONSE_LEN};
