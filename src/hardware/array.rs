//! The six-probe array.
//!
//! Opens one [`SharedChannel`] per configured probe and checks that each one
//! answers before any mode runs. All unreachable probes are reported together.

use crate::config::ProbeDefinition;
use crate::error::DaqError;
use crate::hardware::channel::SharedChannel;
use crate::hardware::mock::SimulatedProbe;
use crate::hardware::transport::{open_i2c, SensorTransport};
use crate::probe::SensorIdentity;
use std::collections::BTreeMap;
use std::time::Duration;

/// Owner name used for the startup reachability check.
const VERIFY_OWNER: &str = "startup";

/// Channels for every probe, keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct ProbeArray {
    channels: BTreeMap<SensorIdentity, SharedChannel>,
}

impl ProbeArray {
    /// Build from already-wrapped channels.
    pub fn from_channels(channels: impl IntoIterator<Item = SharedChannel>) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|channel| (channel.identity(), channel))
                .collect(),
        }
    }

    /// Build from `(identity, transport)` pairs.
    pub fn from_transports(
        transports: impl IntoIterator<Item = (SensorIdentity, Box<dyn SensorTransport>)>,
    ) -> Self {
        Self::from_channels(
            transports
                .into_iter()
                .map(|(identity, transport)| SharedChannel::new(identity, transport)),
        )
    }

    /// Open every probe in `probes`.
    ///
    /// With `simulate` set, each probe is backed by a [`SimulatedProbe`]
    /// instead of the I2C bus. Every open failure is collected into
    /// [`DaqError::Startup`].
    pub fn open(probes: &[ProbeDefinition], simulate: bool) -> Result<Self, DaqError> {
        let mut channels = Vec::with_capacity(probes.len());
        let mut failures = Vec::new();

        for probe in probes {
            let identity = probe.identity();
            let transport: Result<Box<dyn SensorTransport>, _> = if simulate {
                Ok(Box::new(SimulatedProbe::new(probe.kind, identity.to_string())))
            } else {
                open_i2c(probe.bus, probe.address)
            };

            match transport {
                Ok(transport) => {
                    let channel = SharedChannel::new(identity, transport);
                    tracing::info!(probe = %identity, endpoint = channel.endpoint(), "Probe opened");
                    channels.push(channel);
                }
                Err(e) => {
                    tracing::error!(probe = %identity, error = %e, "Failed to open probe");
                    failures.push(DaqError::transport(identity, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(DaqError::Startup(failures));
        }
        Ok(Self::from_channels(channels))
    }

    /// Query every probe once; fail with every unreachable probe listed.
    pub fn verify(&self, settle: Duration) -> Result<(), DaqError> {
        let mut failures = Vec::new();
        for channel in self.channels.values() {
            let result = channel
                .acquire(VERIFY_OWNER)
                .and_then(|mut guard| {
                    guard
                        .verify(settle)
                        .map_err(|e| DaqError::transport(channel.identity(), e))
                });
            match result {
                Ok(()) => tracing::debug!(probe = %channel.identity(), "Probe reachable"),
                Err(e) => {
                    tracing::error!(probe = %channel.identity(), error = %e, "Probe unreachable");
                    failures.push(e);
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(probes = self.channels.len(), "All probes reachable");
            Ok(())
        } else {
            Err(DaqError::Startup(failures))
        }
    }

    /// Channel of `identity`.
    pub fn channel(&self, identity: SensorIdentity) -> Result<&SharedChannel, DaqError> {
        self.channels
            .get(&identity)
            .ok_or(DaqError::UnknownProbe(identity))
    }

    /// Every channel, pH first then conductivity, each in position order.
    pub fn channels(&self) -> impl Iterator<Item = &SharedChannel> {
        self.channels.values()
    }

    /// Number of probes.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::hardware::mock::MockTransport;
    use crate::probe::{Position, SensorKind};

    #[test]
    fn test_simulated_array_opens_and_verifies() {
        let settings = Settings::default();
        let array = ProbeArray::open(&settings.probes, true).unwrap();
        assert_eq!(array.len(), 6);
        assert!(array.verify(Duration::ZERO).is_ok());
        assert!(array.channels().all(SharedChannel::is_available));
    }

    #[test]
    fn test_verify_reports_every_failure() {
        let failing = |id: SensorIdentity| {
            let mock = MockTransport::new(id.to_string());
            mock.fail_next_write();
            (id, Box::new(mock) as Box<dyn SensorTransport>)
        };
        let healthy = |id: SensorIdentity| {
            (id, Box::new(MockTransport::new(id.to_string())) as Box<dyn SensorTransport>)
        };

        let ids: Vec<SensorIdentity> = SensorIdentity::all().collect();
        let array = ProbeArray::from_transports(vec![
            failing(ids[0]),
            healthy(ids[1]),
            healthy(ids[2]),
            healthy(ids[3]),
            failing(ids[4]),
            healthy(ids[5]),
        ]);

        match array.verify(Duration::ZERO) {
            Err(DaqError::Startup(failures)) => assert_eq!(failures.len(), 2),
            other => panic!("expected startup failure, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_probe() {
        let array = ProbeArray::default();
        let id = SensorIdentity::new(SensorKind::Ph, Position::FIRST);
        assert!(matches!(array.channel(id), Err(DaqError::UnknownProbe(_))));
    }

    #[cfg(not(feature = "hardware_i2c"))]
    #[test]
    fn test_hardware_open_without_feature_fails() {
        let settings = Settings::default();
        match ProbeArray::open(&settings.probes, false) {
            Err(DaqError::Startup(failures)) => assert_eq!(failures.len(), 6),
            other => panic!("expected startup failure, got {other:?}"),
        }
    }
}
