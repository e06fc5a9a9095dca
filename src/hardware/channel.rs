//! Shared probe channel with exclusive owner access.
//!
//! Every probe is wrapped in a [`SharedChannel`]. Whoever wants to talk to the
//! probe (the acquisition scheduler, a calibration session, a dry run) first
//! acquires a [`ChannelGuard`]; while a guard is alive every other acquisition
//! is rejected. The guard owns an `Arc` to the channel state, so it can be
//! moved into a blocking worker and handed back afterwards.

use crate::error::{DaqError, TransportError};
use crate::hardware::transport::{SensorTransport, MAX_RESPONSE_LEN};
use crate::probe::SensorIdentity;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Command that triggers a single reading.
pub const READ_COMMAND: &[u8] = b"R";

/// Device information command, used as the startup reachability check.
pub const INFO_COMMAND: &[u8] = b"i";

/// Inner state of the shared channel
struct ChannelInner {
    transport: Box<dyn SensorTransport>,
    /// Current owner (None if unowned)
    owner: Option<String>,
}

/// One probe endpoint with ownership tracking.
#[derive(Clone)]
pub struct SharedChannel {
    identity: SensorIdentity,
    endpoint: String,
    inner: Arc<Mutex<ChannelInner>>,
}

impl SharedChannel {
    /// Wrap a transport bound to `identity`.
    pub fn new(identity: SensorIdentity, transport: Box<dyn SensorTransport>) -> Self {
        let endpoint = transport.describe();
        Self {
            identity,
            endpoint,
            inner: Arc::new(Mutex::new(ChannelInner {
                transport,
                owner: None,
            })),
        }
    }

    /// Probe this channel is bound to.
    pub fn identity(&self) -> SensorIdentity {
        self.identity
    }

    /// Transport endpoint description.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Acquire exclusive access.
    ///
    /// Never waits: if another owner holds the channel the request is rejected
    /// with [`DaqError::ChannelBusy`].
    pub fn acquire(&self, owner: &str) -> Result<ChannelGuard, DaqError> {
        let mut inner = lock(&self.inner).map_err(|e| DaqError::transport(self.identity, e))?;

        if let Some(current) = &inner.owner {
            return Err(DaqError::ChannelBusy {
                probe: self.identity,
                owner: current.clone(),
                requested_by: owner.to_string(),
            });
        }

        inner.owner = Some(owner.to_string());
        tracing::debug!(probe = %self.identity, owner, "Channel acquired");

        Ok(ChannelGuard {
            identity: self.identity,
            inner: self.inner.clone(),
            owner: owner.to_string(),
        })
    }

    /// Check if the channel is currently unowned.
    pub fn is_available(&self) -> bool {
        // Non-blocking check; a contended mutex counts as unavailable
        match self.inner.try_lock() {
            Ok(inner) => inner.owner.is_none(),
            Err(_) => false,
        }
    }

    /// Current owner, if any.
    pub fn current_owner(&self) -> Option<String> {
        match self.inner.try_lock() {
            Ok(inner) => inner.owner.clone(),
            Err(_) => None,
        }
    }
}

impl std::fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedChannel")
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

fn lock(inner: &Mutex<ChannelInner>) -> Result<MutexGuard<'_, ChannelInner>, TransportError> {
    inner.lock().map_err(|_| TransportError::Poisoned)
}

/// RAII guard for exclusive channel access.
///
/// Releases ownership when dropped.
pub struct ChannelGuard {
    identity: SensorIdentity,
    inner: Arc<Mutex<ChannelInner>>,
    owner: String,
}

impl std::fmt::Debug for ChannelGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelGuard")
            .field("identity", &self.identity)
            .field("owner", &self.owner)
            .finish()
    }
}

impl ChannelGuard {
    /// Probe this guard addresses.
    pub fn identity(&self) -> SensorIdentity {
        self.identity
    }

    /// Owner name this guard was acquired under.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Write a command. Blocks until the transport returns.
    pub fn write_command(&mut self, cmd: &[u8]) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner)?;
        tracing::trace!(
            probe = %self.identity,
            command = %String::from_utf8_lossy(cmd),
            "Writing command"
        );
        inner.transport.write_command(cmd)
    }

    /// Read a response of at most `max_len` bytes. Blocks until the transport returns.
    pub fn read_response(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut inner = lock(&self.inner)?;
        let raw = inner.transport.read_response(max_len)?;
        tracing::trace!(probe = %self.identity, bytes = raw.len(), "Read response");
        Ok(raw)
    }

    /// Write `cmd`, sleep `settle`, then read a full response.
    pub fn query(&mut self, cmd: &[u8], settle: Duration) -> Result<Vec<u8>, TransportError> {
        self.write_command(cmd)?;
        if !settle.is_zero() {
            std::thread::sleep(settle);
        }
        self.read_response(MAX_RESPONSE_LEN)
    }

    /// Startup reachability check: send the info command and read anything back.
    pub fn verify(&mut self, settle: Duration) -> Result<(), TransportError> {
        self.query(INFO_COMMAND, settle).map(|_| ())
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        // A poisoned mutex still carries valid owner state
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.owner.as_deref() == Some(self.owner.as_str()) {
            tracing::debug!(probe = %self.identity, owner = %self.owner, "Releasing channel");
            inner.owner = None;
        }
    }
}
