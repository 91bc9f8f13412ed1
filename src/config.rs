//! Tunables for a multi-client stream.

use std::time::Duration;

use crate::MultiError;

/// Hard ceiling on `max_clients`. The mix accumulators are sized so that this
/// many full-scale contributions cannot overflow between two reads.
pub const CLIENT_LIMIT: usize = 255;

/// Multi-client configuration, passed explicitly to [`PcmMulti::create`](crate::PcmMulti::create).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiConfig {
    /// Maximum number of concurrently connected clients.
    pub max_clients: usize,
    /// Periods a playback client must buffer before it joins the mix.
    pub client_threshold: usize,
    /// Capacity of the mix ring, in periods.
    pub buffer_periods: usize,
    /// Periods that must be mixed before the transport is fed.
    pub mix_threshold: usize,
    /// How long a drain request may take before the client is told it completed.
    pub drain_timeout: Duration,
}

impl Default for MultiConfig {
    fn default() -> Self {
        Self {
            max_clients: 32,
            client_threshold: 2,
            buffer_periods: 16,
            mix_threshold: 4,
            drain_timeout: Duration::from_millis(400),
        }
    }
}

impl MultiConfig {
    /// Check that the configuration describes a usable mix.
    pub fn validate(&self) -> Result<(), MultiError> {
        if self.max_clients == 0 || self.max_clients > CLIENT_LIMIT {
            return Err(MultiError::InvalidConfig("max_clients must be within 1..=255"));
        }
        if self.client_threshold == 0 {
            return Err(MultiError::InvalidConfig("client_threshold must be non-zero"));
        }
        // The ring must hold the start threshold plus one period in flight.
        if self.buffer_periods <= self.mix_threshold + 1 {
            return Err(MultiError::InvalidConfig(
                "buffer_periods must exceed mix_threshold + 1",
            ));
        }
        if self.drain_timeout.is_zero() {
            return Err(MultiError::InvalidConfig("drain_timeout must be non-zero"));
        }
        Ok(())
    }
}
