use crate::client::ClientState;
use crate::event::ClientId;
use crate::multi::MultiState;

/// Per-client diagnostics.
#[derive(Clone, Debug)]
pub struct ClientStatus {
    /// Identifier assigned when the client was added.
    pub id: ClientId,
    /// Current session state.
    pub state: ClientState,
    /// Bytes held in the client's local buffer.
    pub buffered_bytes: usize,
    /// Samples between the mix read cursor and this client's next write
    /// position. Always zero for capture clients.
    pub mix_delay: usize,
    /// Whether the audio descriptor is registered for readiness events.
    pub watching: bool,
}

/// Aggregated snapshot of a multi-client stream.
#[derive(Clone, Debug)]
pub struct MultiStatus {
    /// Aggregator state.
    pub state: MultiState,
    /// Connected clients.
    pub client_count: usize,
    /// Clients currently running or draining.
    pub active_count: usize,
    /// Samples ready in the mix ring (playback only).
    pub mix_avail: usize,
    /// Estimated mixing delay in 1/10 ms.
    pub delay: u32,
    /// Per-client diagnostics, ordered by id.
    pub clients: Vec<ClientStatus>,
}

impl MultiStatus {
    /// Look up one client.
    pub fn client(&self, id: ClientId) -> Option<&ClientStatus> {
        self.clients.iter().find(|client| client.id == id)
    }
}
