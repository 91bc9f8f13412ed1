#![deny(missing_docs)]

//! Multi-client PCM support for Bluetooth audio transports.
//!
//! A Bluetooth transport PCM normally serves exactly one local application.
//! [`PcmMulti`] lets any number of applications share it: playback clients
//! are summed into a [`MixBuffer`] that the transport drains at its own pace,
//! and capture audio is copied to every connected capture client. Each client
//! talks to the multi over a non-blocking audio FIFO plus a control channel
//! carrying [`ControlCommand`](control::command::ControlCommand) tokens.
//!
//! The transport I/O thread only ever calls [`PcmMulti::read`] or
//! [`PcmMulti::write`]; all client I/O happens on a worker thread owned by the
//! multi.

use std::sync::Once;

pub mod client;
pub mod config;
pub mod control;
mod event;
pub mod mix;
pub mod multi;
pub mod tone;
pub mod transport;


pub use client::ClientState;
pub use config::MultiConfig;
pub use event::ClientId;
pub use mix::{MixBuffer, RingPosition};
pub use multi::{MultiState, PcmMulti};
pub use transport::{PcmFormat, PcmMode, TransportPcm, TransportSignal, Volume};

static TRACING_INIT: Once = Once::new();

/// Install a `tracing` fmt subscriber for binaries and tests. The library
/// itself never installs one.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

/// Error enumeration surfaced across the public API.
#[derive(thiserror::Error, Debug)]
pub enum MultiError {
    /// Stream parameters cannot describe a usable buffer.
    #[error("invalid stream parameters: {0}")]
    InvalidParameters(&'static str),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The client limit has been reached.
    #[error("client limit of {0} reached")]
    TooManyClients(usize),
    /// A buffer could not be allocated.
    #[error("buffer allocation failed: {0}")]
    Alloc(#[from] std::collections::TryReserveError),
    /// No mixed audio is ready yet.
    #[error("no data available, try again")]
    TryAgain,
    /// Descriptor I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A system call failed.
    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
    /// The worker thread could not be spawned.
    #[error("cannot create worker thread: {0}")]
    Thread(std::io::Error),
}
