//! Client-facing control surface: the control channel protocol and status snapshots.

/// Commands and replies exchanged on a client's control channel.
pub mod command;
/// Status snapshots for tooling and diagnostics.
pub mod status;
