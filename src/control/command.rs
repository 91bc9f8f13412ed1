//! Control channel tokens.
//!
//! A client sends one bare ASCII token per message. There is no framing beyond
//! the bytes of the token, so at most [`MAX_COMMAND_LEN`] bytes are read at a
//! time.

/// Longest control token in bytes.
pub const MAX_COMMAND_LEN: usize = 6;

/// Reply sent when a command has been carried out.
pub const REPLY_OK: &[u8] = b"OK";

/// Reply sent for an unrecognized command.
pub const REPLY_INVALID: &[u8] = b"Invalid";

/// Session control requests a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Wait until buffered audio has been played out.
    Drain,
    /// Discard buffered audio immediately.
    Drop,
    /// Stop transferring audio, keeping the stream position.
    Pause,
    /// Continue after a pause or drop.
    Resume,
}

impl ControlCommand {
    /// Parse a token received on the control channel.
    pub fn parse(token: &[u8]) -> Option<Self> {
        match token {
            b"Drain" => Some(ControlCommand::Drain),
            b"Drop" => Some(ControlCommand::Drop),
            b"Pause" => Some(ControlCommand::Pause),
            b"Resume" => Some(ControlCommand::Resume),
            _ => None,
        }
    }

    /// Wire representation of the command.
    pub fn token(self) -> &'static [u8] {
        match self {
            ControlCommand::Drain => b"Drain",
            ControlCommand::Drop => b"Drop",
            ControlCommand::Pause => b"Pause",
            ControlCommand::Resume => b"Resume",
        }
    }
}
