//! Crate errors.

/// Crate-specific [`Result`] type.
pub type Result<T> = core::result::Result<T, Error>;

/// Crate errors.
///
/// Transport and parsing failures are surfaced through this enum. Protocol-level
/// outcomes of a transfer or a command (denied, timed out, and so on) are not
/// errors in this sense and are reported through result callbacks instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure on a transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MAVLink frame encoding or decoding failure.
    #[error("MAVLink codec error: {0}")]
    Codec(#[from] mavio::error::Error),

    /// Serial port failure.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Connection address can't be parsed.
    #[error("invalid connection address `{addr}`: {reason}")]
    Address {
        /// Offending address string.
        addr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Outgoing frame has nowhere to go: no remote endpoints are known yet.
    #[error("no remote endpoints known")]
    NoRemotes,

    /// Sending failed for every known remote endpoint.
    #[error("sending failed for all remote endpoints")]
    AllRemotesFailed,

    /// Operation on a connection that has been stopped.
    #[error("connection is stopped")]
    ConnectionStopped,

    /// A transfer of the same kind is already active for this target system.
    #[error("a transfer of the same kind is already active for this target")]
    TransferBusy,

    /// A command with the same `ID` is already in flight for this target system.
    #[error("a command with the same ID is already in flight for this target")]
    CommandBusy,

    /// Mission item carries a value that can't be represented in the dialect.
    #[error("invalid mission item: {0}")]
    InvalidMissionItem(String),
}
