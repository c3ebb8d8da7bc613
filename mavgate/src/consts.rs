//! Crate-level constants.

use std::time::Duration;

/// Receive timeout for blocking transport reads.
///
/// Transports poll their shutdown state between reads, so this value bounds the
/// latency of [`Connection::stop`](crate::io::Connection::stop).
pub const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Inactivity timeout after which a discovered UDP remote is evicted.
///
/// Applies only to remotes learned from traffic. Remotes set up explicitly from
/// a connection address are never evicted.
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval before a pending transfer step is re-sent.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(500);

/// Maximum number of re-sends for a single transfer step.
///
/// The budget resets whenever a transfer makes progress, so this bounds the
/// tolerated burst of consecutive losses rather than total loss over a session.
pub const TRANSFER_RETRIES: usize = 10;

/// Interval before a pending command is re-sent.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Maximum number of re-sends for a command awaiting acknowledgment.
pub const COMMAND_RETRIES: usize = 3;

/// A remote system is considered disconnected after this long without a heartbeat.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

/// Delay between TCP client reconnection attempts.
pub const TCP_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Default system `ID` for this node.
pub const DEFAULT_SYSTEM_ID: u8 = 245;

/// Default component `ID` for this node.
pub const DEFAULT_COMPONENT_ID: u8 = 190;

/// Payload bytes carried by a single file transfer chunk.
pub const FTP_CHUNK_SIZE: usize = 232;

/// Wire size of the FILE_TRANSFER_PROTOCOL payload field.
pub const FTP_PAYLOAD_SIZE: usize = 251;
