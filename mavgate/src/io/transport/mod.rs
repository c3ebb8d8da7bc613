//! Transport implementations.

pub mod serial;
pub mod tcp;
pub mod udp;

pub use serial::SerialConnection;
pub use tcp::TcpConnection;
pub use udp::UdpConnection;
