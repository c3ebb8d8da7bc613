//! Connection address parsing.
//!
//! Connections are described by URL-style strings:
//!
//! * `udpin://0.0.0.0:14540` binds a UDP socket and learns remotes from
//!   traffic;
//! * `udpout://192.168.1.12:14550` binds an ephemeral UDP socket with one
//!   fixed remote;
//! * `tcpin://0.0.0.0:5760` listens for TCP clients;
//! * `tcpout://127.0.0.1:5760` connects to a TCP server and reconnects on
//!   loss;
//! * `serial:///dev/ttyUSB0:57600` opens a serial device at a baud rate.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::prelude::*;

/// Parsed connection address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnAddr {
    /// Bound UDP socket learning remotes from incoming traffic.
    UdpIn(SocketAddr),
    /// UDP socket with a single fixed remote.
    UdpOut(SocketAddr),
    /// Listening TCP socket accepting multiple clients.
    TcpIn(SocketAddr),
    /// TCP client with automatic reconnection.
    TcpOut(SocketAddr),
    /// Serial device.
    Serial {
        /// Device path, e.g. `/dev/ttyACM0`.
        path: String,
        /// Baud rate.
        baud: u32,
    },
}

impl ConnAddr {
    fn invalid(addr: &str, reason: impl Into<String>) -> Error {
        Error::Address {
            addr: addr.to_string(),
            reason: reason.into(),
        }
    }

    fn socket_addr(addr: &str, spec: &str) -> Result<SocketAddr> {
        // `to_socket_addrs` also resolves hostnames.
        spec.to_socket_addrs()
            .map_err(|err| Self::invalid(addr, err.to_string()))?
            .next()
            .ok_or_else(|| Self::invalid(addr, "address resolved to nothing"))
    }
}

impl FromStr for ConnAddr {
    type Err = Error;

    fn from_str(addr: &str) -> Result<Self> {
        let (scheme, rest) = addr
            .split_once("://")
            .ok_or_else(|| Self::invalid(addr, "missing `scheme://` prefix"))?;

        match scheme {
            "udpin" => Ok(ConnAddr::UdpIn(Self::socket_addr(addr, rest)?)),
            "udpout" => Ok(ConnAddr::UdpOut(Self::socket_addr(addr, rest)?)),
            "tcpin" => Ok(ConnAddr::TcpIn(Self::socket_addr(addr, rest)?)),
            "tcpout" => Ok(ConnAddr::TcpOut(Self::socket_addr(addr, rest)?)),
            "serial" => {
                let (path, baud) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| Self::invalid(addr, "expected `device:baudrate`"))?;
                if path.is_empty() {
                    return Err(Self::invalid(addr, "empty device path"));
                }
                let baud: u32 = baud
                    .parse()
                    .map_err(|_| Self::invalid(addr, format!("invalid baud rate `{baud}`")))?;
                Ok(ConnAddr::Serial {
                    path: path.to_string(),
                    baud,
                })
            }
            other => Err(Self::invalid(addr, format!("unknown scheme `{other}`"))),
        }
    }
}

impl fmt::Display for ConnAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnAddr::UdpIn(addr) => write!(f, "udpin://{addr}"),
            ConnAddr::UdpOut(addr) => write!(f, "udpout://{addr}"),
            ConnAddr::TcpIn(addr) => write!(f, "tcpin://{addr}"),
            ConnAddr::TcpOut(addr) => write!(f, "tcpout://{addr}"),
            ConnAddr::Serial { path, baud } => write!(f, "serial://{path}:{baud}"),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test_endpoint {
    use super::*;

    #[test]
    fn udp_addresses_parse() {
        let addr: ConnAddr = "udpin://0.0.0.0:14540".parse().unwrap();
        assert_eq!(addr, ConnAddr::UdpIn("0.0.0.0:14540".parse().unwrap()));

        let addr: ConnAddr = "udpout://127.0.0.1:14550".parse().unwrap();
        assert_eq!(addr, ConnAddr::UdpOut("127.0.0.1:14550".parse().unwrap()));
    }

    #[test]
    fn tcp_addresses_parse() {
        let addr: ConnAddr = "tcpin://0.0.0.0:5760".parse().unwrap();
        assert_eq!(addr, ConnAddr::TcpIn("0.0.0.0:5760".parse().unwrap()));

        let addr: ConnAddr = "tcpout://127.0.0.1:5760".parse().unwrap();
        assert_eq!(addr, ConnAddr::TcpOut("127.0.0.1:5760".parse().unwrap()));
    }

    #[test]
    fn serial_address_parses() {
        let addr: ConnAddr = "serial:///dev/ttyUSB0:57600".parse().unwrap();
        assert_eq!(
            addr,
            ConnAddr::Serial {
                path: "/dev/ttyUSB0".to_string(),
                baud: 57600,
            }
        );
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert!("udpin:0.0.0.0:14540".parse::<ConnAddr>().is_err());
        assert!("ftp://0.0.0.0:21".parse::<ConnAddr>().is_err());
        assert!("udpin://not a host".parse::<ConnAddr>().is_err());
        assert!("serial:///dev/ttyUSB0".parse::<ConnAddr>().is_err());
        assert!("serial:///dev/ttyUSB0:fast".parse::<ConnAddr>().is_err());
        assert!("serial://:57600".parse::<ConnAddr>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for addr in [
            "udpin://0.0.0.0:14540",
            "udpout://127.0.0.1:14550",
            "tcpin://0.0.0.0:5760",
            "tcpout://127.0.0.1:5760",
            "serial:///dev/ttyACM0:115200",
        ] {
            let parsed: ConnAddr = addr.parse().unwrap();
            assert_eq!(parsed.to_string(), addr);
        }
    }
}
