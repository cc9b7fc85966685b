//! Directed flow identity.
//!
//! A flow names one direction of a TCP connection.  The reverse of a flow
//! swaps source and destination on both the IP and port pair, which is how
//! response-direction byte streams are rekeyed onto the conversation that
//! the request direction created.

use std::fmt;
use std::net::IpAddr;

/// An ordered (source, destination) endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pair<T> {
    pub src: T,
    pub dst: T,
}

impl<T: Copy> Pair<T> {
    pub fn new(src: T, dst: T) -> Pair<T> {
        Pair { src, dst }
    }

    /// The same pair with source and destination swapped.
    pub fn reverse(&self) -> Pair<T> {
        Pair {
            src: self.dst,
            dst: self.src,
        }
    }
}

/// Identity of one direction of a TCP connection.
///
/// Cheap value type: used directly as a map key and reversed without
/// aliasing concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub ip: Pair<IpAddr>,
    pub port: Pair<u16>,
}

impl FlowKey {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> FlowKey {
        FlowKey {
            ip: Pair::new(src_ip, dst_ip),
            port: Pair::new(src_port, dst_port),
        }
    }

    /// The opposite direction of the same connection.
    pub fn reverse(&self) -> FlowKey {
        FlowKey {
            ip: self.ip.reverse(),
            port: self.port.reverse(),
        }
    }

    /// The destination endpoint's address (the server, for a
    /// request-direction flow).
    pub fn server_ip(&self) -> IpAddr {
        self.ip.dst
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.ip.src, self.port.src, self.ip.dst, self.port.dst
        )
    }
}
