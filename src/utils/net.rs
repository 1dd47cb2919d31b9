//! Socket helpers for the command server

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn,
    SockaddrIn6,
};
use serde::{Deserialize, Serialize};

/// TCP keepalive parameters used to reap dead peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Idle seconds before the first probe
    pub idle_secs: u32,
    /// Seconds between probes
    pub interval_secs: u32,
    /// Unanswered probes before the connection is dropped
    pub retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle_secs: 120,
            interval_secs: 5,
            retries: 9,
        }
    }
}

fn socket_addr_family(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

/// Bind a non-blocking TCP listener, IPv6-only for IPv6 addresses
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = socket_addr_family(&addr);
    let fd = socket::socket(
        domain,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )
    .map_err(io::Error::from)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;

    if matches!(addr, SocketAddr::V6(_)) {
        socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true).map_err(io::Error::from)?;
    }

    match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = SockaddrIn::from(v4);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)?;
        }
        SocketAddr::V6(v6) => {
            let sockaddr = SockaddrIn6::from(v6);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)?;
        }
    }
    socket::listen(&fd, Backlog::MAXCONN).map_err(io::Error::from)?;

    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Enable TCP keepalive on an accepted connection
pub fn set_keepalive<F: AsFd>(fd: &F, config: &KeepaliveConfig) -> io::Result<()> {
    socket::setsockopt(fd, sockopt::KeepAlive, &true).map_err(io::Error::from)?;
    socket::setsockopt(fd, sockopt::TcpKeepIdle, &config.idle_secs).map_err(io::Error::from)?;
    socket::setsockopt(fd, sockopt::TcpKeepInterval, &config.interval_secs)
        .map_err(io::Error::from)?;
    socket::setsockopt(fd, sockopt::TcpKeepCount, &config.retries).map_err(io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = bind_tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_keepalive_applies() {
        let listener = bind_tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        set_keepalive(&stream, &KeepaliveConfig::default()).unwrap();
        assert!(socket::getsockopt(&stream, sockopt::KeepAlive).unwrap());
        assert_eq!(socket::getsockopt(&stream, sockopt::TcpKeepIdle).unwrap(), 120);
    }

    #[test]
    fn test_keepalive_defaults() {
        let config = KeepaliveConfig::default();
        assert_eq!((config.idle_secs, config.interval_secs, config.retries), (120, 5, 9));
    }
}
