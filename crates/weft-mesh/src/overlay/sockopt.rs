//! Path MTU socket options.
//!
//! Linux only. Elsewhere the socket keeps the platform's default mode and
//! the path MTU reads as [`io::ErrorKind::Unsupported`].

use std::io;
use std::net::SocketAddr;
#[cfg(target_os = "linux")]
use std::net::{Ipv4Addr, Ipv6Addr, UdpSocket};
use std::os::fd::AsFd;

/// Sets whether datagrams sent on `fd` carry the don't-fragment bit.
///
/// With `df` the kernel refuses datagrams above the path MTU with
/// `EMSGSIZE`; without it, it fragments them.
#[cfg(target_os = "linux")]
pub fn set_dont_fragment<Fd: AsFd>(fd: Fd, ipv6: bool, df: bool) -> io::Result<()> {
    use rustix::net::sockopt::{self, Ipv4PathMtuDiscovery, Ipv6PathMtuDiscovery};

    if ipv6 {
        let mode = if df {
            Ipv6PathMtuDiscovery::DO
        } else {
            Ipv6PathMtuDiscovery::DONT
        };
        sockopt::set_ipv6_mtu_discover(fd, mode)?;
    } else {
        let mode = if df {
            Ipv4PathMtuDiscovery::DO
        } else {
            Ipv4PathMtuDiscovery::DONT
        };
        sockopt::set_ip_mtu_discover(fd, mode)?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_dont_fragment<Fd: AsFd>(_fd: Fd, _ipv6: bool, _df: bool) -> io::Result<()> {
    Ok(())
}

/// The path MTU the kernel currently holds for `addr`, at the IP level.
#[cfg(target_os = "linux")]
pub fn path_mtu(addr: SocketAddr) -> io::Result<usize> {
    use rustix::net::sockopt;

    // IP_MTU is only readable on a connected socket
    let probe = match addr {
        SocketAddr::V4(_) => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?,
        SocketAddr::V6(_) => UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0))?,
    };
    probe.connect(addr)?;
    let mtu = match addr {
        SocketAddr::V4(_) => sockopt::ip_mtu(&probe)?,
        SocketAddr::V6(_) => sockopt::ipv6_mtu(&probe)?,
    };
    usize::try_from(mtu).map_err(io::Error::other)
}

#[cfg(not(target_os = "linux"))]
pub fn path_mtu(_addr: SocketAddr) -> io::Result<usize> {
    Err(io::ErrorKind::Unsupported.into())
}

/// Whether `err` is the kernel refusing a datagram above the path MTU.
#[cfg(target_os = "linux")]
pub fn is_message_too_big(err: &io::Error) -> bool {
    rustix::io::Errno::from_io_error(err) == Some(rustix::io::Errno::MSGSIZE)
}

#[cfg(not(target_os = "linux"))]
pub fn is_message_too_big(_err: &io::Error) -> bool {
    false
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn loopback_path_mtu_is_readable() {
        let mtu = path_mtu("127.0.0.1:9".parse().expect("addr")).expect("path mtu");
        assert!(mtu >= 1280, "loopback MTU {mtu}");
    }

    #[test]
    fn dont_fragment_mode_round_trips() {
        use rustix::net::sockopt::{self, Ipv4PathMtuDiscovery};

        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind");
        set_dont_fragment(&socket, false, true).expect("set DF");
        assert_eq!(
            sockopt::ip_mtu_discover(&socket).expect("read"),
            Ipv4PathMtuDiscovery::DO
        );
        set_dont_fragment(&socket, false, false).expect("clear DF");
        assert_eq!(
            sockopt::ip_mtu_discover(&socket).expect("read"),
            Ipv4PathMtuDiscovery::DONT
        );
    }
}
