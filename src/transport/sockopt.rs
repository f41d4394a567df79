//! Socket options
//!
//! The only place that touches platform socket options. Everything else
//! treats [`SocketConfig`] as an opaque value: part of a pool key, passed
//! through to [`dial_tcp`] / [`bind_udp`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tracing::trace;

/// Socket-level settings for one inbound or outbound
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SocketConfig {
    /// Firewall mark (SO_MARK)
    pub mark: u32,
    /// Enable TCP fast open
    pub tcp_fast_open: bool,
    /// TCP keep-alive idle time in seconds, 0 leaves the OS default
    pub tcp_keep_alive_idle: u32,
    /// Transparent proxy mode (IP_TRANSPARENT)
    pub tproxy: bool,
    /// Bind outgoing sockets to this interface
    pub interface: Option<String>,
}

/// Options applied to sockets we connect from.
pub fn apply_outbound_options(socket: &Socket, config: &SocketConfig) -> io::Result<()> {
    if config.tcp_keep_alive_idle > 0 && socket.r#type()? == Type::STREAM {
        let keepalive =
            TcpKeepalive::new().with_time(Duration::from_secs(config.tcp_keep_alive_idle as u64));
        socket.set_tcp_keepalive(&keepalive)?;
    }
    platform::apply_outbound(socket, config)
}

/// Options applied to sockets we listen on.
pub fn apply_inbound_options(socket: &Socket, config: &SocketConfig) -> io::Result<()> {
    platform::apply_inbound(socket, config)
}

/// Recover the destination a redirected TCP connection was originally sent to.
///
/// `Ok(None)` when the connection was not redirected or the platform has no
/// way to tell.
pub fn lookup_original_destination(
    stream: &TcpStream,
    config: &SocketConfig,
) -> io::Result<Option<SocketAddr>> {
    let local = stream.local_addr()?;
    if config.tproxy {
        // TPROXY keeps the original destination as the local address
        return Ok(Some(local));
    }
    match platform::original_dst(&SockRef::from(stream), local)? {
        Some(addr) if addr != local => Ok(Some(addr)),
        _ => Ok(None),
    }
}

/// Connect a TCP socket with `config` applied before the handshake.
pub async fn dial_tcp(addr: SocketAddr, config: &SocketConfig) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    apply_outbound_options(&socket, config)?;
    socket.set_nonblocking(true)?;

    let socket = TcpSocket::from_std_stream(socket.into());
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    trace!("Dialed tcp {} (mark={})", addr, config.mark);
    Ok(stream)
}

/// Bind a listening TCP socket with inbound options applied before bind.
pub fn bind_tcp_listener(addr: SocketAddr, config: &SocketConfig) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    apply_inbound_options(&socket, config)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Bind a UDP socket with `config` applied.
///
/// With `transparent` set the address may be non-local, which is how replies
/// are forged from the original destination under TPROXY.
pub fn bind_udp(addr: SocketAddr, config: &SocketConfig, transparent: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if transparent {
        socket.set_reuse_address(true)?;
        platform::set_transparent(&socket)?;
    }
    apply_outbound_options(&socket, config)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Ask the kernel to report the original destination of each datagram.
pub fn enable_udp_original_destination(socket: &UdpSocket) -> io::Result<()> {
    let ipv6 = socket.local_addr()?.is_ipv6();
    platform::enable_orig_dst(&SockRef::from(socket), ipv6)
}

/// Receive one datagram: `(len, source, original destination)`.
///
/// The original destination is only reported on sockets prepared with
/// [`enable_udp_original_destination`].
pub async fn recv_with_original_destination(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, Option<SocketAddr>)> {
    platform::recv_orig_dst(socket, buf).await
}

#[cfg(target_os = "linux")]
mod platform {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    use std::os::fd::AsRawFd;
    use std::ptr;

    use socket2::{SockAddr, SockRef, Socket, Type};
    use tokio::io::Interest;
    use tokio::net::UdpSocket;

    use super::SocketConfig;

    const TCP_FASTOPEN_QUEUE: libc::c_int = 256;

    // options socket2 has no setter for
    fn set_int(socket: &Socket, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_transparent(socket: &Socket) -> io::Result<()> {
        socket.set_ip_transparent(true)
    }

    pub fn apply_outbound(socket: &Socket, config: &SocketConfig) -> io::Result<()> {
        if config.mark != 0 {
            socket.set_mark(config.mark)?;
        }
        if let Some(interface) = &config.interface {
            socket.bind_device(Some(interface.as_bytes()))?;
        }
        if config.tcp_fast_open && socket.r#type()? == Type::STREAM {
            set_int(socket, libc::IPPROTO_TCP, libc::TCP_FASTOPEN_CONNECT, 1)?;
        }
        if config.tproxy {
            socket.set_ip_transparent(true)?;
        }
        Ok(())
    }

    pub fn apply_inbound(socket: &Socket, config: &SocketConfig) -> io::Result<()> {
        if config.mark != 0 {
            socket.set_mark(config.mark)?;
        }
        if config.tcp_fast_open && socket.r#type()? == Type::STREAM {
            set_int(socket, libc::IPPROTO_TCP, libc::TCP_FASTOPEN, TCP_FASTOPEN_QUEUE)?;
        }
        if config.tproxy {
            socket.set_ip_transparent(true)?;
        }
        Ok(())
    }

    pub fn original_dst(socket: &SockRef<'_>, local: SocketAddr) -> io::Result<Option<SocketAddr>> {
        let original = match local {
            SocketAddr::V4(_) => socket.original_dst(),
            SocketAddr::V6(_) => socket.original_dst_ipv6(),
        };
        match original {
            Ok(addr) => Ok(addr.as_socket()),
            Err(e) => not_redirected(e),
        }
    }

    pub fn enable_orig_dst(socket: &SockRef<'_>, ipv6: bool) -> io::Result<()> {
        if ipv6 {
            set_int(socket, libc::SOL_IPV6, libc::IPV6_RECVORIGDSTADDR, 1)
        } else {
            set_int(socket, libc::SOL_IP, libc::IP_RECVORIGDSTADDR, 1)
        }
    }

    pub async fn recv_orig_dst(
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<SocketAddr>)> {
        let fd = socket.as_raw_fd();
        socket
            .async_io(Interest::READABLE, || recvmsg(fd, &mut *buf))
            .await
    }

    fn recvmsg(fd: libc::c_int, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Option<SocketAddr>)> {
        let mut source: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut control = [0u8; 128];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut source as *mut libc::sockaddr_storage as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let source = unsafe { SockAddr::new(source, msg.msg_namelen) }
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "datagram without an ip source"))?;

        let mut original = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let level = (*cmsg).cmsg_level;
                let kind = (*cmsg).cmsg_type;
                if level == libc::SOL_IP && kind == libc::IP_ORIGDSTADDR {
                    let addr = ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::sockaddr_in);
                    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
                    original = Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(addr.sin_port))));
                } else if level == libc::SOL_IPV6 && kind == libc::IPV6_ORIGDSTADDR {
                    let addr = ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::sockaddr_in6);
                    let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
                    original = Some(SocketAddr::V6(SocketAddrV6::new(ip, u16::from_be(addr.sin6_port), 0, 0)));
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok((n as usize, source, original))
    }

    // ENOENT / ENOPROTOOPT: no NAT entry or netfilter not loaded
    fn not_redirected(err: io::Error) -> io::Result<Option<SocketAddr>> {
        match err.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::ENOPROTOOPT) => Ok(None),
            _ => Err(err),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::io;
    use std::net::SocketAddr;

    use socket2::{SockRef, Socket};
    use tracing::debug;

    use super::SocketConfig;

    pub fn set_transparent(_socket: &Socket) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transparent sockets are only supported on linux",
        ))
    }

    pub fn apply_outbound(_socket: &Socket, config: &SocketConfig) -> io::Result<()> {
        if config.mark != 0 || config.tproxy || config.interface.is_some() || config.tcp_fast_open {
            debug!("Socket options beyond keep-alive are ignored on this platform");
        }
        Ok(())
    }

    pub fn apply_inbound(_socket: &Socket, _config: &SocketConfig) -> io::Result<()> {
        Ok(())
    }

    pub fn original_dst(_socket: &SockRef<'_>, _local: SocketAddr) -> io::Result<Option<SocketAddr>> {
        Ok(None)
    }

    pub fn enable_orig_dst(_socket: &SockRef<'_>, _ipv6: bool) -> io::Result<()> {
        Ok(())
    }

    pub async fn recv_orig_dst(
        socket: &tokio::net::UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<SocketAddr>)> {
        let (n, source) = socket.recv_from(buf).await?;
        Ok((n, source, None))
    }
}
