/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Herald reception and reply-socket construction.
//!
//! A panicking client addresses its herald to whatever address it believes
//! the server has, and it will only accept replies from that address. The
//! listening socket therefore runs with `IP_PKTINFO` so every herald arrives
//! with its destination address, and each session's connected reply socket
//! is bound to exactly that address. Both sockets share the netdump port,
//! which is why they carry `SO_REUSEADDR`.
//!
//! This module is the seam where a privileged helper process would sit in a
//! sandboxed deployment; here it is implemented inline.

use std::io::{self, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    bind, connect, recvmsg, setsockopt, socket, sockopt, AddressFamily, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, SockaddrIn,
};
use tokio::io::Interest;
use tokio::net::UdpSocket;

fn dgram_socket() -> io::Result<StdUdpSocket> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(to_io)?;
    // socket() just returned this fd and nothing else owns it.
    Ok(unsafe { StdUdpSocket::from_raw_fd(fd) })
}

/// Create the listening socket: `SO_REUSEADDR`, `IP_PKTINFO`, bound to the
/// configured address.
pub fn bind_listener(addr: Ipv4Addr, port: u16) -> io::Result<StdUdpSocket> {
    let sock = dgram_socket()?;
    let fd = sock.as_raw_fd();
    setsockopt(fd, sockopt::ReuseAddr, &true).map_err(to_io)?;
    setsockopt(fd, sockopt::Ipv4PacketInfo, &true).map_err(to_io)?;
    bind(fd, &SockaddrIn::from(SocketAddrV4::new(addr, port))).map_err(to_io)?;
    Ok(sock)
}

/// Create a session's connected reply socket: bound to the destination
/// address the client used, peered with the client's source address.
pub fn session_socket(local: SocketAddrV4, peer: SocketAddrV4) -> io::Result<StdUdpSocket> {
    let sock = dgram_socket()?;
    let fd = sock.as_raw_fd();
    setsockopt(fd, sockopt::ReuseAddr, &true).map_err(to_io)?;
    bind(fd, &SockaddrIn::from(local)).map_err(to_io)?;
    connect(fd, &SockaddrIn::from(peer)).map_err(to_io)?;
    Ok(sock)
}

/// The listening socket, async-registered.
#[derive(Debug)]
pub struct HeraldSocket {
    socket: UdpSocket,
}

impl HeraldSocket {
    pub fn new(listener: StdUdpSocket) -> io::Result<Self> {
        Ok(Self { socket: UdpSocket::from_std(listener)? })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn readable(&self) -> io::Result<()> {
        self.socket.readable().await
    }

    /// Receive one datagram together with its destination address. Returns
    /// a `WouldBlock` error on a spurious wakeup.
    pub fn try_recv_with_dst(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddrV4, Ipv4Addr)> {
        let fd = self.socket.as_raw_fd();
        self.socket.try_io(Interest::READABLE, || recvmsg_with_dst(fd, buf))
    }
}

fn recvmsg_with_dst(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4, Ipv4Addr)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = cmsg_space!(libc::in_pktinfo);
    let msg = recvmsg::<SockaddrIn>(fd, &mut iov, Some(&mut cmsg), MsgFlags::empty())
        .map_err(to_io)?;

    let src = msg
        .address
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no source address"))?;
    let src = SocketAddrV4::new(Ipv4Addr::from(src.ip()), src.port());

    let mut dst = None;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::Ipv4PacketInfo(info) = cmsg {
            dst = Some(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)));
        }
    }
    let dst = dst
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no destination address"))?;

    Ok((msg.bytes, src, dst))
}

fn to_io(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_reports_destination_address() {
        let listener = bind_listener(Ipv4Addr::LOCALHOST, 0).expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let listener = HeraldSocket::new(listener).expect("register");

        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
        client
            .send_to(b"ping", (Ipv4Addr::LOCALHOST, port))
            .await
            .expect("send");

        listener.readable().await.expect("readable");
        let mut buf = [0u8; 64];
        let (len, src, dst) = listener.try_recv_with_dst(&mut buf).expect("recv");
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(src.ip(), &Ipv4Addr::LOCALHOST);
        assert_eq!(src.port(), client.local_addr().expect("addr").port());
        assert_eq!(dst, Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn session_socket_shares_the_listening_port() {
        let listener = bind_listener(Ipv4Addr::LOCALHOST, 0).expect("bind");
        let port = listener.local_addr().expect("local addr").port();

        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
        let peer = match client.local_addr().expect("addr") {
            std::net::SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        let session =
            session_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port), peer).expect("session");
        assert_eq!(session.local_addr().expect("addr").port(), port);
    }
}
