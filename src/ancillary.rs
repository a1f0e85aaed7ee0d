//! Receive a datagram together with the IPv6 packet info the kernel attaches
//! once the `IPV6_RECV*` options are switched on.

use std::{
    ffi::c_void,
    mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    ptr,
};

use libc::{c_int, socklen_t};
use nix::errno::Errno;

use crate::{
    error::{Error, Result},
    flowlabel::FlowLabel,
    handle::SocketHandle,
};

/// What one `recvmsg` call delivered besides the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvMeta {
    pub len: usize,
    /// The datagram was longer than the buffer.
    pub truncated: bool,
    pub source: Option<SocketAddr>,
    /// `IPV6_TCLASS`, needs [`RecvTrafficClass`](crate::Ipv6Option::RecvTrafficClass).
    pub traffic_class: Option<u8>,
    /// `IPV6_HOPLIMIT`, needs [`RecvHopLimit`](crate::Ipv6Option::RecvHopLimit).
    pub hop_limit: Option<u8>,
    /// `IPV6_PKTINFO` destination, needs [`RecvPacketInfo`](crate::Ipv6Option::RecvPacketInfo).
    pub destination: Option<Ipv6Addr>,
    /// `IPV6_PKTINFO` arrival interface index.
    pub interface: Option<u32>,
    /// `IPV6_FLOWINFO`, needs [`RecvFlowInfo`](crate::Ipv6Option::RecvFlowInfo).
    pub flow_label: Option<FlowLabel>,
}

// room for every control message we ask for, u64 keeps cmsghdr aligned
const CONTROL_WORDS: usize = 32;

/// Receive one datagram into `buf` with `recvmsg`.
///
/// Non-blocking sockets report `WouldBlock` as [`Error::Os`] with `EAGAIN`,
/// which converts back into an `io::ErrorKind::WouldBlock` error.
pub fn recv_with_meta(handle: SocketHandle<'_>, buf: &mut [u8]) -> Result<RecvMeta> {
    let fd = handle.raw()?;

    // SAFETY: all-zero is a valid sockaddr_storage and msghdr
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let mut control = [0u64; CONTROL_WORDS];

    msg.msg_name = &raw mut storage as *mut c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = mem::size_of_val(&control) as _;

    // SAFETY: every pointer in msg refers to a live local or to buf
    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(match Errno::last() {
            Errno::EBADF | Errno::ENOTSOCK => Error::InvalidHandle,
            errno => Error::Os(errno),
        });
    }

    let mut meta = RecvMeta {
        len: n as usize,
        truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
        source: to_socket_addr(&storage),
        ..Default::default()
    };

    // SAFETY: msg was filled by the kernel; the cmsg macros stay inside
    // msg_controllen and every payload is read unaligned
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = ptr::read_unaligned(cmsg);
            if hdr.cmsg_level == libc::IPPROTO_IPV6 {
                parse_ipv6_cmsg(&mut meta, hdr.cmsg_type, libc::CMSG_DATA(cmsg));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    log::trace!("recvmsg fd {} -> {:?}", fd, meta);
    Ok(meta)
}

unsafe fn read_int(data: *const u8) -> c_int {
    unsafe { ptr::read_unaligned(data as *const c_int) }
}

#[allow(unused_variables)]
unsafe fn parse_ipv6_cmsg(meta: &mut RecvMeta, ty: c_int, data: *const u8) {
    match ty {
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd"
        ))]
        libc::IPV6_TCLASS => meta.traffic_class = Some(unsafe { read_int(data) } as u8),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        libc::IPV6_HOPLIMIT => meta.hop_limit = Some(unsafe { read_int(data) } as u8),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        libc::IPV6_PKTINFO => {
            let info = unsafe { ptr::read_unaligned(data as *const libc::in6_pktinfo) };
            meta.destination = Some(Ipv6Addr::from(info.ipi6_addr.s6_addr));
            meta.interface = Some(info.ipi6_ifindex as u32);
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        crate::sys::IPV6_FLOWINFO => {
            let raw = unsafe { ptr::read_unaligned(data as *const u32) };
            meta.flow_label = Some(FlowLabel::from_flowinfo(raw));
        }
        _ => {}
    }
}

fn to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET6 => {
            // SAFETY: the family says this storage holds a sockaddr_in6
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        libc::AF_INET => {
            // SAFETY: the family says this storage holds a sockaddr_in
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        _ => None,
    }
}
