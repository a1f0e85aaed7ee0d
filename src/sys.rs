//! Platform option codes and the raw `getsockopt`/`setsockopt` calls.

use std::{ffi::c_void, mem, os::fd::RawFd};

use cfg_if::cfg_if;
use libc::{c_int, socklen_t};
use nix::errno::Errno;

use crate::option::Ipv6Option;

cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        // not exported by every libc release, values from linux/in6.h
        pub(crate) const IPV6_FLOWINFO: c_int = 11;
        pub(crate) const IPV6_FLOWLABEL_MGR: c_int = 32;
        pub(crate) const IPV6_FLOWINFO_SEND: c_int = 33;

        pub(crate) const IPV6_FL_A_GET: u8 = 0;
        pub(crate) const IPV6_FL_A_PUT: u8 = 1;
        pub(crate) const IPV6_FL_A_RENEW: u8 = 2;

        pub(crate) const IPV6_FL_F_CREATE: u16 = 1;
        pub(crate) const IPV6_FL_F_EXCL: u16 = 2;

        pub(crate) const IPV6_FL_S_NONE: u8 = 0;
        pub(crate) const IPV6_FL_S_EXCL: u8 = 1;
        pub(crate) const IPV6_FL_S_PROCESS: u8 = 2;
        pub(crate) const IPV6_FL_S_USER: u8 = 3;
        pub(crate) const IPV6_FL_S_ANY: u8 = 255;

        /// `struct in6_flowlabel_req`
        #[repr(C)]
        #[derive(Clone, Copy)]
        pub(crate) struct FlowLabelReq {
            pub dst: libc::in6_addr,
            /// network byte order
            pub label: u32,
            pub action: u8,
            pub share: u8,
            pub flags: u16,
            pub expires: u16,
            pub linger: u16,
            pub pad: u32,
        }

        pub(crate) fn option_code(option: Ipv6Option) -> Option<c_int> {
            let code = match option {
                Ipv6Option::HopLimit => libc::IPV6_UNICAST_HOPS,
                Ipv6Option::MulticastHops => libc::IPV6_MULTICAST_HOPS,
                Ipv6Option::MulticastLoop => libc::IPV6_MULTICAST_LOOP,
                Ipv6Option::MulticastInterface => libc::IPV6_MULTICAST_IF,
                Ipv6Option::TrafficClass => libc::IPV6_TCLASS,
                Ipv6Option::RecvTrafficClass => libc::IPV6_RECVTCLASS,
                Ipv6Option::RecvPacketInfo => libc::IPV6_RECVPKTINFO,
                Ipv6Option::RecvHopLimit => libc::IPV6_RECVHOPLIMIT,
                Ipv6Option::V6Only => libc::IPV6_V6ONLY,
                Ipv6Option::DontFragment => libc::IPV6_DONTFRAG,
                Ipv6Option::FlowInfoSend => IPV6_FLOWINFO_SEND,
                Ipv6Option::RecvFlowInfo => IPV6_FLOWINFO,
                Ipv6Option::JoinGroup => libc::IPV6_ADD_MEMBERSHIP,
                Ipv6Option::LeaveGroup => libc::IPV6_DROP_MEMBERSHIP,
                Ipv6Option::Raw(code) => code,
            };
            Some(code)
        }
    } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))] {
        pub(crate) fn option_code(option: Ipv6Option) -> Option<c_int> {
            match option {
                Ipv6Option::HopLimit => Some(libc::IPV6_UNICAST_HOPS),
                Ipv6Option::MulticastHops => Some(libc::IPV6_MULTICAST_HOPS),
                Ipv6Option::MulticastLoop => Some(libc::IPV6_MULTICAST_LOOP),
                Ipv6Option::MulticastInterface => Some(libc::IPV6_MULTICAST_IF),
                Ipv6Option::TrafficClass => Some(libc::IPV6_TCLASS),
                Ipv6Option::RecvTrafficClass => Some(libc::IPV6_RECVTCLASS),
                Ipv6Option::V6Only => Some(libc::IPV6_V6ONLY),
                Ipv6Option::JoinGroup => Some(libc::IPV6_JOIN_GROUP),
                Ipv6Option::LeaveGroup => Some(libc::IPV6_LEAVE_GROUP),
                Ipv6Option::Raw(code) => Some(code),
                _ => None,
            }
        }
    } else {
        pub(crate) fn option_code(option: Ipv6Option) -> Option<c_int> {
            match option {
                Ipv6Option::HopLimit => Some(libc::IPV6_UNICAST_HOPS),
                Ipv6Option::MulticastHops => Some(libc::IPV6_MULTICAST_HOPS),
                Ipv6Option::MulticastLoop => Some(libc::IPV6_MULTICAST_LOOP),
                Ipv6Option::V6Only => Some(libc::IPV6_V6ONLY),
                Ipv6Option::Raw(code) => Some(code),
                _ => None,
            }
        }
    }
}

pub(crate) fn getsockopt_int(fd: RawFd, name: c_int) -> nix::Result<c_int> {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    // SAFETY: value and len outlive the call and len matches value
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_IPV6,
            name,
            &raw mut value as *mut c_void,
            &mut len,
        )
    };
    Errno::result(ret)?;
    Ok(value)
}

/// `setsockopt(fd, IPPROTO_IPV6, name, value)` for any plain C value.
pub(crate) fn setsockopt_ipv6<T: Copy>(fd: RawFd, name: c_int, value: &T) -> nix::Result<()> {
    // SAFETY: value is a live `T` and the length is exactly its size
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            name,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };
    Errno::result(ret).map(drop)
}

/// `setsockopt` with a buffer the kernel may write back into.
///
/// `IPV6_FLOWLABEL_MGR` stores a freshly chosen label in `flr_label` of the
/// request it was given, so the pointer has to come from a unique borrow.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn setsockopt_ipv6_inout<T: Copy>(
    fd: RawFd,
    name: c_int,
    value: &mut T,
) -> nix::Result<()> {
    // SAFETY: value is a live, uniquely borrowed `T` and the length is its size
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            name,
            value as *mut T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };
    Errno::result(ret).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn flow_label_req_matches_kernel_layout() {
        assert_eq!(mem::size_of::<FlowLabelReq>(), 32);
        assert_eq!(mem::align_of::<FlowLabelReq>(), 4);
    }

    #[test]
    fn raw_codes_pass_through() {
        assert_eq!(option_code(Ipv6Option::Raw(77)), Some(77));
        assert!(option_code(Ipv6Option::HopLimit).is_some());
    }

    #[test]
    fn bad_descriptor_reports_ebadf() {
        assert_eq!(
            getsockopt_int(i32::MAX, libc::IPV6_UNICAST_HOPS),
            Err(Errno::EBADF)
        );
    }
}
