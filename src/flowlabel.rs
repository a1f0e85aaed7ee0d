//! Kernel flow label management (`IPV6_FLOWLABEL_MGR`).
//!
//! Linux only hands out flow labels to sockets that lease them first: a
//! label is requested for a destination, then `IPV6_FLOWINFO_SEND` makes the
//! kernel take the label from the `sin6_flowinfo` of the address passed to
//! `sendto`/`connect`. Other platforms report every call as unsupported.

use std::{fmt, net::SocketAddrV6};

use crate::{
    error::{Error, Result},
    handle::SocketHandle,
};

/// Largest value that fits the 20-bit IPv6 flow label field.
pub const FLOW_LABEL_MAX: u32 = 0x000f_ffff;

/// A 20-bit IPv6 flow label. Zero asks the kernel to choose one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlowLabel(u32);

impl FlowLabel {
    pub const KERNEL_ASSIGNED: FlowLabel = FlowLabel(0);

    pub fn new(label: u32) -> Option<FlowLabel> {
        if label <= FLOW_LABEL_MAX {
            Some(FlowLabel(label))
        } else {
            None
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_kernel_assigned(&self) -> bool {
        self.0 == 0
    }

    /// Extract the label from a `SocketAddrV6::flowinfo()` value.
    ///
    /// std hands `flowinfo` to the kernel as `sin6_flowinfo` unchanged, so it
    /// holds the traffic class and label in network byte order.
    pub fn from_flowinfo(flowinfo: u32) -> FlowLabel {
        FlowLabel(u32::from_be(flowinfo) & FLOW_LABEL_MAX)
    }

    /// The `flowinfo` to put in a `SocketAddrV6` so the kernel sends this label.
    pub fn to_flowinfo(&self) -> u32 {
        self.0.to_be()
    }
}

impl fmt::Display for FlowLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x})", self.0, self.0)
    }
}

/// Who else may use a leased label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowShare {
    None,
    #[default]
    Exclusive,
    Process,
    User,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowLabelRequest {
    pub label: FlowLabel,
    pub share: FlowShare,
    /// Seconds the label stays reserved after release.
    pub linger: u16,
    /// Seconds the lease is kept alive without use.
    pub expires: u16,
}

impl FlowLabelRequest {
    pub fn new(label: FlowLabel) -> Self {
        FlowLabelRequest {
            label,
            ..Default::default()
        }
    }
}

/// Lease a kernel-chosen flow label towards the socket's destination and
/// enable sending it.
///
/// The destination is the connected peer if there is one; otherwise `dest`
/// when it carries a non-zero port; otherwise the socket's local address.
/// The returned address is that destination with `flowinfo` carrying the new
/// label (see [`FlowLabel::to_flowinfo`]), ready to pass to `send_to`.
pub fn get_flow_label(
    handle: SocketHandle<'_>,
    dest: Option<SocketAddrV6>,
) -> Result<SocketAddrV6> {
    let mut target = resolve_destination(handle, dest)?;
    let label = acquire_flow_label(handle, &target, &FlowLabelRequest::default())?;
    target.set_flowinfo(label.to_flowinfo());
    log::debug!("leased flow label {} towards {}", label, target);
    Ok(target)
}

fn resolve_destination(
    handle: SocketHandle<'_>,
    dest: Option<SocketAddrV6>,
) -> Result<SocketAddrV6> {
    if let Some(peer) = handle.peer_addr_v6()? {
        return Ok(peer);
    }
    match dest {
        Some(addr) if addr.port() > 0 => Ok(addr),
        _ => handle.local_addr_v6(),
    }
}

pub use imp::{acquire_flow_label, release_flow_label, renew_flow_label};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use std::net::SocketAddrV6;

    use super::{FlowLabel, FlowLabelRequest, FlowShare};
    use crate::{
        error::{Error, Result},
        handle::SocketHandle,
        option::{Ipv6Option, OptionValue},
        sockopt::set_option,
        sys::{self, FlowLabelReq},
    };

    // Errors from the manager call are reported against the option that
    // switches flow labels on, the nearest public identifier.
    const OPTION: Ipv6Option = Ipv6Option::FlowInfoSend;

    fn share_code(share: FlowShare) -> u8 {
        match share {
            FlowShare::None => sys::IPV6_FL_S_NONE,
            FlowShare::Exclusive => sys::IPV6_FL_S_EXCL,
            FlowShare::Process => sys::IPV6_FL_S_PROCESS,
            FlowShare::User => sys::IPV6_FL_S_USER,
            FlowShare::Any => sys::IPV6_FL_S_ANY,
        }
    }

    fn base_request(dest: &SocketAddrV6, label: FlowLabel, action: u8) -> FlowLabelReq {
        FlowLabelReq {
            dst: libc::in6_addr {
                s6_addr: dest.ip().octets(),
            },
            label: label.value().to_be(),
            action,
            share: sys::IPV6_FL_S_NONE,
            flags: 0,
            expires: 0,
            linger: 0,
            pad: 0,
        }
    }

    fn manage(handle: SocketHandle<'_>, req: &mut FlowLabelReq) -> Result<()> {
        let fd = handle.raw()?;
        sys::setsockopt_ipv6_inout(fd, sys::IPV6_FLOWLABEL_MGR, req)
            .map_err(|e| Error::from_errno(e, OPTION, true))
    }

    /// Lease `request.label` (or a kernel-chosen label) for `dest` and turn
    /// on `IPV6_FLOWINFO_SEND`.
    pub fn acquire_flow_label(
        handle: SocketHandle<'_>,
        dest: &SocketAddrV6,
        request: &FlowLabelRequest,
    ) -> Result<FlowLabel> {
        let mut req = request_for(dest, request);
        manage(handle, &mut req)?;
        let label = FlowLabel::new(u32::from_be(req.label))
            .ok_or_else(|| Error::invalid_value(OPTION, "kernel returned an oversized label"))?;
        if label.is_kernel_assigned() {
            return Err(Error::invalid_value(OPTION, "kernel did not assign a label"));
        }
        set_option(handle, Ipv6Option::FlowInfoSend, OptionValue::Flag(true))?;
        log::trace!("flow label {} acquired for {}", label, dest.ip());
        Ok(label)
    }

    fn request_for(dest: &SocketAddrV6, request: &FlowLabelRequest) -> FlowLabelReq {
        let mut req = base_request(dest, request.label, sys::IPV6_FL_A_GET);
        req.share = share_code(request.share);
        req.flags = sys::IPV6_FL_F_CREATE;
        if !request.label.is_kernel_assigned() {
            req.flags |= sys::IPV6_FL_F_EXCL;
        }
        req.linger = request.linger;
        req.expires = request.expires;
        req
    }

    /// Extend the lease of `label`.
    pub fn renew_flow_label(
        handle: SocketHandle<'_>,
        label: FlowLabel,
        linger: u16,
        expires: u16,
    ) -> Result<()> {
        let mut req = base_request(&unspecified(), label, sys::IPV6_FL_A_RENEW);
        req.linger = linger;
        req.expires = expires;
        manage(handle, &mut req)
    }

    /// Give `label` back to the kernel.
    pub fn release_flow_label(handle: SocketHandle<'_>, label: FlowLabel) -> Result<()> {
        let mut req = base_request(&unspecified(), label, sys::IPV6_FL_A_PUT);
        manage(handle, &mut req)?;
        log::trace!("flow label {} released", label);
        Ok(())
    }

    fn unspecified() -> SocketAddrV6 {
        SocketAddrV6::new(std::net::Ipv6Addr::UNSPECIFIED, 0, 0, 0)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod imp {
    use std::net::SocketAddrV6;

    use super::{FlowLabel, FlowLabelRequest};
    use crate::{
        error::{Error, Result},
        handle::SocketHandle,
        option::Ipv6Option,
    };

    pub fn acquire_flow_label(
        handle: SocketHandle<'_>,
        _dest: &SocketAddrV6,
        _request: &FlowLabelRequest,
    ) -> Result<FlowLabel> {
        handle.raw()?;
        Err(Error::unsupported(Ipv6Option::FlowInfoSend))
    }

    pub fn renew_flow_label(
        handle: SocketHandle<'_>,
        _label: FlowLabel,
        _linger: u16,
        _expires: u16,
    ) -> Result<()> {
        handle.raw()?;
        Err(Error::unsupported(Ipv6Option::FlowInfoSend))
    }

    pub fn release_flow_label(handle: SocketHandle<'_>, _label: FlowLabel) -> Result<()> {
        handle.raw()?;
        Err(Error::unsupported(Ipv6Option::FlowInfoSend))
    }
}

impl From<FlowLabel> for u32 {
    fn from(label: FlowLabel) -> u32 {
        label.0
    }
}

impl TryFrom<u32> for FlowLabel {
    type Error = Error;

    fn try_from(label: u32) -> Result<FlowLabel> {
        FlowLabel::new(label).ok_or_else(|| Error::InvalidValue {
            option: "flow label".to_string(),
            reason: format!("{:#x} exceeds {:#x}", label, FLOW_LABEL_MAX),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Socket, Type};
    use std::net::{Ipv6Addr, SocketAddr};

    #[test]
    fn label_range() {
        assert_eq!(FlowLabel::new(FLOW_LABEL_MAX).unwrap().value(), 0xfffff);
        assert!(FlowLabel::new(FLOW_LABEL_MAX + 1).is_none());
        assert!(FlowLabel::try_from(0x10_0000).is_err());
        assert!(FlowLabel::default().is_kernel_assigned());
        assert_eq!(FlowLabel::new(0x1234).unwrap().to_string(), "4660 (0x1234)");
    }

    #[test]
    fn flowinfo_is_network_order() {
        let label = FlowLabel::new(0xabcde).unwrap();
        assert_eq!(label.to_flowinfo().to_ne_bytes(), [0x00, 0x0a, 0xbc, 0xde]);
        // traffic class bits above the label are dropped
        let with_tclass = (0x0b80_0000u32 | 0xabcde).to_be();
        assert_eq!(FlowLabel::from_flowinfo(with_tclass), label);
    }

    #[test]
    fn invalid_handle_fails_first() {
        let handle = unsafe { SocketHandle::from_raw_fd(-1) };
        assert!(matches!(
            get_flow_label(handle, None),
            Err(Error::InvalidHandle)
        ));
    }

    #[test]
    fn ipv4_socket_is_rejected() {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap();
        socket
            .bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
            .unwrap();
        assert!(matches!(
            get_flow_label(SocketHandle::new(&socket), None),
            Err(Error::NotIpv6)
        ));
    }

    #[test]
    fn destination_prefers_supplied_address_when_unconnected() {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, None).unwrap();
        socket
            .bind(&"[::1]:0".parse::<SocketAddr>().unwrap().into())
            .unwrap();
        let handle = SocketHandle::new(&socket);
        let supplied = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 9000, 0, 0);
        assert_eq!(
            resolve_destination(handle, Some(supplied)).unwrap(),
            supplied
        );
        let portless = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0);
        let local = resolve_destination(handle, Some(portless)).unwrap();
        assert_eq!(local, handle.local_addr_v6().unwrap());
    }

    #[test]
    fn destination_prefers_peer_when_connected() {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, None).unwrap();
        let peer: SocketAddr = "[::1]:9".parse().unwrap();
        socket.connect(&peer.into()).unwrap();
        let handle = SocketHandle::new(&socket);
        let other = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 9000, 0, 0);
        assert_eq!(
            resolve_destination(handle, Some(other)).unwrap().port(),
            9
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    #[ignore = "needs a kernel with IPv6 flow label manager support"]
    fn kernel_assigns_label() {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, None).unwrap();
        let peer: SocketAddr = "[::1]:9".parse().unwrap();
        socket.connect(&peer.into()).unwrap();
        let handle = SocketHandle::new(&socket);
        let addr = get_flow_label(handle, None).unwrap();
        let label = FlowLabel::from_flowinfo(addr.flowinfo());
        assert!(!label.is_kernel_assigned());
        assert_eq!(label.to_flowinfo(), addr.flowinfo());
        release_flow_label(handle, label).unwrap();
    }
}
