//! `get_option` / `set_option` over an opaque [`SocketHandle`].

use std::net::Ipv6Addr;

use libc::c_int;

use crate::{
    error::{Error, Result},
    handle::SocketHandle,
    option::{Ipv6Option, OptionValue, ValueKind},
    sys,
};

/// Read `option` from the socket behind `handle`.
pub fn get_option(handle: SocketHandle<'_>, option: Ipv6Option) -> Result<OptionValue> {
    let fd = handle.raw()?;
    let code = option.code().ok_or_else(|| Error::unsupported(option))?;
    if !option.is_readable() {
        return Err(Error::unsupported(option));
    }
    let raw = sys::getsockopt_int(fd, code).map_err(|e| Error::from_errno(e, option, false))?;
    log::trace!("getsockopt fd {} {} -> {}", fd, option, raw);
    Ok(match option.kind() {
        ValueKind::Flag => OptionValue::Flag(raw != 0),
        _ => OptionValue::Int(raw),
    })
}

/// Write `value` to `option`.
///
/// Values outside the option's domain are refused before the kernel sees
/// them, so a failed set never changes the socket.
pub fn set_option(handle: SocketHandle<'_>, option: Ipv6Option, value: OptionValue) -> Result<()> {
    let fd = handle.raw()?;
    let code = option.code().ok_or_else(|| Error::unsupported(option))?;
    option.validate(&value)?;
    log::trace!("setsockopt fd {} {} = {:?}", fd, option, value);
    let res = match value {
        OptionValue::Flag(v) => sys::setsockopt_ipv6(fd, code, &(v as c_int)),
        OptionValue::Int(v) => sys::setsockopt_ipv6(fd, code, &(v as c_int)),
        OptionValue::Membership { group, interface } => {
            let mreq = libc::ipv6_mreq {
                ipv6mr_multiaddr: libc::in6_addr {
                    s6_addr: group.octets(),
                },
                ipv6mr_interface: interface as _,
            };
            sys::setsockopt_ipv6(fd, code, &mreq)
        }
    };
    res.map_err(|e| Error::from_errno(e, option, true))
}

/// Join multicast `group` on interface index `interface` (0 lets the kernel pick).
pub fn join_group(handle: SocketHandle<'_>, group: Ipv6Addr, interface: u32) -> Result<()> {
    set_option(
        handle,
        Ipv6Option::JoinGroup,
        OptionValue::Membership { group, interface },
    )
}

pub fn leave_group(handle: SocketHandle<'_>, group: Ipv6Addr, interface: u32) -> Result<()> {
    set_option(
        handle,
        Ipv6Option::LeaveGroup,
        OptionValue::Membership { group, interface },
    )
}
