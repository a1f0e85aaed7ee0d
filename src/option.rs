//! IPv6 option identifiers and the values they carry.

use std::{fmt, net::Ipv6Addr};

use libc::c_int;

use crate::{
    error::{Error, Result},
    sys,
};

/// An `IPPROTO_IPV6` level socket option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ipv6Option {
    /// `IPV6_UNICAST_HOPS`
    HopLimit,
    /// `IPV6_MULTICAST_HOPS`
    MulticastHops,
    /// `IPV6_MULTICAST_LOOP`
    MulticastLoop,
    /// `IPV6_MULTICAST_IF`, an interface index.
    MulticastInterface,
    /// `IPV6_TCLASS`
    TrafficClass,
    /// `IPV6_RECVTCLASS`
    RecvTrafficClass,
    /// `IPV6_RECVPKTINFO`
    RecvPacketInfo,
    /// `IPV6_RECVHOPLIMIT`
    RecvHopLimit,
    /// `IPV6_V6ONLY`
    V6Only,
    /// `IPV6_DONTFRAG`
    DontFragment,
    /// `IPV6_FLOWINFO_SEND`, send the flow label from the destination address.
    FlowInfoSend,
    /// `IPV6_FLOWINFO`, deliver flow info as ancillary data.
    RecvFlowInfo,
    /// `IPV6_ADD_MEMBERSHIP`, write only.
    JoinGroup,
    /// `IPV6_DROP_MEMBERSHIP`, write only.
    LeaveGroup,
    /// Any other integer valued option, passed through unchecked.
    Raw(c_int),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Flag(bool),
    Int(i32),
    Membership { group: Ipv6Addr, interface: u32 },
}

/// Shape of the value an option expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Flag,
    Int { min: i32, max: i32 },
    Membership,
}

impl Ipv6Option {
    pub fn name(&self) -> &'static str {
        match self {
            Ipv6Option::HopLimit => "IPV6_UNICAST_HOPS",
            Ipv6Option::MulticastHops => "IPV6_MULTICAST_HOPS",
            Ipv6Option::MulticastLoop => "IPV6_MULTICAST_LOOP",
            Ipv6Option::MulticastInterface => "IPV6_MULTICAST_IF",
            Ipv6Option::TrafficClass => "IPV6_TCLASS",
            Ipv6Option::RecvTrafficClass => "IPV6_RECVTCLASS",
            Ipv6Option::RecvPacketInfo => "IPV6_RECVPKTINFO",
            Ipv6Option::RecvHopLimit => "IPV6_RECVHOPLIMIT",
            Ipv6Option::V6Only => "IPV6_V6ONLY",
            Ipv6Option::DontFragment => "IPV6_DONTFRAG",
            Ipv6Option::FlowInfoSend => "IPV6_FLOWINFO_SEND",
            Ipv6Option::RecvFlowInfo => "IPV6_FLOWINFO",
            Ipv6Option::JoinGroup => "IPV6_ADD_MEMBERSHIP",
            Ipv6Option::LeaveGroup => "IPV6_DROP_MEMBERSHIP",
            Ipv6Option::Raw(_) => "IPV6 option",
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Ipv6Option::HopLimit | Ipv6Option::MulticastHops | Ipv6Option::TrafficClass => {
                ValueKind::Int { min: 0, max: 255 }
            }
            Ipv6Option::MulticastInterface => ValueKind::Int {
                min: 0,
                max: i32::MAX,
            },
            Ipv6Option::Raw(_) => ValueKind::Int {
                min: i32::MIN,
                max: i32::MAX,
            },
            Ipv6Option::JoinGroup | Ipv6Option::LeaveGroup => ValueKind::Membership,
            _ => ValueKind::Flag,
        }
    }

    pub fn is_readable(&self) -> bool {
        !matches!(self, Ipv6Option::JoinGroup | Ipv6Option::LeaveGroup)
    }

    /// The platform option code, `None` where the platform lacks the option.
    pub fn code(&self) -> Option<c_int> {
        match self {
            Ipv6Option::Raw(code) => Some(*code),
            other => sys::option_code(*other),
        }
    }

    /// Check `value` against the option's domain before it reaches the kernel.
    pub(crate) fn validate(&self, value: &OptionValue) -> Result<()> {
        match (self.kind(), value) {
            (ValueKind::Flag, OptionValue::Flag(_)) => Ok(()),
            (ValueKind::Int { min, max }, OptionValue::Int(v)) => {
                if (min..=max).contains(v) {
                    Ok(())
                } else {
                    Err(Error::invalid_value(
                        *self,
                        format!("{} is outside {}..={}", v, min, max),
                    ))
                }
            }
            (ValueKind::Membership, OptionValue::Membership { group, .. }) => {
                if group.is_multicast() {
                    Ok(())
                } else {
                    Err(Error::invalid_value(
                        *self,
                        format!("{} is not a multicast group", group),
                    ))
                }
            }
            (kind, value) => Err(Error::invalid_value(
                *self,
                format!("expected {:?}, got {:?}", kind, value),
            )),
        }
    }
}

impl fmt::Display for Ipv6Option {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ipv6Option::Raw(code) => write!(f, "IPV6 option {}", code),
            other => f.write_str(other.name()),
        }
    }
}

impl OptionValue {
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            OptionValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            OptionValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Flag(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Int(v)
    }
}
