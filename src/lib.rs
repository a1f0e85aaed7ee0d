//! Advanced IPv6 socket manipulation.
//!
//! A narrow binding over the OS socket-option interface for the IPv6 knobs a
//! plain sockets API leaves out: hop limits, traffic class, multicast
//! membership, packet info and kernel-managed flow labels. Every call takes a
//! borrowed [`SocketHandle`]; the socket stays owned by the caller.
//!
//! The [`traffic`] and [`cli`] modules back the `traffic_generator` and
//! `traffic_sink` tools.

pub mod ancillary;
pub mod cli;
pub mod error;
pub mod flowlabel;
pub mod handle;
pub mod option;
pub mod sockopt;
mod sys;
pub mod traffic;

pub use ancillary::{RecvMeta, recv_with_meta};
pub use error::{Error, Result};
pub use flowlabel::{
    FLOW_LABEL_MAX, FlowLabel, FlowLabelRequest, FlowShare, acquire_flow_label, get_flow_label,
    release_flow_label, renew_flow_label,
};
pub use handle::SocketHandle;
pub use option::{Ipv6Option, OptionValue, ValueKind};
pub use sockopt::{get_option, join_group, leave_group, set_option};
