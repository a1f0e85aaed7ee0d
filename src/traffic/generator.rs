use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6},
    os::fd::{AsFd, BorrowedFd},
    time::Duration,
};

use bytes::BytesMut;
use socket2::SockRef;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpSocket, TcpStream, UdpSocket},
};

use crate::{
    flowlabel::{FlowLabel, FlowLabelRequest, acquire_flow_label, get_flow_label},
    handle::SocketHandle,
    option::{Ipv6Option, OptionValue},
    sockopt::set_option,
    traffic::{
        now_secs,
        schedule::{Pacer, Rate, SlotPlan, cycle_slot, sequence_number},
        wire::{MAX_MESSAGE_SIZE, Message},
    },
};

/// Attempts made to reach the destination before giving up.
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }

    fn unspecified(&self) -> SocketAddr {
        match self {
            Family::V4 => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            Family::V6 => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub family: Family,
    /// UDP only: skip bind and connect, so ICMP errors are never reported.
    pub blind: bool,
    pub timestamp: bool,
    pub count: Option<u64>,
    /// Transmissions sent back to back at start.
    pub preload: u64,
    pub offset: Option<f64>,
    pub flow_label: Option<FlowLabel>,
    pub traffic_class: u8,
    pub rate: Rate,
    pub plan: SlotPlan,
    /// Suppress the per-transmission line on stdout.
    pub quiet: bool,
}

enum Link {
    Udp { socket: UdpSocket, target: SocketAddr },
    Tcp(TcpStream),
}

impl AsFd for Link {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Link::Udp { socket, .. } => socket.as_fd(),
            Link::Tcp(stream) => stream.as_fd(),
        }
    }
}

impl Link {
    fn handle(&self) -> SocketHandle<'_> {
        SocketHandle::new(self)
    }

    fn destination(&self) -> io::Result<SocketAddr> {
        match self {
            Link::Udp { target, .. } => Ok(*target),
            Link::Tcp(stream) => stream.peer_addr(),
        }
    }

    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Link::Udp { socket, target } => socket.send_to(buf, *target).await,
            Link::Tcp(stream) => {
                stream.write_all(buf).await?;
                Ok(buf.len())
            }
        }
    }
}

/// Send traffic until the configured count is reached or a send fails.
pub async fn run(config: &GeneratorConfig) -> io::Result<()> {
    let mut link = open(config).await?;
    match config.transport {
        Transport::Udp => log::info!("UDP: ready to transmit"),
        Transport::Tcp => log::info!("TCP: connection established"),
    }
    configure(&mut link, config)?;
    transmit(&mut link, config).await
}

async fn open(config: &GeneratorConfig) -> io::Result<Link> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host((config.host.as_str(), config.port)).await? {
        if !config.family.matches(&addr) {
            continue;
        }
        log::info!("attempting to transmit to {} port {}", addr.ip(), addr.port());
        match connect(addr, config).await {
            Ok(link) => return Ok(link),
            Err(e) => {
                log::error!("socket error for {}: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!(
                "could not open a socket for {} on port {}",
                config.host, config.port
            ),
        )
    }))
}

async fn connect(addr: SocketAddr, config: &GeneratorConfig) -> io::Result<Link> {
    let local = config.family.unspecified();
    if config.transport == Transport::Udp && config.blind {
        let socket = UdpSocket::bind(local).await?;
        return Ok(Link::Udp {
            socket,
            target: addr,
        });
    }
    let mut attempt = 1;
    loop {
        match connect_once(addr, local, config.transport).await {
            Ok(link) => return Ok(link),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                log::warn!("cannot connect to remote host: {}", e);
                log::warn!("retrying in {} seconds", CONNECT_RETRY_DELAY.as_secs());
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(e) => {
                log::error!("connection failed (max attempts reached): {}", e);
                return Err(e);
            }
        }
    }
}

async fn connect_once(addr: SocketAddr, local: SocketAddr, transport: Transport) -> io::Result<Link> {
    match transport {
        Transport::Udp => {
            let socket = UdpSocket::bind(local).await?;
            socket.connect(addr).await?;
            Ok(Link::Udp {
                socket,
                target: addr,
            })
        }
        Transport::Tcp => {
            let socket = if addr.is_ipv6() {
                TcpSocket::new_v6()?
            } else {
                TcpSocket::new_v4()?
            };
            socket.bind(local)?;
            let stream = socket.connect(addr).await?;
            // no Nagle, every message leaves on its own
            stream.set_nodelay(true)?;
            Ok(Link::Tcp(stream))
        }
    }
}

/// Traffic class and flow label setup on the opened socket.
fn configure(link: &mut Link, config: &GeneratorConfig) -> io::Result<()> {
    if config.family == Family::V4 {
        SockRef::from(&*link).set_tos(config.traffic_class as u32)?;
        if config.flow_label.is_some() {
            log::warn!("flow labels are IPv6 only, ignoring");
        }
        return Ok(());
    }

    let handle = link.handle();
    set_option(handle, Ipv6Option::RecvTrafficClass, OptionValue::Flag(true))?;
    set_option(
        handle,
        Ipv6Option::TrafficClass,
        OptionValue::Int(config.traffic_class as i32),
    )?;

    let Some(label) = config.flow_label else {
        return Ok(());
    };
    if config.transport == Transport::Tcp {
        log::warn!("TCP segments only carry flow labels leased before connecting");
    }
    let SocketAddr::V6(dest) = link.destination()? else {
        return Err(crate::Error::NotIpv6.into());
    };
    let labeled = lease_flow_label(handle, label, dest)?;
    if let Link::Udp { target, .. } = link {
        *target = SocketAddr::V6(labeled);
    }
    Ok(())
}

/// Lease `label` towards `dest`, letting the kernel pick when it is zero.
fn lease_flow_label(
    handle: SocketHandle<'_>,
    label: FlowLabel,
    mut dest: SocketAddrV6,
) -> crate::Result<SocketAddrV6> {
    if label.is_kernel_assigned() {
        let labeled = get_flow_label(handle, Some(dest))?;
        log::info!(
            "using flow label {} assigned by the kernel",
            FlowLabel::from_flowinfo(labeled.flowinfo())
        );
        return Ok(labeled);
    }
    let label = acquire_flow_label(handle, &dest, &FlowLabelRequest::new(label))?;
    log::info!("using flow label {}", label);
    dest.set_flowinfo(label.to_flowinfo());
    Ok(dest)
}

async fn transmit(link: &mut Link, config: &GeneratorConfig) -> io::Result<()> {
    let plan = &config.plan;
    log::debug!(
        "{} slots every {:?}, variable size: {}",
        plan.slots(),
        config.rate.interval(),
        plan.variable_size()
    );
    for slot in 1..=plan.slots() {
        log::debug!(
            "slot {}: payload {} bytes{}",
            slot,
            plan.payload(slot).len(),
            if plan.is_skipped(slot) { " (skipped)" } else { "" }
        );
    }

    let start = Pacer::start_at(now_secs(), config.offset);
    let mut pacer = Pacer::new(config.rate.interval, start);
    if config.offset.is_some() {
        sleep_secs(start - now_secs()).await;
    }

    let mut buf = BytesMut::with_capacity(MAX_MESSAGE_SIZE);
    let mut tx_count: u64 = 0;
    let mut skipped: u64 = 0;
    loop {
        let now = now_secs();
        tx_count += 1;
        let slot = cycle_slot(tx_count, plan.slots());
        let seq = sequence_number(tx_count);
        let fudge = pacer.wake(now);
        log::debug!(
            "time wake: {:.6}, fudge: {:.6}, next tx: {:.6}",
            now,
            fudge,
            pacer.next()
        );

        let sent_at = now_secs();
        let message = Message {
            seq,
            traffic_class: config.traffic_class,
            timestamp: config.timestamp.then_some(sent_at),
            payload: plan.payload(slot).clone(),
        };
        buf.clear();
        message.encode(&mut buf);

        if plan.is_skipped(slot) {
            skipped += 1;
            log::debug!("{:.6}: skip packet #{}", sent_at, seq);
        } else {
            if let Err(e) = link.send(&buf).await {
                log::error!("socket transmission error: {}", e);
                break;
            }
            log::debug!("{:.6}: sent packet #{}", sent_at, seq);
            if !config.quiet {
                println!(
                    "{:.6} {:#x} {} Tx {}",
                    sent_at,
                    config.traffic_class,
                    buf.len(),
                    seq
                );
            }
        }

        if config.count.is_some_and(|count| tx_count >= count) {
            break;
        }

        let now = now_secs();
        if let Some(delay) = pacer.delay(now, tx_count <= config.preload) {
            log::debug!(
                "time after tx: {:.6}, sleeping for: {:.6}",
                now,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }
    }
    log::info!("sent {} packets, skipped {}", tx_count - skipped, skipped);
    Ok(())
}

async fn sleep_secs(secs: f64) {
    if let Ok(delay) = Duration::try_from_secs_f64(secs) {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::wire::{self, prefix_len};
    use std::collections::BTreeSet;

    fn config(port: u16, count: u64) -> GeneratorConfig {
        let rate = Rate::resolve(None, None, Some(100.0)).unwrap();
        GeneratorConfig {
            host: "::1".to_string(),
            port,
            transport: Transport::Udp,
            family: Family::V6,
            blind: false,
            timestamp: true,
            count: Some(count),
            preload: 0,
            offset: None,
            flow_label: None,
            traffic_class: 0xb8,
            plan: SlotPlan::new(rate.slots(), 32, prefix_len(true), b"x", &[], BTreeSet::new()),
            rate,
            quiet: true,
        }
    }

    #[test]
    fn family_filters_addresses() {
        let v6: SocketAddr = "[::1]:1".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(Family::V6.matches(&v6));
        assert!(!Family::V6.matches(&v4));
        assert!(Family::V4.matches(&v4));
    }

    #[tokio::test]
    async fn sends_sequenced_udp_messages() {
        let sink = UdpSocket::bind("[::1]:0").await.unwrap();
        let port = sink.local_addr().unwrap().port();
        run(&config(port, 3)).await.unwrap();

        let mut buf = [0u8; 64];
        for expected in 1..=3u16 {
            let n = sink.recv(&mut buf).await.unwrap();
            let mut pending = BytesMut::from(&buf[..n]);
            let msg = wire::decode(&mut pending).unwrap().unwrap();
            assert_eq!(msg.seq, expected);
            assert_eq!(msg.traffic_class, 0xb8);
            assert!(msg.timestamp.is_some());
            assert_eq!(n, 32);
            assert!(pending.is_empty());
        }
    }

    #[tokio::test]
    async fn sends_over_tcp() {
        use tokio::io::AsyncReadExt;
        let listener = tokio::net::TcpListener::bind("[::1]:0").await.unwrap();
        let mut cfg = config(listener.local_addr().unwrap().port(), 2);
        cfg.transport = Transport::Tcp;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            stream.read_to_end(&mut data).await.unwrap();
            data
        });
        run(&cfg).await.unwrap();
        // closing the link lets read_to_end finish
        let data = server.await.unwrap();
        assert_eq!(data.len(), 64);
        let mut pending = BytesMut::from(&data[..]);
        assert_eq!(wire::decode(&mut pending).unwrap().unwrap().seq, 1);
        assert_eq!(wire::decode(&mut pending).unwrap().unwrap().seq, 2);
    }
}
