use std::{io, net::SocketAddr, sync::Arc};

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncReadExt, Interest},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::mpsc,
};

use super::{
    generator::Family,
    now_secs,
    wire::{self, DecodeError, MAX_MESSAGE_SIZE, Message},
};
use crate::{
    ancillary::recv_with_meta,
    handle::SocketHandle,
    option::{Ipv6Option, OptionValue},
    sockopt::set_option,
};

/// Smallest capture length, the IPv6 minimum MTU.
pub const MIN_CAPTURE_SIZE: usize = 1280;
pub const DEFAULT_CAPTURE_SIZE: usize = 9200;
pub const MAX_CAPTURE_SIZE: usize = MAX_MESSAGE_SIZE;
const LISTEN_BACKLOG: i32 = 5;

/// Report lines from the receive tasks, in arrival order.
pub type Reports = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub host: String,
    pub port: u16,
    pub udp: bool,
    pub tcp: bool,
    pub family: Family,
    /// Append the payload as hex to every report line.
    pub show_payload: bool,
    /// Read size for each receive call.
    pub capture_size: usize,
}

impl SinkConfig {
    /// Wildcard address for the family.
    pub fn default_host(family: Family) -> &'static str {
        match family {
            Family::V4 => "0.0.0.0",
            Family::V6 => "::",
        }
    }
}

/// Listen and report every received message on stdout. Runs until a
/// listener fails.
pub async fn run(config: SinkConfig) -> io::Result<()> {
    let config = Arc::new(config);
    let addr = resolve(&config).await?;

    let udp = if config.udp {
        Some(bind_udp(addr, config.family)?)
    } else {
        None
    };
    let tcp = if config.tcp {
        Some(bind_tcp(addr, config.family)?)
    } else {
        None
    };

    let (reports, mut lines) = mpsc::unbounded_channel();
    let udp_reports = reports.clone();
    let tcp_reports = reports;

    tokio::try_join!(
        async {
            match udp {
                Some(socket) => receive_datagrams(socket, config.clone(), udp_reports).await,
                None => Ok(()),
            }
        },
        async {
            match tcp {
                Some(listener) => accept_streams(listener, config.clone(), tcp_reports).await,
                None => Ok(()),
            }
        },
        async {
            while let Some(line) = lines.recv().await {
                println!("{}", line);
            }
            Ok::<_, io::Error>(())
        }
    )?;
    Ok(())
}

async fn resolve(config: &SinkConfig) -> io::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((config.host.as_str(), config.port)).await?;
    addrs.find(|addr| config.family.matches(addr)).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!(
                "could not open a socket for {} on port {}",
                config.host, config.port
            ),
        )
    })
}

fn new_socket(addr: SocketAddr, family: Family, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    if family == Family::V6 {
        let handle = SocketHandle::new(&socket);
        set_option(handle, Ipv6Option::RecvTrafficClass, OptionValue::Flag(true))?;
        set_option(handle, Ipv6Option::RecvHopLimit, OptionValue::Flag(true))?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn bind_udp(addr: SocketAddr, family: Family) -> io::Result<UdpSocket> {
    let socket = new_socket(addr, family, Type::DGRAM, Protocol::UDP)?;
    log::info!("UDP: listening on {}", addr);
    UdpSocket::from_std(socket.into())
}

fn bind_tcp(addr: SocketAddr, family: Family) -> io::Result<TcpListener> {
    let socket = new_socket(addr, family, Type::STREAM, Protocol::TCP)?;
    socket.listen(LISTEN_BACKLOG)?;
    log::info!("TCP: listening on {}", addr);
    TcpListener::from_std(socket.into())
}

async fn receive_datagrams(
    socket: UdpSocket,
    config: Arc<SinkConfig>,
    reports: Reports,
) -> io::Result<()> {
    let mut buf = vec![0u8; config.capture_size];
    loop {
        socket.readable().await?;
        let meta = match socket.try_io(Interest::READABLE, || {
            recv_with_meta(SocketHandle::new(&socket), &mut buf).map_err(io::Error::from)
        }) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                log::error!("unable to read from UDP: {}", e);
                continue;
            }
        };
        let now = now_secs();
        log::debug!(
            "datagram from {:?}: {} bytes, traffic class {:?}, hop limit {:?}",
            meta.source,
            meta.len,
            meta.traffic_class,
            meta.hop_limit
        );
        if meta.truncated {
            log::warn!("datagram longer than the {} byte capture size", buf.len());
        }

        let mut pending = BytesMut::from(&buf[..meta.len]);
        for line in drain_messages(&mut pending, now, config.show_payload) {
            if reports.send(line).is_err() {
                return Ok(());
            }
        }
        if !pending.is_empty() {
            log::error!("got a partial message over UDP");
        }
    }
}

async fn accept_streams(
    listener: TcpListener,
    config: Arc<SinkConfig>,
    reports: Reports,
) -> io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("unexpected socket error: {}", e);
                continue;
            }
        };
        log::info!("accepted connection from {}", peer);

        let config = config.clone();
        let reports = reports.clone();
        tokio::spawn(async move {
            if let Err(e) = receive_stream(stream, peer, config, reports).await {
                log::error!("remote client terminated unexpectedly: {}", e);
            }
        });
    }
}

async fn receive_stream(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: Arc<SinkConfig>,
    reports: Reports,
) -> io::Result<()> {
    let mut pending = BytesMut::with_capacity(config.capture_size);
    loop {
        pending.reserve(config.capture_size);
        let n = stream.read_buf(&mut pending).await?;
        if n == 0 {
            log::info!("remote client at {} has disconnected", peer);
            if !pending.is_empty() {
                log::error!("discarding partial data");
            }
            return Ok(());
        }
        let now = now_secs();
        for line in drain_messages(&mut pending, now, config.show_payload) {
            if reports.send(line).is_err() {
                return Ok(());
            }
        }
    }
}

/// Report lines for every whole message at the front of `pending`.
///
/// An incomplete trailing message is left in place. Malformed input is
/// dumped as hex and the buffer cleared, since there is no way to find the
/// next message boundary.
pub fn drain_messages(pending: &mut BytesMut, now: f64, show_payload: bool) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        match wire::decode(pending) {
            Ok(Some(msg)) => lines.push(report_line(&msg, now, show_payload)),
            Ok(None) => break,
            Err(e) => {
                log::debug!("malformed message: {}", e);
                let tag = match e {
                    DecodeError::ZeroSequence => "!SEQ",
                    DecodeError::ZeroLength | DecodeError::Truncated(_) => "!LEN",
                };
                lines.push(format!(
                    "{:.6} {} {} Rx {}",
                    now,
                    tag,
                    pending.len(),
                    hex::encode(&pending[..])
                ));
                pending.clear();
                break;
            }
        }
    }
    lines
}

/// `<rx time> <tclass> <size> Rx <seq> [<tx time> <latency>] [<payload hex>]`
pub fn report_line(msg: &Message, now: f64, show_payload: bool) -> String {
    let mut line = format!(
        "{:.6} {:#x} {} Rx {}",
        now,
        msg.traffic_class,
        msg.size(),
        msg.seq
    );
    if let Some(ts) = msg.timestamp {
        line.push_str(&format!(" {:.6} {:.6}", ts, now - ts));
    }
    if show_payload {
        line.push_str(&format!(" {}", hex::encode(&msg.payload)));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::{
        net::{Ipv4Addr, Ipv6Addr},
        time::Duration,
    };
    use tokio::io::AsyncWriteExt;

    fn message(seq: u16, timestamp: Option<f64>) -> Message {
        Message {
            seq,
            traffic_class: 0xb8,
            timestamp,
            payload: Bytes::from_static(b"\x01\x02"),
        }
    }

    #[test]
    fn report_formats() {
        let msg = message(7, None);
        assert_eq!(report_line(&msg, 10.5, false), "10.500000 0xb8 7 Rx 7");
        assert_eq!(report_line(&msg, 10.5, true), "10.500000 0xb8 7 Rx 7 0102");

        let msg = message(8, Some(10.25));
        assert_eq!(
            report_line(&msg, 10.5, false),
            "10.500000 0xb8 15 Rx 8 10.250000 0.250000"
        );
    }

    #[test]
    fn drains_whole_messages_only() {
        let mut wire = BytesMut::new();
        message(1, None).encode(&mut wire);
        message(2, None).encode(&mut wire);
        let mut pending = BytesMut::from(&wire[..10]);

        let lines = drain_messages(&mut pending, 1.0, false);
        assert_eq!(lines, vec!["1.000000 0xb8 7 Rx 1"]);
        assert_eq!(pending.len(), 3);

        pending.extend_from_slice(&wire[10..]);
        let lines = drain_messages(&mut pending, 2.0, false);
        assert_eq!(lines, vec!["2.000000 0xb8 7 Rx 2"]);
        assert!(pending.is_empty());
    }

    #[test]
    fn dumps_malformed_input() {
        let mut pending = BytesMut::from(&[0, 0, 0, 0, 5][..]);
        let lines = drain_messages(&mut pending, 1.0, false);
        assert_eq!(lines, vec!["1.000000 !SEQ 5 Rx 0000000005"]);
        assert!(pending.is_empty());

        let mut pending = BytesMut::from(&[0, 1, 0, 0, 0, 9][..]);
        let lines = drain_messages(&mut pending, 1.0, false);
        assert_eq!(lines, vec!["1.000000 !LEN 6 Rx 000100000009"]);
    }

    #[test]
    fn wildcard_host_per_family() {
        assert_eq!(SinkConfig::default_host(Family::V6), "::");
        assert_eq!(SinkConfig::default_host(Family::V4), "0.0.0.0");
    }

    fn loopback_config() -> Arc<SinkConfig> {
        Arc::new(SinkConfig {
            host: "::1".to_string(),
            port: 0,
            udp: true,
            tcp: true,
            family: Family::V6,
            show_payload: true,
            capture_size: DEFAULT_CAPTURE_SIZE,
        })
    }

    async fn next_line(lines: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), lines.recv())
            .await
            .expect("no report within 5s")
            .expect("report channel closed")
    }

    #[tokio::test]
    async fn reports_udp_datagrams() {
        let udp = bind_udp((Ipv6Addr::LOCALHOST, 0).into(), Family::V6).unwrap();
        let udp_addr = udp.local_addr().unwrap();
        let (reports, mut lines) = mpsc::unbounded_channel();
        let sink = tokio::spawn(receive_datagrams(udp, loopback_config(), reports));

        let mut buf = BytesMut::new();
        message(1, None).encode(&mut buf);
        let sender = UdpSocket::bind((Ipv6Addr::LOCALHOST, 0)).await.unwrap();
        sender.send_to(&buf, udp_addr).await.unwrap();

        let line = next_line(&mut lines).await;
        assert!(line.ends_with(" 0xb8 7 Rx 1 0102"), "{}", line);
        assert!(!sink.is_finished());
        sink.abort();
    }

    #[tokio::test]
    async fn reports_tcp_messages() {
        let tcp = bind_tcp((Ipv6Addr::LOCALHOST, 0).into(), Family::V6).unwrap();
        let tcp_addr = tcp.local_addr().unwrap();
        let (reports, mut lines) = mpsc::unbounded_channel();
        let sink = tokio::spawn(accept_streams(tcp, loopback_config(), reports));

        let mut buf = BytesMut::new();
        message(1, None).encode(&mut buf);
        let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
        stream.write_all(&buf).await.unwrap();

        let line = next_line(&mut lines).await;
        assert!(line.ends_with(" 0xb8 7 Rx 1 0102"), "{}", line);
        stream.shutdown().await.unwrap();
        sink.abort();
    }

    #[tokio::test]
    async fn tcp_message_split_across_writes() {
        let tcp = bind_tcp((Ipv6Addr::LOCALHOST, 0).into(), Family::V6).unwrap();
        let tcp_addr = tcp.local_addr().unwrap();
        let (reports, mut lines) = mpsc::unbounded_channel();
        let sink = tokio::spawn(accept_streams(tcp, loopback_config(), reports));

        let mut buf = BytesMut::new();
        message(1, Some(100.0)).encode(&mut buf);
        message(2, None).encode(&mut buf);
        let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
        stream.set_nodelay(true).unwrap();

        // first write ends inside the header of message 1
        stream.write_all(&buf[..4]).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lines.try_recv().is_err());

        stream.write_all(&buf[4..]).await.unwrap();
        let first = next_line(&mut lines).await;
        assert!(first.contains(" 0xb8 15 Rx 1 100.000000 "), "{}", first);
        assert!(first.ends_with(" 0102"), "{}", first);
        let second = next_line(&mut lines).await;
        assert!(second.ends_with(" 0xb8 7 Rx 2 0102"), "{}", second);

        stream.shutdown().await.unwrap();
        sink.abort();
    }

    #[tokio::test]
    async fn resolves_within_family() {
        let config = SinkConfig {
            host: "127.0.0.1".to_string(),
            port: 9,
            udp: true,
            tcp: false,
            family: Family::V6,
            show_payload: false,
            capture_size: DEFAULT_CAPTURE_SIZE,
        };
        assert!(resolve(&config).await.is_err());

        let config = SinkConfig {
            family: Family::V4,
            ..config
        };
        assert_eq!(
            resolve(&config).await.unwrap(),
            SocketAddr::from((Ipv4Addr::LOCALHOST, 9))
        );
    }
}
