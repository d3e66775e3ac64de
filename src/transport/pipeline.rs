//! Per-connection read and write loops.
//!
//! The reliable writer drains a session's outbound queue into the framed
//! stream and writes a [`Message::Ping`] whenever nothing else has been written
//! for the write-idle interval. The reliable reader fails with
//! [`ProtocolError::ConnectionTimeout`] after the read-idle interval without
//! inbound frames; pings count as traffic but are never surfaced.
//!
//! Best-effort traffic goes through a [`DatagramLink`], implemented by the
//! server's [`VirtualChannel`] and the client's [`ConnectedDatagram`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::codec::RegistrarCodec;
use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::transport::multiplex::VirtualChannel;
use crate::utils::metrics::global_metrics;

/// Datagram-oriented half of a session
pub trait DatagramLink: Send + Sync + 'static {
    fn send(&self, payload: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Next datagram; an error means the link is finished
    fn recv(&self) -> impl Future<Output = Result<Bytes>> + Send;

    fn close(&self);

    fn remote_addr(&self) -> SocketAddr;
}

impl DatagramLink for VirtualChannel {
    async fn send(&self, payload: Bytes) -> Result<()> {
        VirtualChannel::send(self, &payload).await
    }

    async fn recv(&self) -> Result<Bytes> {
        VirtualChannel::recv(self)
            .await
            .ok_or(ProtocolError::ConnectionClosed)
    }

    fn close(&self) {
        VirtualChannel::close(self)
    }

    fn remote_addr(&self) -> SocketAddr {
        VirtualChannel::remote_addr(self)
    }
}

/// Client-side UDP socket connected to the server's best-effort port
#[derive(Debug)]
pub struct ConnectedDatagram {
    socket: UdpSocket,
    remote: SocketAddr,
    buffer_size: usize,
    closed: CancellationToken,
}

impl ConnectedDatagram {
    /// Bind an ephemeral local port and connect it to `remote`
    pub async fn connect(remote: SocketAddr, buffer_size: usize) -> Result<Self> {
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(Self {
            socket,
            remote,
            buffer_size,
            closed: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl DatagramLink for ConnectedDatagram {
    async fn send(&self, payload: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.socket.send(&payload).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let received = tokio::select! {
                _ = self.closed.cancelled() => return Err(ProtocolError::ConnectionClosed),
                received = self.socket.recv(&mut buf) => received,
            };
            match received {
                Ok(len) => {
                    buf.truncate(len);
                    return Ok(Bytes::from(buf));
                }
                // ICMP port unreachable from an earlier send; the server may not be up yet.
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    debug!(remote = %self.remote, "Best-effort peer refused datagram");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

/// Drain `outbound` into `sink` until cancelled or the queue closes.
///
/// Messages already queued when cancellation arrives are still written.
pub async fn run_reliable_writer<W>(
    mut sink: FramedWrite<W, RegistrarCodec>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    write_idle: Duration,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let idle = tokio::time::sleep(write_idle);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                while let Ok(message) = outbound.try_recv() {
                    sink.feed(message).await?;
                }
                sink.close().await?;
                return Ok(());
            }
            message = outbound.recv() => match message {
                Some(message) => {
                    sink.send(message).await?;
                    idle.as_mut().reset(Instant::now() + write_idle);
                }
                None => {
                    sink.close().await?;
                    return Ok(());
                }
            },
            _ = &mut idle => {
                trace!("Write idle, sending ping");
                sink.send(Message::Ping).await?;
                global_metrics().ping_sent();
                idle.as_mut().reset(Instant::now() + write_idle);
            }
        }
    }
}

/// Next non-ping frame from the reliable stream
pub async fn read_reliable<R>(
    stream: &mut FramedRead<R, RegistrarCodec>,
    read_idle: Duration,
) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    loop {
        match tokio::time::timeout(read_idle, stream.next()).await {
            Err(_) => {
                global_metrics().idle_timeout();
                return Err(ProtocolError::ConnectionTimeout);
            }
            Ok(None) => return Err(ProtocolError::ConnectionClosed),
            Ok(Some(Err(e))) => return Err(e),
            Ok(Some(Ok(Message::Ping))) => trace!("Ping received"),
            Ok(Some(Ok(message))) => return Ok(message),
        }
    }
}

/// Encode and send queued best-effort messages until cancelled.
///
/// A message that cannot be encoded, or whose datagram the socket refuses, is
/// dropped with a warning. Only a closed link ends the loop.
pub async fn run_datagram_writer<L: DatagramLink>(
    link: Arc<L>,
    mut codec: RegistrarCodec,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            message = outbound.recv() => match message {
                Some(message) => message,
                None => return Ok(()),
            },
        };
        let datagram = match codec.encode_datagram(&message) {
            Ok(datagram) => datagram,
            Err(e) => {
                global_metrics().datagram_dropped();
                warn!(name = message.name(), error = %e, "Dropping unencodable datagram");
                continue;
            }
        };
        match link.send(datagram).await {
            Ok(()) => {}
            Err(ProtocolError::ConnectionClosed) => return Err(ProtocolError::ConnectionClosed),
            Err(e) => {
                global_metrics().datagram_dropped();
                warn!(name = message.name(), remote = %link.remote_addr(), error = %e, "Datagram send failed, dropped");
            }
        }
    }
}

/// Receive and decode the next datagram.
///
/// Decoding failures are returned; a registrar desync is not recoverable.
pub async fn read_datagram<L: DatagramLink>(link: &L, codec: &mut RegistrarCodec) -> Result<Message> {
    let datagram = link.recv().await?;
    codec.decode_datagram(&datagram)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::core::message::HandshakeToken;
    use crate::core::schema::MessageSchema;
    use tokio::io::duplex;

    fn codec() -> RegistrarCodec {
        RegistrarCodec::new(Arc::new(MessageSchema::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_writer_pings_each_interval() {
        let (client, server) = duplex(4096);
        let (_tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(run_reliable_writer(
            FramedWrite::new(client, codec()),
            rx,
            Duration::from_secs(10),
            cancel.clone(),
        ));

        let mut reader = FramedRead::new(server, codec());
        let started = Instant::now();
        for expected in 1..=3u64 {
            let frame = reader.next().await.unwrap().unwrap();
            assert_eq!(frame, Message::Ping);
            assert_eq!(started.elapsed().as_secs(), expected * 10);
        }

        cancel.cancel();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_postpones_ping() {
        let (client, server) = duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_reliable_writer(
            FramedWrite::new(client, codec()),
            rx,
            Duration::from_secs(10),
            cancel.clone(),
        ));

        let mut reader = FramedRead::new(server, codec());
        let started = Instant::now();
        tokio::time::sleep(Duration::from_secs(6)).await;
        tx.send(Message::ConnectionEstablished).unwrap();
        assert_eq!(
            reader.next().await.unwrap().unwrap(),
            Message::ConnectionEstablished
        );

        assert_eq!(reader.next().await.unwrap().unwrap(), Message::Ping);
        assert_eq!(started.elapsed().as_secs(), 16);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_times_out_on_silence() {
        let (_client, server) = duplex(64);
        let mut reader = FramedRead::new(server, codec());
        let started = Instant::now();
        let result = read_reliable(&mut reader, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionTimeout)));
        assert_eq!(started.elapsed().as_secs(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_skips_pings_but_counts_them_as_traffic() {
        let (client, server) = duplex(4096);
        let mut writer = FramedWrite::new(client, codec());
        let mut reader = FramedRead::new(server, codec());

        let feeder = tokio::spawn(async move {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_secs(20)).await;
                writer.send(Message::Ping).await.unwrap();
            }
            writer.send(Message::ConnectionEstablished).await.unwrap();
            writer
        });

        let message = read_reliable(&mut reader, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(message, Message::ConnectionEstablished);
        drop(feeder.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_flushes_queued_messages() {
        let (client, server) = duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tx.send(Message::ConnectionEstablished).unwrap();
        cancel.cancel();

        run_reliable_writer(
            FramedWrite::new(client, codec()),
            rx,
            Duration::from_secs(10),
            cancel,
        )
        .await
        .unwrap();

        let mut reader = FramedRead::new(server, codec());
        assert_eq!(
            reader.next().await.unwrap().unwrap(),
            Message::ConnectionEstablished
        );
        assert!(reader.next().await.is_none());
    }

    fn long_token(len: usize) -> Message {
        Message::HandshakeToken(HandshakeToken {
            token: "x".repeat(len),
            from_server: false,
        })
    }

    async fn next_datagram(socket: &UdpSocket) -> Message {
        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .expect("no datagram arrived")
            .unwrap();
        codec().decode_datagram(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_datagram_writer_drops_frames_over_the_limit() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = Arc::new(
            ConnectedDatagram::connect(server.local_addr().unwrap(), 512)
                .await
                .unwrap(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(run_datagram_writer(
            Arc::clone(&link),
            codec().with_max_frame_size(508),
            rx,
            cancel.clone(),
        ));

        tx.send(long_token(4000)).unwrap();
        tx.send(Message::Ping).unwrap();
        assert_eq!(next_datagram(&server).await, Message::Ping);
        assert!(!writer.is_finished());

        cancel.cancel();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_datagram_writer_survives_refused_send() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = Arc::new(
            ConnectedDatagram::connect(server.local_addr().unwrap(), 2048)
                .await
                .unwrap(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        // Frame limit above what a single UDP datagram can carry.
        let writer = tokio::spawn(run_datagram_writer(
            Arc::clone(&link),
            codec().with_max_frame_size(100_000),
            rx,
            cancel.clone(),
        ));

        tx.send(long_token(70_000)).unwrap();
        tx.send(Message::Ping).unwrap();
        assert_eq!(next_datagram(&server).await, Message::Ping);
        assert!(!writer.is_finished());

        cancel.cancel();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_datagram_writer_stops_on_closed_link() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = Arc::new(
            ConnectedDatagram::connect(server.local_addr().unwrap(), 2048)
                .await
                .unwrap(),
        );
        link.close();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Message::Ping).unwrap();
        let result = run_datagram_writer(link, codec(), rx, CancellationToken::new()).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connected_datagram_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = ConnectedDatagram::connect(server.local_addr().unwrap(), 2048)
            .await
            .unwrap();

        let mut tx = codec();
        let mut rx = codec();
        link.send(tx.encode_datagram(&Message::Ping).unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(rx.decode_datagram(&buf[..len]).unwrap(), Message::Ping);

        let mut reply = codec();
        server
            .send_to(&reply.encode_datagram(&Message::Ping).unwrap(), from)
            .await
            .unwrap();
        let mut inbound = codec();
        assert_eq!(
            read_datagram(&link, &mut inbound).await.unwrap(),
            Message::Ping
        );

        link.close();
        assert!(matches!(
            link.recv().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
