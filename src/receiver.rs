use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use crate::config::{ReceiverConfig, SessionConfig};
use crate::reorder_buffer::ReorderBuffer;
use crate::send_socket::{send_message, SendSocket};
use crate::seq_nr::SeqNr;
use crate::stats::{LatencyStats, ReceiverStats};
use crate::wire::{DataPacket, WireMessage, MAX_DATAGRAM_LEN};

/// A packet as it is handed to the application: in order, exactly once
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeliveredPacket {
    pub seq: SeqNr,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: DateTime<Utc>,
}
impl DeliveredPacket {
    /// `None` if the sender's clock is ahead of ours
    pub fn latency(&self) -> Option<Duration> {
        (self.delivered_at - self.sent_at).to_std().ok()
    }
}

/// Application code receiving the reassembled stream. Calls happen strictly in sequence number
///  order, and there are no concurrent calls.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketConsumer: Send + Sync + 'static {
    async fn on_packet(&self, packet: &DeliveredPacket);
}

/// Logs the first few packets and then every 1000th
pub struct LoggingConsumer;

#[async_trait]
impl PacketConsumer for LoggingConsumer {
    async fn on_packet(&self, packet: &DeliveredPacket) {
        let seq = packet.seq.to_raw();
        if seq > 10 && seq % 1000 != 0 {
            return;
        }

        match packet.latency() {
            Some(latency) => info!("processed packet #{} (sent at {}, latency {:?})", seq, packet.sent_at.to_rfc3339_opts(SecondsFormat::Micros, true), latency),
            None => info!("processed packet #{} (sent at {}, sender clock is ahead)", seq, packet.sent_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverReport {
    pub name: String,
    /// false if the receiver session timed out before all packets were delivered
    pub completed: bool,
    pub stats: ReceiverStats,
}

struct ReceiverState {
    buffer: ReorderBuffer,
    latency: LatencyStats,
    /// source of the most recent data packet
    last_source: Option<SocketAddr>,
}

impl ReceiverState {
    fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            counters: self.buffer.counters(),
            buffered: self.buffer.num_pending(),
            next_expected: self.buffer.expected().to_raw(),
            total_expected: self.buffer.total_expected(),
            latency_mean_millis: self.latency.mean_millis(),
            latency_std_dev_millis: self.latency.std_dev_millis(),
        }
    }
}

/// The receiving side of a session. A receiver runs three tasks: the receive loop feeding the
///  reorder buffer, a ticker re-sending overdue NACKs, and a ticker logging statistics. They
///  share the receiver state behind a single lock.
pub struct Receiver {
    inner: Arc<ReceiverInner>,
    socket: Arc<UdpSocket>,
    completed: watch::Receiver<bool>,
}

struct ReceiverInner {
    name: String,
    session: Arc<SessionConfig>,
    send_socket: Arc<dyn SendSocket>,
    /// if set, control messages go here rather than to the source of data packets
    sender_addr: Option<SocketAddr>,
    consumer: Arc<dyn PacketConsumer>,
    state: Mutex<ReceiverState>,
    completed: watch::Sender<bool>,
}

impl Receiver {
    pub async fn bind(session: Arc<SessionConfig>, config: &ReceiverConfig, consumer: Arc<dyn PacketConsumer>) -> anyhow::Result<Receiver> {
        session.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!("receiver {} bound to {:?}", config.name, socket.local_addr()?);

        Ok(Receiver::new(
            &config.name,
            session,
            socket.clone(),
            Arc::new(socket),
            config.sender_addr,
            consumer,
        ))
    }

    pub fn new(
        name: &str,
        session: Arc<SessionConfig>,
        socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
        sender_addr: Option<SocketAddr>,
        consumer: Arc<dyn PacketConsumer>,
    ) -> Receiver {
        let (completed_send, completed_recv) = watch::channel(false);
        let state = ReceiverState {
            buffer: ReorderBuffer::new(&session),
            latency: LatencyStats::default(),
            last_source: None,
        };

        Receiver {
            inner: Arc::new(ReceiverInner {
                name: name.to_string(),
                session,
                send_socket,
                sender_addr,
                consumer,
                state: Mutex::new(state),
                completed: completed_send,
            }),
            socket,
            completed: completed_recv,
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs until all packets were delivered or the receiver session timed out
    pub async fn run(mut self) -> anyhow::Result<ReceiverReport> {
        let span = info_span!("receiver", name = %self.inner.name);

        let mut tasks = JoinSet::new();
        tasks.spawn(self.inner.clone().recv_loop(self.socket.clone()).instrument(span.clone()));
        tasks.spawn(self.inner.clone().retry_loop().instrument(span.clone()));
        tasks.spawn(self.inner.clone().stats_loop().instrument(span.clone()));

        let session_timeout = self.inner.session.receiver_session_timeout;
        let completed = match time::timeout(session_timeout, self.completed.wait_for(|c| *c)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                span.in_scope(|| warn!("receiver session timed out after {:?}", session_timeout));
                false
            }
        };

        tasks.shutdown().await;

        let stats = self.inner.state.lock().await.stats();
        span.in_scope(|| info!("final statistics: {}", stats));

        Ok(ReceiverReport {
            name: self.inner.name.clone(),
            completed,
            stats,
        })
    }
}

impl ReceiverInner {
    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            self.on_datagram(&buf[..num_read], from).await;
        }
    }

    async fn on_datagram(&self, buf: &[u8], from: SocketAddr) {
        let packet = match WireMessage::parse(buf) {
            Ok(WireMessage::Data(packet)) => packet,
            Ok(WireMessage::Legacy(text)) => {
                info!("received unstructured message from {:?}: {:?}", from, text);
                return;
            }
            Ok(msg) => {
                debug!("received control message {:?} from {:?} on the receiver side - ignoring", msg, from);
                return;
            }
            Err(e) => {
                warn!("received unparsable message from {:?} - dropping: {}", from, e);
                return;
            }
        };

        self.on_data_packet(packet, from).await;
    }

    async fn on_data_packet(&self, packet: DataPacket, from: SocketAddr) {
        let delivered_at = Utc::now();

        let (outcome, control_destination) = {
            let mut state = self.state.lock().await;
            state.last_source = Some(from);

            let outcome = state.buffer.on_data(packet, Instant::now());
            for p in &outcome.delivered {
                if let Ok(latency) = (delivered_at - p.sent_at).to_std() {
                    state.latency.add_sample(latency);
                }
            }
            (outcome, self.control_destination(&state))
        };

        self.send_nacks(&outcome.nacks, control_destination).await;

        for p in outcome.delivered {
            self.consumer.on_packet(&DeliveredPacket {
                seq: p.seq,
                sent_at: p.sent_at,
                delivered_at,
            }).await;
        }

        if outcome.completed {
            info!("all {} packets delivered - signalling completion", self.session.total_packets);
            match control_destination {
                Some(to) => {
                    send_message(self.send_socket.as_ref(), to, &WireMessage::Fin).await;
                }
                None => warn!("no address to send FIN to"),
            }
            self.completed.send_replace(true);
        }
    }

    fn control_destination(&self, state: &ReceiverState) -> Option<SocketAddr> {
        self.sender_addr.or(state.last_source)
    }

    async fn send_nacks(&self, nacks: &[SeqNr], to: Option<SocketAddr>) {
        if nacks.is_empty() {
            return;
        }
        let Some(to) = to else {
            warn!("no address to send NACKs to - dropping NACKs for {:?}", nacks);
            return;
        };

        for &seq in nacks {
            send_message(self.send_socket.as_ref(), to, &WireMessage::Nack(seq)).await;
        }
    }

    async fn retry_loop(self: Arc<Self>) {
        let mut ticks = time::interval(self.session.nack_retry_tick);
        loop {
            ticks.tick().await;

            let (nacks, control_destination) = {
                let mut state = self.state.lock().await;
                if state.buffer.is_complete() {
                    break;
                }
                (state.buffer.due_nack_retries(Instant::now()), self.control_destination(&state))
            };
            self.send_nacks(&nacks, control_destination).await;
        }
        debug!("session complete - stopping NACK retries");
    }

    async fn stats_loop(self: Arc<Self>) {
        let mut ticks = time::interval(self.session.stats_interval);
        // the first tick completes immediately
        ticks.tick().await;
        loop {
            ticks.tick().await;
            let stats = self.state.lock().await.stats();
            info!("statistics: {}", stats);
        }
    }
}
