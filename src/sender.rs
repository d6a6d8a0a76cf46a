use std::net::SocketAddr;
use std::sync::Arc;
use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use crate::completion::CompletionTracker;
use crate::config::{SenderConfig, SessionConfig};
use crate::packet_cache::PacketCache;
use crate::retransmit::{retransmit_queue, RetransmitCounters, RetransmitRequest, RetransmitRequester};
use crate::send_socket::SendSocket;
use crate::seq_nr::SeqNr;
use crate::wire::{DataPacket, WireMessage, MAX_DATAGRAM_LEN};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SenderReport {
    pub emitted: u64,
    pub retransmitted: u64,
    /// retransmissions that failed at the socket
    pub retransmit_failed: u64,
    /// NACKs for packets that were never emitted or are no longer cached
    pub not_retransmittable: u64,
    pub completed_receivers: usize,
    pub expected_receivers: usize,
    pub timed_out: bool,
}

/// The sending side of a session. It emits packets `1..=total_packets` at a fixed pace to every
///  destination, and concurrently serves NACKs and completion signals arriving on the same socket.
pub struct Sender {
    session: Arc<SessionConfig>,
    destinations: Vec<SocketAddr>,
    receive_socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    cache: Arc<PacketCache>,
    completion: Arc<CompletionTracker>,
}

impl Sender {
    pub async fn bind(session: Arc<SessionConfig>, config: &SenderConfig) -> anyhow::Result<Sender> {
        session.validate()?;
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!("sender bound to {:?}", socket.local_addr()?);

        Ok(Sender::new(
            session,
            config.destinations.clone(),
            config.effective_expected_receivers(),
            socket.clone(),
            Arc::new(socket),
        ))
    }

    /// NB: control messages are read from `receive_socket`, so `send_socket` should send from the
    ///  same local address for NACKs to find their way back
    pub fn new(
        session: Arc<SessionConfig>,
        destinations: Vec<SocketAddr>,
        expected_receivers: usize,
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
    ) -> Sender {
        let cache = Arc::new(PacketCache::new(session.retention_window));
        Sender {
            session,
            destinations,
            receive_socket,
            send_socket,
            cache,
            completion: Arc::new(CompletionTracker::new(expected_receivers)),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.receive_socket.local_addr()?)
    }

    /// Runs the session to its end, i.e. until all receivers signalled completion or the
    ///  session timed out. Both are regular outcomes.
    ///
    /// The timeout only covers waiting for completion: it starts after the last packet was
    ///  emitted and does not bound the emission itself.
    pub async fn run(self) -> anyhow::Result<SenderReport> {
        let (requester, dispatcher) = retransmit_queue(
            self.session.retransmit_queue_capacity,
            self.cache.clone(),
            self.send_socket.clone(),
        );
        let counters = dispatcher.counters();

        let listener = ControlListener {
            socket: self.receive_socket.clone(),
            cache: self.cache.clone(),
            requester,
            completion: self.completion.clone(),
            counters: counters.clone(),
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(dispatcher.run());
        tasks.spawn(listener.recv_loop());

        let emitted = self.emit_all().await;
        info!("emitted all {} packets - waiting for {} receiver(s) to complete", emitted, self.completion.expected());

        let timed_out = match time::timeout(self.session.sender_session_timeout, self.completion.wait_all()).await {
            Ok(()) => {
                info!("all receivers completed - lingering for {:?}", self.session.completion_linger);
                time::sleep(self.session.completion_linger).await;
                false
            }
            Err(_) => {
                warn!("session timed out with {}/{} receivers completed", self.completion.completed_count(), self.completion.expected());
                true
            }
        };

        tasks.shutdown().await;

        let report = SenderReport {
            emitted,
            retransmitted: counters.retransmitted(),
            retransmit_failed: counters.send_failed(),
            not_retransmittable: counters.not_found(),
            completed_receivers: self.completion.completed_count(),
            expected_receivers: self.completion.expected(),
            timed_out,
        };
        info!("sender finished: {:?}", report);
        Ok(report)
    }

    async fn emit_all(&self) -> u64 {
        let mut ticks = time::interval(self.session.send_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut emitted = 0;
        let mut seq = SeqNr::FIRST;
        while seq.to_raw() <= self.session.total_packets {
            ticks.tick().await;

            let packet = DataPacket::new(seq, Utc::now());
            // cache before sending: a NACK can never overtake the cache entry it refers to
            self.cache.insert(packet.clone()).await;

            for &destination in &self.destinations {
                trace!("sending packet #{} to {:?}", seq, destination);
                self.send_socket.do_send_packet(destination, packet.encoded()).await;
            }

            emitted += 1;
            if emitted % 1000 == 0 {
                info!("emitted {} of {} packets", emitted, self.session.total_packets);
            }
            seq = seq.next();
        }
        emitted
    }
}

struct ControlListener {
    socket: Arc<UdpSocket>,
    cache: Arc<PacketCache>,
    requester: RetransmitRequester,
    completion: Arc<CompletionTracker>,
    counters: Arc<RetransmitCounters>,
}

impl ControlListener {
    async fn recv_loop(self) {
        info!("starting control listener");

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            self.on_control_message(&buf[..num_read], from).await;
        }
    }

    async fn on_control_message(&self, buf: &[u8], from: SocketAddr) {
        match WireMessage::parse(buf) {
            Ok(WireMessage::Nack(seq)) => self.on_nack(seq, from).await,
            Ok(WireMessage::Fin) => {
                self.completion.on_fin(from);
            }
            Ok(WireMessage::Data(packet)) => {
                debug!("received data packet #{} from {:?} on the sender side - ignoring", packet.seq, from);
            }
            Ok(WireMessage::Legacy(text)) => {
                info!("received unstructured message from {:?}: {:?}", from, text);
            }
            Err(e) => {
                warn!("received unparsable message from {:?} - dropping: {}", from, e);
            }
        }
    }

    async fn on_nack(&self, seq: SeqNr, from: SocketAddr) {
        debug!("received NACK for #{} from {:?}", seq, from);

        match self.cache.high_water_mark() {
            Some(hwm) if seq <= hwm => {
                self.requester.request(RetransmitRequest { seq, requester: from }).await;
            }
            _ => {
                self.counters.on_not_found();
                warn!("NACK for #{} from {:?}: packet was never emitted - not retransmittable", seq, from);
            }
        }
    }
}
