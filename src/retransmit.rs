use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use crate::packet_cache::PacketCache;
use crate::send_socket::SendSocket;
use crate::seq_nr::SeqNr;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetransmitRequest {
    pub seq: SeqNr,
    pub requester: SocketAddr,
}

#[derive(Debug, Default)]
pub struct RetransmitCounters {
    retransmitted: AtomicU64,
    send_failed: AtomicU64,
    not_found: AtomicU64,
}
impl RetransmitCounters {
    /// cached packets that were successfully re-sent
    pub fn retransmitted(&self) -> u64 {
        self.retransmitted.load(Ordering::Acquire)
    }

    /// cached packets whose re-send failed at the socket
    pub fn send_failed(&self) -> u64 {
        self.send_failed.load(Ordering::Acquire)
    }

    pub fn not_found(&self) -> u64 {
        self.not_found.load(Ordering::Acquire)
    }

    pub fn on_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::AcqRel);
    }
}

/// Creates the bounded queue that decouples the control listener from (potentially slow)
///  resend I/O.
pub fn retransmit_queue(
    capacity: usize,
    cache: Arc<PacketCache>,
    send_socket: Arc<dyn SendSocket>,
) -> (RetransmitRequester, RetransmitDispatcher) {
    let (send, recv) = mpsc::channel(capacity);
    let counters = Arc::new(RetransmitCounters::default());

    (
        RetransmitRequester { send, },
        RetransmitDispatcher {
            recv,
            cache,
            send_socket,
            counters,
        },
    )
}

/// The producing side of the retransmit queue, owned by the control listener
#[derive(Clone)]
pub struct RetransmitRequester {
    send: mpsc::Sender<RetransmitRequest>,
}
impl RetransmitRequester {
    /// Enqueues a request. If the queue is full, this waits until the dispatcher made room - this
    ///  is the back pressure that bounds memory usage during retransmission storms.
    pub async fn request(&self, request: RetransmitRequest) {
        if self.send.capacity() == 0 {
            debug!("retransmit queue is full - waiting for the dispatcher");
        }
        if self.send.send(request).await.is_err() {
            warn!("retransmit dispatcher is gone - dropping request for packet #{}", request.seq);
        }
    }
}

pub struct RetransmitDispatcher {
    recv: mpsc::Receiver<RetransmitRequest>,
    cache: Arc<PacketCache>,
    send_socket: Arc<dyn SendSocket>,
    counters: Arc<RetransmitCounters>,
}
impl RetransmitDispatcher {
    pub fn counters(&self) -> Arc<RetransmitCounters> {
        self.counters.clone()
    }

    /// Processes requests one at a time until all requesters are dropped. A request for a
    ///  packet that is not in the cache is logged and dropped: retrying is the receiver's job.
    pub async fn run(mut self) {
        debug!("starting retransmit dispatcher");

        while let Some(request) = self.recv.recv().await {
            self.dispatch(request).await;
        }

        debug!("retransmit queue closed - stopping dispatcher");
    }

    async fn dispatch(&self, request: RetransmitRequest) {
        match self.cache.get(request.seq).await {
            Some(packet) => {
                if self.send_socket.do_send_packet(request.requester, packet.encoded()).await {
                    self.counters.retransmitted.fetch_add(1, Ordering::AcqRel);
                    info!("retransmitted packet #{} to {:?}", request.seq, request.requester);
                }
                else {
                    self.counters.send_failed.fetch_add(1, Ordering::AcqRel);
                    warn!("retransmitting packet #{} to {:?} failed", request.seq, request.requester);
                }
            }
            None => {
                self.counters.on_not_found();
                warn!("packet #{} requested by {:?} is not in the cache - not retransmittable", request.seq, request.requester);
            }
        }
    }
}
