use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{trace, warn};
use crate::seq_nr::SeqNr;
use crate::wire::DataPacket;

/// Every packet the sender emitted, keyed by sequence number, so it can be re-sent on request.
///
/// There is a single writer (the emission loop) inserting strictly increasing sequence numbers,
///  and a reader (the retransmit dispatcher) looking up arbitrary numbers concurrently. One
///  read/write lock around the whole map is sufficient for that access pattern.
///
/// An entry never changes once it is inserted. Without a retention window, entries are kept
///  until the cache is dropped at the end of the session; with a retention window of N, inserting
///  packet `s` evicts packet `s - N`.
pub struct PacketCache {
    packets: RwLock<FxHashMap<SeqNr, DataPacket>>,
    retention_window: Option<u64>,
    /// raw value of the highest inserted sequence number, 0 if empty - readable without locking
    high_water_mark: AtomicU64,
}

impl PacketCache {
    pub fn new(retention_window: Option<u64>) -> PacketCache {
        PacketCache {
            packets: Default::default(),
            retention_window,
            high_water_mark: AtomicU64::new(0),
        }
    }

    pub async fn insert(&self, packet: DataPacket) {
        let seq = packet.seq;
        let mut packets = self.packets.write().await;

        match packets.entry(seq) {
            Entry::Occupied(_) => {
                warn!("packet #{} is already cached - keeping the original", seq);
                return;
            }
            Entry::Vacant(e) => {
                e.insert(packet);
            }
        }

        if let Some(evicted) = self.retention_window.and_then(|w| seq.checked_minus(w)) {
            if packets.remove(&evicted).is_some() {
                trace!("packet #{} moved out of the retention window", evicted);
            }
        }
        drop(packets);

        self.high_water_mark.fetch_max(seq.to_raw(), Ordering::AcqRel);
    }

    pub async fn get(&self, seq: SeqNr) -> Option<DataPacket> {
        self.packets.read().await
            .get(&seq)
            .cloned()
    }

    /// The highest sequence number that was inserted so far. This does not require the lock,
    ///  so it is suitable for quick plausibility checks.
    pub fn high_water_mark(&self) -> Option<SeqNr> {
        match self.high_water_mark.load(Ordering::Acquire) {
            0 => None,
            raw => Some(SeqNr::from_raw(raw)),
        }
    }

    pub async fn len(&self) -> usize {
        self.packets.read().await.len()
    }
}
