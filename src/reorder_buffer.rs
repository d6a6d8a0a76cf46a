use std::collections::BTreeMap;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::SessionConfig;
use crate::seq_nr::SeqNr;
use crate::stats::ReorderCounters;
use crate::wire::DataPacket;

#[derive(Debug, Clone, Copy)]
struct NackState {
    last_sent: Instant,
    retries: u32,
}

/// The effects of a single data packet arriving
#[derive(Debug, Default)]
pub struct ArrivalOutcome {
    /// packets that became deliverable, in delivery order
    pub delivered: Vec<DataPacket>,
    /// sequence numbers to send a NACK for
    pub nacks: Vec<SeqNr>,
    /// true exactly once per buffer: when the last missing packet was delivered
    pub completed: bool,
}

/// The receiver side's core state machine, restoring the sender's order from whatever
///  arrives. It does no I/O and reads no clock, so callers pass in the current time and act on
///  the returned outcomes.
///
/// Per sequence number, a packet moves from 'unseen' to 'buffered' to 'delivered', or directly from
///  'unseen' to 'delivered' if it arrives in order. Orthogonal to that, a missing number is
///  'requested' once a NACK was sent for it.
///
/// The buffer is complete once all `total_expected` packets were delivered. After that, everything
///  is ignored.
pub struct ReorderBuffer {
    expected: SeqNr,
    total_expected: u64,
    /// only numbers greater than `expected`
    pending: BTreeMap<SeqNr, DataPacket>,
    nack_state: FxHashMap<SeqNr, NackState>,
    highest_seen: Option<SeqNr>,
    last_arrival: Option<Instant>,
    completed: bool,
    counters: ReorderCounters,

    retry_interval: Duration,
    retry_window: u64,
    stuck_gap_threshold: u32,
    tail_probe_after: Duration,
}

impl ReorderBuffer {
    pub fn new(config: &SessionConfig) -> ReorderBuffer {
        ReorderBuffer {
            expected: SeqNr::FIRST,
            total_expected: config.total_packets,
            pending: Default::default(),
            nack_state: Default::default(),
            highest_seen: None,
            last_arrival: None,
            completed: false,
            counters: Default::default(),
            retry_interval: config.nack_retry_interval,
            retry_window: config.nack_retry_window,
            stuck_gap_threshold: config.stuck_gap_threshold,
            tail_probe_after: config.tail_probe_after,
        }
    }

    pub fn expected(&self) -> SeqNr {
        self.expected
    }

    pub fn total_expected(&self) -> u64 {
        self.total_expected
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn counters(&self) -> ReorderCounters {
        self.counters
    }

    pub fn on_data(&mut self, packet: DataPacket, now: Instant) -> ArrivalOutcome {
        let seq = packet.seq;
        let mut outcome = ArrivalOutcome::default();

        self.counters.received += 1;

        if self.completed {
            debug!("received packet #{} after completion - ignoring", seq);
            self.counters.duplicates += 1;
            return outcome;
        }
        if seq.to_raw() > self.total_expected {
            warn!("received packet #{} but the session has only {} packets - ignoring", seq, self.total_expected);
            return outcome;
        }

        self.last_arrival = Some(now);
        if self.highest_seen.map_or(true, |h| h < seq) {
            self.highest_seen = Some(seq);
        }

        if seq < self.expected {
            debug!("received duplicate of already delivered packet #{} - ignoring", seq);
            self.counters.duplicates += 1;
        }
        else if seq == self.expected {
            self.nack_state.remove(&seq);
            self.deliver(packet, &mut outcome);
            self.drain_pending(&mut outcome);
            self.check_completion(&mut outcome);
        }
        else {
            self.nack_state.remove(&seq);
            if self.pending.insert(seq, packet).is_some() {
                debug!("received duplicate of buffered packet #{}", seq);
                self.counters.duplicates += 1;
            }
            else {
                trace!("buffering packet #{} while waiting for #{}", seq, self.expected);
            }

            for missing in self.expected.to(seq) {
                if self.pending.contains_key(&missing) || self.nack_state.contains_key(&missing) {
                    continue;
                }
                self.nack_state.insert(missing, NackState { last_sent: now, retries: 0 });
                self.counters.lost_detected += 1;
                self.counters.nacks_sent += 1;
                outcome.nacks.push(missing);
            }
            if !outcome.nacks.is_empty() {
                debug!("detected gap before #{}: NACK'ing {:?}", seq, outcome.nacks);
            }
        }

        outcome
    }

    fn deliver(&mut self, packet: DataPacket, outcome: &mut ArrivalOutcome) {
        debug_assert_eq!(packet.seq, self.expected);
        self.expected = self.expected.next();
        self.counters.processed += 1;
        outcome.delivered.push(packet);
    }

    fn drain_pending(&mut self, outcome: &mut ArrivalOutcome) {
        while let Some(packet) = self.pending.remove(&self.expected) {
            self.deliver(packet, outcome);
        }
    }

    fn check_completion(&mut self, outcome: &mut ArrivalOutcome) {
        if self.counters.processed == self.total_expected {
            debug!("all {} packets delivered", self.total_expected);
            self.completed = true;
            self.nack_state.clear();
            outcome.completed = true;
        }
    }

    /// Collects the NACKs that are due at `now`: retries for requested numbers near the delivery
    ///  frontier, and a probe for the tail of the session if no data arrived for a while.
    pub fn due_nack_retries(&mut self, now: Instant) -> Vec<SeqNr> {
        let mut result = Vec::new();
        if self.completed {
            return result;
        }

        let window_end = self.window_end();

        for seq in self.expected.to(window_end) {
            if self.pending.contains_key(&seq) {
                continue;
            }
            let Some(state) = self.nack_state.get_mut(&seq) else {
                continue;
            };
            if now.saturating_duration_since(state.last_sent) < self.retry_interval {
                continue;
            }

            state.last_sent = now;
            state.retries += 1;
            self.counters.nacks_sent += 1;
            result.push(seq);

            if state.retries == self.stuck_gap_threshold {
                warn!("stuck gap: packet #{} is still missing after {} NACK retries", seq, state.retries);
            }
        }

        self.probe_tail(now, window_end, &mut result);

        if !result.is_empty() {
            debug!("re-sending NACKs for {:?}", result);
        }
        result
    }

    /// Packets after the highest received one cause no gap on arrival of a later packet, so if
    ///  the end of the session is lost nothing else would ever NACK them.
    fn probe_tail(&mut self, now: Instant, window_end: SeqNr, result: &mut Vec<SeqNr>) {
        let (Some(highest_seen), Some(last_arrival)) = (self.highest_seen, self.last_arrival) else {
            return;
        };
        if now.saturating_duration_since(last_arrival) < self.tail_probe_after {
            return;
        }

        let start = std::cmp::max(self.expected, highest_seen.next());
        for seq in start.to(window_end) {
            if self.nack_state.contains_key(&seq) {
                continue;
            }
            self.nack_state.insert(seq, NackState { last_sent: now, retries: 0 });
            self.counters.lost_detected += 1;
            self.counters.nacks_sent += 1;
            result.push(seq);
        }
    }

    /// exclusive end of the range eligible for NACK retries
    fn window_end(&self) -> SeqNr {
        let end = self.expected.to_raw()
            .saturating_add(self.retry_window)
            .min(self.total_expected.saturating_add(1));
        SeqNr::from_raw(end.max(self.expected.to_raw()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rand::prelude::*;
    use rand::rngs::StdRng;
    use rstest::rstest;

    fn config(total_packets: u64) -> SessionConfig {
        SessionConfig {
            total_packets,
            nack_retry_interval: Duration::from_millis(500),
            nack_retry_window: 100,
            stuck_gap_threshold: 3,
            tail_probe_after: Duration::from_secs(2),
            ..SessionConfig::default()
        }
    }

    fn packet(seq: u64) -> DataPacket {
        DataPacket::new(SeqNr::from_raw(seq), Utc.timestamp_opt(1_700_000_000, seq as u32).unwrap())
    }

    fn seqs(raw: &[u64]) -> Vec<SeqNr> {
        raw.iter().map(|&s| SeqNr::from_raw(s)).collect()
    }

    fn delivered(outcome: &ArrivalOutcome) -> Vec<u64> {
        outcome.delivered.iter().map(|p| p.seq.to_raw()).collect()
    }

    #[test]
    fn test_single_gap_scenario() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(&config(5));

        let o = buffer.on_data(packet(1), now);
        assert_eq!(delivered(&o), vec![1]);
        let o = buffer.on_data(packet(2), now);
        assert_eq!(delivered(&o), vec![2]);

        let o = buffer.on_data(packet(4), now);
        assert!(o.delivered.is_empty());
        assert_eq!(o.nacks, seqs(&[3]));

        let o = buffer.on_data(packet(5), now);
        assert!(o.delivered.is_empty());
        assert!(o.nacks.is_empty(), "#3 was NACK'ed already");
        assert_eq!(buffer.num_pending(), 2);
        assert!(!buffer.is_complete());

        let o = buffer.on_data(packet(3), now);
        assert_eq!(delivered(&o), vec![3, 4, 5]);
        assert!(o.completed);
        assert!(buffer.is_complete());
        assert_eq!(buffer.num_pending(), 0);

        assert_eq!(buffer.counters(), ReorderCounters {
            received: 5,
            processed: 5,
            duplicates: 0,
            lost_detected: 1,
            nacks_sent: 1,
        });
    }

    #[test]
    fn test_duplicate_of_delivered_packet() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(&config(5));

        assert_eq!(delivered(&buffer.on_data(packet(1), now)), vec![1]);

        let o = buffer.on_data(packet(1), now);
        assert!(o.delivered.is_empty());
        assert!(o.nacks.is_empty());
        assert_eq!(buffer.expected(), SeqNr::from_raw(2));
        assert_eq!(buffer.num_pending(), 0);

        assert_eq!(delivered(&buffer.on_data(packet(2), now)), vec![2]);
        assert_eq!(buffer.counters().processed, 2);
        assert_eq!(buffer.counters().duplicates, 1);
    }

    #[test]
    fn test_duplicate_of_buffered_packet_is_not_double_counted() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(&config(3));

        buffer.on_data(packet(3), now);
        let o = buffer.on_data(packet(3), now);
        assert!(o.nacks.is_empty());
        assert_eq!(buffer.num_pending(), 1);

        let o = buffer.on_data(packet(1), now);
        assert_eq!(delivered(&o), vec![1]);
        let o = buffer.on_data(packet(2), now);
        assert_eq!(delivered(&o), vec![2, 3]);
        assert!(o.completed);
        assert_eq!(buffer.counters().processed, 3);
    }

    #[test]
    fn test_completion_exactly_once() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(&config(2));

        assert!(!buffer.on_data(packet(1), now).completed);
        assert!(buffer.on_data(packet(2), now).completed);

        for seq in [1, 2, 2] {
            let o = buffer.on_data(packet(seq), now);
            assert!(!o.completed);
            assert!(o.delivered.is_empty());
        }
        assert!(buffer.due_nack_retries(now + Duration::from_secs(100)).is_empty());
        assert_eq!(buffer.counters().processed, 2);
    }

    #[test]
    fn test_packet_beyond_session_is_ignored() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(&config(3));

        let o = buffer.on_data(packet(4), now);
        assert!(o.nacks.is_empty());
        assert_eq!(buffer.num_pending(), 0);
    }

    #[test]
    fn test_gap_nacks_every_missing_number_once() {
        let now = Instant::now();
        let mut buffer = ReorderBuffer::new(&config(10));

        assert_eq!(buffer.on_data(packet(4), now).nacks, seqs(&[1, 2, 3]));
        assert_eq!(buffer.on_data(packet(7), now).nacks, seqs(&[5, 6]));
        assert!(buffer.on_data(packet(6), now).nacks.is_empty());
        assert_eq!(buffer.on_data(packet(9), now).nacks, seqs(&[8]));
        assert_eq!(buffer.counters().lost_detected, 6);
    }

    #[rstest]
    #[case::too_early(Duration::from_millis(499), vec![])]
    #[case::exactly_interval(Duration::from_millis(500), vec![2, 3])]
    #[case::later(Duration::from_millis(900), vec![2, 3])]
    fn test_retry_pacing(#[case] elapsed: Duration, #[case] expected: Vec<u64>) {
        let start = Instant::now();
        let mut buffer = ReorderBuffer::new(&config(10));
        buffer.on_data(packet(1), start);
        buffer.on_data(packet(4), start);

        assert_eq!(buffer.due_nack_retries(start + elapsed), seqs(&expected));
    }

    #[test]
    fn test_retries_are_never_closer_than_interval() {
        let start = Instant::now();
        let mut buffer = ReorderBuffer::new(&SessionConfig {
            tail_probe_after: Duration::from_secs(3600),
            ..config(10)
        });
        buffer.on_data(packet(2), start);

        let mut last_nack = start;
        for tick in 1..=40 {
            let now = start + Duration::from_millis(100 * tick);
            if !buffer.due_nack_retries(now).is_empty() {
                assert!(now - last_nack >= Duration::from_millis(500));
                last_nack = now;
            }
        }
        assert_eq!(buffer.counters().nacks_sent, 1 + 8);
    }

    #[test]
    fn test_retry_skips_arrived_packets() {
        let start = Instant::now();
        let mut buffer = ReorderBuffer::new(&config(10));
        buffer.on_data(packet(5), start);

        buffer.on_data(packet(3), start + Duration::from_millis(100));
        buffer.on_data(packet(1), start + Duration::from_millis(100));

        assert_eq!(buffer.due_nack_retries(start + Duration::from_millis(600)), seqs(&[2, 4]));
    }

    #[test]
    fn test_retry_window() {
        let start = Instant::now();
        let mut buffer = ReorderBuffer::new(&SessionConfig {
            nack_retry_window: 3,
            ..config(20)
        });

        buffer.on_data(packet(1), start);
        buffer.on_data(packet(8), start);

        // initial NACKs are not limited by the window, retries are
        let now = start + Duration::from_millis(500);
        assert_eq!(buffer.due_nack_retries(now), seqs(&[2, 3, 4]));

        buffer.on_data(packet(2), now);
        buffer.on_data(packet(3), now);
        let now = now + Duration::from_millis(500);
        assert_eq!(buffer.due_nack_retries(now), seqs(&[4, 5, 6]));
    }

    #[test]
    fn test_retries_continue_beyond_stuck_gap_threshold() {
        let start = Instant::now();
        let mut buffer = ReorderBuffer::new(&config(3));
        buffer.on_data(packet(1), start);
        buffer.on_data(packet(3), start);

        for i in 1..=5 {
            let now = start + Duration::from_millis(500 * i);
            assert_eq!(buffer.due_nack_retries(now), seqs(&[2]));
        }

        let o = buffer.on_data(packet(2), start + Duration::from_secs(3));
        assert!(o.completed);
    }

    #[test]
    fn test_tail_probe() {
        let start = Instant::now();
        let mut buffer = ReorderBuffer::new(&config(6));

        // no probing before the first packet arrived
        assert!(buffer.due_nack_retries(start + Duration::from_secs(10)).is_empty());

        buffer.on_data(packet(1), start);
        buffer.on_data(packet(2), start);
        buffer.on_data(packet(3), start);
        assert!(buffer.due_nack_retries(start + Duration::from_millis(1999)).is_empty());

        let now = start + Duration::from_secs(2);
        assert_eq!(buffer.due_nack_retries(now), seqs(&[4, 5, 6]));
        assert!(buffer.due_nack_retries(now + Duration::from_millis(100)).is_empty());

        // regular retries take over for the probed numbers
        assert_eq!(buffer.due_nack_retries(now + Duration::from_millis(500)), seqs(&[4, 5, 6]));

        let o = buffer.on_data(packet(5), now + Duration::from_millis(600));
        assert!(o.nacks.is_empty());
        assert_eq!(buffer.counters().lost_detected, 3);
    }

    #[test]
    fn test_tail_probe_starts_after_highest_seen() {
        let start = Instant::now();
        let mut buffer = ReorderBuffer::new(&config(8));
        buffer.on_data(packet(1), start);
        buffer.on_data(packet(4), start);

        let now = start + Duration::from_secs(2);
        assert_eq!(buffer.due_nack_retries(now), seqs(&[2, 3, 5, 6, 7, 8]));
    }

    /// Feeds a shuffled stream with duplicates and losses. Lost packets are redelivered when
    ///  they are NACK'ed, like a sender would.
    #[rstest]
    #[case::seed_1(1)]
    #[case::seed_2(2)]
    #[case::seed_3(3)]
    #[case::seed_4(4)]
    #[case::seed_5(5)]
    fn test_delivers_exactly_once_in_order(#[case] seed: u64) {
        const TOTAL: u64 = 300;
        let mut rng = StdRng::seed_from_u64(seed);

        let mut arrivals = Vec::new();
        for seq in 1..=TOTAL {
            if rng.gen_bool(0.15) {
                continue;
            }
            arrivals.push(seq);
            if rng.gen_bool(0.1) {
                arrivals.push(seq);
            }
        }
        arrivals.shuffle(&mut rng);

        let mut buffer = ReorderBuffer::new(&config(TOTAL));
        let mut now = Instant::now();
        let mut delivered_seqs = Vec::new();
        let mut completions = 0;

        let mut queue: std::collections::VecDeque<u64> = arrivals.into();
        loop {
            let Some(seq) = queue.pop_front() else {
                now += Duration::from_secs(3);
                let retries = buffer.due_nack_retries(now);
                if retries.is_empty() {
                    break;
                }
                queue.extend(retries.iter().map(|s| s.to_raw()));
                continue;
            };

            now += Duration::from_millis(1);
            let outcome = buffer.on_data(packet(seq), now);
            delivered_seqs.extend(outcome.delivered.iter().map(|p| p.seq.to_raw()));
            if outcome.completed {
                completions += 1;
            }
            queue.extend(outcome.nacks.iter().map(|s| s.to_raw()));
        }

        assert_eq!(delivered_seqs, (1..=TOTAL).collect::<Vec<_>>());
        assert_eq!(completions, 1);
        assert!(buffer.is_complete());
    }
}
