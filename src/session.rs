use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use crate::config::NackstreamConfig;
use crate::receiver::{LoggingConsumer, PacketConsumer, Receiver, ReceiverReport};
use crate::relay::{Relay, RelayReport};
use crate::sender::{Sender, SenderReport};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub sender: SenderReport,
    /// sorted by receiver name
    pub receivers: Vec<ReceiverReport>,
    /// (relay name, report), sorted by name
    pub relays: Vec<(String, RelayReport)>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        !self.sender.timed_out && self.receivers.iter().all(|r| r.completed)
    }
}

/// Runs a complete session in a single process: receivers, relays and the sender, wired
///  together as configured. Applications receive packets through [LoggingConsumer].
pub async fn run_local_session(config: &NackstreamConfig) -> anyhow::Result<SessionReport> {
    run_local_session_with(config, |_| Arc::new(LoggingConsumer) as Arc<dyn PacketConsumer>).await
}

/// Runs a complete session, passing each receiver's packets to the consumer created for it by
///  `consumer_for` (which is called with the receiver's name).
///
/// Receivers and relays are bound before the sender starts emitting. The session ends when the
///  sender is done and every receiver finished, either by completion or by its own timeout.
///  Relays are stopped after that.
pub async fn run_local_session_with(
    config: &NackstreamConfig,
    consumer_for: impl Fn(&str) -> Arc<dyn PacketConsumer>,
) -> anyhow::Result<SessionReport> {
    config.validate()?;
    let session = Arc::new(config.session.clone());

    let mut receivers = JoinSet::new();
    for receiver_config in &config.receivers {
        let receiver = Receiver::bind(session.clone(), receiver_config, consumer_for(&receiver_config.name)).await?;
        receivers.spawn(receiver.run());
    }

    let (stop_relays, stop_signal) = watch::channel(false);
    let mut relays = JoinSet::new();
    for relay_config in &config.relays {
        let name = relay_config.name.clone();
        let relay = Relay::bind(relay_config.clone(), session.stats_interval).await?;
        let mut stop_signal = stop_signal.clone();
        relays.spawn(async move {
            let report = relay.run(async move {
                let _ = stop_signal.wait_for(|stop| *stop).await;
            }).await;
            (name, report)
        });
    }

    let sender = Sender::bind(session.clone(), &config.sender).await?;
    let sender_report = sender.run().await?;

    let mut receiver_reports = Vec::new();
    while let Some(report) = receivers.join_next().await {
        receiver_reports.push(report??);
    }
    receiver_reports.sort_by(|a, b| a.name.cmp(&b.name));

    stop_relays.send_replace(true);
    let mut relay_reports = Vec::new();
    while let Some(report) = relays.join_next().await {
        relay_reports.push(report?);
    }
    relay_reports.sort_by(|a, b| a.0.cmp(&b.0));

    let report = SessionReport {
        sender: sender_report,
        receivers: receiver_reports,
        relays: relay_reports,
    };
    if report.is_success() {
        info!("session completed successfully");
    }
    else {
        warn!("session ended without full delivery");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReceiverConfig, RelayConfig, SenderConfig, SessionConfig};
    use crate::receiver::DeliveredPacket;
    use async_trait::async_trait;
    use rustc_hash::FxHashMap;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingConsumer {
        delivered: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl PacketConsumer for RecordingConsumer {
        async fn on_packet(&self, packet: &DeliveredPacket) {
            self.delivered.lock().unwrap().push(packet.seq.to_raw());
        }
    }

    /// distinct addresses that are currently unused
    fn free_addrs<const N: usize>() -> [SocketAddr; N] {
        let sockets: [std::net::UdpSocket; N] = std::array::from_fn(|_| std::net::UdpSocket::bind("127.0.0.1:0").unwrap());
        sockets.map(|s| s.local_addr().unwrap())
    }

    fn relay(name: &str, listen_addr: SocketAddr, forward_to: SocketAddr, drop_probability: f64, delay_probability: f64, seed: u64) -> RelayConfig {
        RelayConfig {
            name: name.to_string(),
            listen_addr,
            forward_to,
            drop_probability,
            delay_probability,
            delay: Duration::from_millis(15),
            seed: Some(seed),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_local_session_over_lossy_relays() {
        const TOTAL: u64 = 200;

        let [r1_addr, r2_addr, lossy_addr, delaying_addr] = free_addrs();
        let r1 = ReceiverConfig::new("r1", r1_addr);
        let r2 = ReceiverConfig::new("r2", r2_addr);
        let lossy = relay("lossy", lossy_addr, r1_addr, 0.2, 0.0, 1);
        let delaying = relay("delaying", delaying_addr, r2_addr, 0.0, 0.3, 2);

        let config = NackstreamConfig {
            session: SessionConfig {
                total_packets: TOTAL,
                send_interval: Duration::from_millis(1),
                nack_retry_interval: Duration::from_millis(30),
                nack_retry_tick: Duration::from_millis(10),
                tail_probe_after: Duration::from_millis(200),
                sender_session_timeout: Duration::from_secs(20),
                receiver_session_timeout: Duration::from_secs(20),
                completion_linger: Duration::from_millis(50),
                ..SessionConfig::default()
            },
            sender: SenderConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                destinations: vec![lossy.listen_addr, delaying.listen_addr],
                expected_receivers: None,
            },
            receivers: vec![r1, r2],
            relays: vec![lossy, delaying],
        };

        let consumers: Arc<Mutex<FxHashMap<String, Arc<RecordingConsumer>>>> = Default::default();
        let report = {
            let consumers = consumers.clone();
            run_local_session_with(&config, move |name| {
                let consumer = Arc::new(RecordingConsumer { delivered: Default::default() });
                consumers.lock().unwrap().insert(name.to_string(), consumer.clone());
                consumer as Arc<dyn PacketConsumer>
            }).await.unwrap()
        };

        assert!(report.is_success(), "{:?}", report);
        assert_eq!(report.sender.emitted, TOTAL);
        assert_eq!(report.sender.completed_receivers, 2);
        assert!(report.sender.retransmitted > 0);

        assert_eq!(report.receivers.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["r1", "r2"]);
        for receiver in &report.receivers {
            assert_eq!(receiver.stats.counters.processed, TOTAL);
        }

        let relays = report.relays.iter().cloned().collect::<FxHashMap<_, _>>();
        assert!(relays["lossy"].dropped > 0);
        assert_eq!(relays["lossy"].delayed, 0);
        assert!(relays["delaying"].delayed > 0);
        assert_eq!(relays["delaying"].dropped, 0);

        for consumer in consumers.lock().unwrap().values() {
            assert_eq!(*consumer.delivered.lock().unwrap(), (1..=TOTAL).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = NackstreamConfig {
            session: SessionConfig {
                total_packets: 0,
                ..SessionConfig::default()
            },
            ..NackstreamConfig::default()
        };
        assert!(run_local_session(&config).await.is_err());
    }
}
