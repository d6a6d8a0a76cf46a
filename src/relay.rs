use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, trace, warn};
use crate::config::RelayConfig;
use crate::send_socket::SendSocket;
use crate::wire::{WireMessage, MAX_DATAGRAM_LEN};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Fate {
    Drop,
    Delay,
    Forward,
}

/// Decides what happens to a data datagram: dropped, delayed or forwarded right away
struct LossModel {
    rng: StdRng,
    drop_probability: f64,
    delay_probability: f64,
}
impl LossModel {
    fn new(config: &RelayConfig) -> LossModel {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        LossModel {
            rng,
            drop_probability: config.drop_probability,
            delay_probability: config.delay_probability,
        }
    }

    fn decide(&mut self) -> Fate {
        if self.rng.gen_bool(self.drop_probability) {
            Fate::Drop
        }
        else if self.rng.gen_bool(self.delay_probability) {
            Fate::Delay
        }
        else {
            Fate::Forward
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RelayReport {
    pub received: u64,
    /// non-control datagrams passed on without delay, in either direction
    pub forwarded: u64,
    pub dropped: u64,
    pub delayed: u64,
    /// NACK and FIN in either direction, never subject to loss or delay
    pub control_forwarded: u64,
}

/// A UDP relay between a sender and one receiver that simulates an unreliable network for data
///  packets. Control messages pass through unchanged.
///
/// Datagrams from `forward_to` travel upstream to whoever most recently sent data through the
///  relay; everything else is considered upstream traffic and is forwarded to `forward_to`.
pub struct Relay {
    config: RelayConfig,
    socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    stats_interval: Duration,
}

impl Relay {
    pub async fn bind(config: RelayConfig, stats_interval: Duration) -> anyhow::Result<Relay> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.listen_addr).await?);
        info!("relay {} bound to {:?}, forwarding to {:?} (drop {:.1}%, delay {:.1}% by {:?})",
            config.name,
            socket.local_addr()?,
            config.forward_to,
            config.drop_probability * 100.0,
            config.delay_probability * 100.0,
            config.delay,
        );

        Ok(Relay {
            config,
            send_socket: Arc::new(socket.clone()),
            socket,
            stats_interval,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Relays datagrams until `stop` completes. Delayed packets that are still in flight at that
    ///  point are discarded.
    pub async fn run(self, stop: impl Future<Output = ()>) -> RelayReport {
        tokio::pin!(stop);

        let mut loss_model = LossModel::new(&self.config);
        let mut report = RelayReport::default();
        let mut upstream: Option<SocketAddr> = None;
        let mut delayed = JoinSet::new();

        let mut stats_ticks = time::interval(self.stats_interval);
        stats_ticks.tick().await;

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            select! {
                _ = &mut stop => break,
                _ = stats_ticks.tick() => {
                    info!("relay {}: {:?}", self.config.name, report);
                }
                Some(_) = delayed.join_next(), if !delayed.is_empty() => {}
                r = self.socket.recv_from(&mut buf) => {
                    let (num_read, from) = match r {
                        Ok(x) => x,
                        Err(e) => {
                            error!("relay {}: socket error: {}", self.config.name, e);
                            continue;
                        }
                    };
                    report.received += 1;
                    let datagram = &buf[..num_read];

                    if from == self.config.forward_to {
                        self.forward_upstream(datagram, upstream, &mut report).await;
                        continue;
                    }

                    upstream = Some(from);
                    let is_control = WireMessage::parse(datagram)
                        .map(|msg| msg.is_control())
                        .unwrap_or(false);
                    if is_control {
                        trace!("relay {}: forwarding control message downstream", self.config.name);
                        self.send_socket.do_send_packet(self.config.forward_to, datagram).await;
                        report.control_forwarded += 1;
                        continue;
                    }

                    match loss_model.decide() {
                        Fate::Drop => {
                            debug!("relay {}: dropping {:?}", self.config.name, String::from_utf8_lossy(datagram));
                            report.dropped += 1;
                        }
                        Fate::Delay => {
                            debug!("relay {}: delaying {:?} by {:?}", self.config.name, String::from_utf8_lossy(datagram), self.config.delay);
                            report.delayed += 1;

                            let send_socket = self.send_socket.clone();
                            let to = self.config.forward_to;
                            let delay = self.config.delay;
                            let datagram = datagram.to_vec();
                            delayed.spawn(async move {
                                time::sleep(delay).await;
                                send_socket.do_send_packet(to, &datagram).await;
                            });
                        }
                        Fate::Forward => {
                            self.send_socket.do_send_packet(self.config.forward_to, datagram).await;
                            report.forwarded += 1;
                        }
                    }
                }
            }
        }

        delayed.shutdown().await;
        info!("relay {} stopped: {:?}", self.config.name, report);
        report
    }

    async fn forward_upstream(&self, datagram: &[u8], upstream: Option<SocketAddr>, report: &mut RelayReport) {
        match upstream {
            Some(to) => {
                trace!("relay {}: forwarding {:?} upstream to {:?}", self.config.name, String::from_utf8_lossy(datagram), to);
                self.send_socket.do_send_packet(to, datagram).await;

                let is_control = WireMessage::parse(datagram)
                    .map(|msg| msg.is_control())
                    .unwrap_or(false);
                if is_control {
                    report.control_forwarded += 1;
                }
                else {
                    report.forwarded += 1;
                }
            }
            None => {
                warn!("relay {}: received {:?} from downstream before any upstream traffic - dropping", self.config.name, String::from_utf8_lossy(datagram));
            }
        }
    }
}
