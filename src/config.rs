use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context};
use serde::{Deserialize, Deserializer};
use tracing::debug;

/// Parameters of a session that sender and receivers agree on out of band.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// The number of packets in the session. Receivers use this to detect completion.
    pub total_packets: u64,

    #[serde(rename = "send_interval_ms", deserialize_with = "millis")]
    pub send_interval: Duration,

    /// minimum time between two NACKs for the same sequence number
    #[serde(rename = "nack_retry_interval_ms", deserialize_with = "millis")]
    pub nack_retry_interval: Duration,
    /// how often the receiver checks for NACKs that are due for a retry
    #[serde(rename = "nack_retry_tick_ms", deserialize_with = "millis")]
    pub nack_retry_tick: Duration,
    /// Retries are limited to this many sequence numbers after the next expected one. Gaps
    ///  further ahead are retried once the delivery frontier moves closer.
    pub nack_retry_window: u64,
    /// number of retries for a single missing packet after which a 'stuck gap' warning is logged
    pub stuck_gap_threshold: u32,
    /// If no data arrived for this long and the session is not complete, the packets after the
    ///  highest received one are assumed lost and NACK'ed.
    #[serde(rename = "tail_probe_after_ms", deserialize_with = "millis")]
    pub tail_probe_after: Duration,

    #[serde(rename = "stats_interval_ms", deserialize_with = "millis")]
    pub stats_interval: Duration,

    /// Upper bound for the time the sender waits for completion signals. This clock starts when
    ///  the last packet was emitted, so the sender's total run time is the emission time
    ///  (`total_packets * send_interval`) plus at most this timeout plus `completion_linger`.
    #[serde(rename = "sender_session_timeout_ms", deserialize_with = "millis")]
    pub sender_session_timeout: Duration,
    #[serde(rename = "receiver_session_timeout_ms", deserialize_with = "millis")]
    pub receiver_session_timeout: Duration,
    /// time the sender keeps serving control messages after all receivers completed
    #[serde(rename = "completion_linger_ms", deserialize_with = "millis")]
    pub completion_linger: Duration,

    /// Capacity of the queue between control listener and retransmit dispatcher. If the queue is
    ///  full, the listener waits for the dispatcher.
    pub retransmit_queue_capacity: usize,
    /// If set, only the most recent N packets are kept for retransmission. Unbounded otherwise.
    pub retention_window: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            total_packets: 10_000,
            send_interval: Duration::from_millis(10),
            nack_retry_interval: Duration::from_millis(500),
            nack_retry_tick: Duration::from_millis(500),
            nack_retry_window: 100,
            stuck_gap_threshold: 20,
            tail_probe_after: Duration::from_secs(2),
            stats_interval: Duration::from_secs(5),
            sender_session_timeout: Duration::from_secs(60),
            receiver_session_timeout: Duration::from_secs(300),
            completion_linger: Duration::from_secs(1),
            retransmit_queue_capacity: 100,
            retention_window: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.total_packets == 0 {
            bail!("a session must contain at least one packet");
        }
        if self.nack_retry_tick.is_zero() {
            bail!("NACK retry tick must be positive");
        }
        if self.stats_interval.is_zero() {
            bail!("statistics interval must be positive");
        }
        if self.nack_retry_window == 0 {
            bail!("NACK retry window must contain at least one sequence number");
        }
        if self.retransmit_queue_capacity == 0 {
            bail!("retransmit queue capacity must be positive");
        }
        if self.retention_window == Some(0) {
            bail!("retention window must be positive if it is configured");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub bind_addr: SocketAddr,
    /// every packet is sent to each of these addresses
    pub destinations: Vec<SocketAddr>,
    /// the number of distinct completion signals to wait for - defaults to the number of destinations
    pub expected_receivers: Option<usize>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            destinations: vec![
                SocketAddr::from(([127, 0, 0, 1], 9001)),
                SocketAddr::from(([127, 0, 0, 1], 9002)),
            ],
            expected_receivers: None,
        }
    }
}

impl SenderConfig {
    pub fn effective_expected_receivers(&self) -> usize {
        self.expected_receivers
            .unwrap_or(self.destinations.len())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.destinations.is_empty() {
            bail!("sender needs at least one destination");
        }
        if self.effective_expected_receivers() == 0 {
            bail!("sender must expect at least one receiver");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    pub name: String,
    pub bind_addr: SocketAddr,
    /// Destination for NACK and FIN. If this is not configured, control messages are sent to the
    ///  source address of the most recently received data packet.
    #[serde(default)]
    pub sender_addr: Option<SocketAddr>,
}

impl ReceiverConfig {
    pub fn new(name: &str, bind_addr: SocketAddr) -> ReceiverConfig {
        ReceiverConfig {
            name: name.to_string(),
            bind_addr,
            sender_addr: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub name: String,
    pub listen_addr: SocketAddr,
    /// the receiver side: data is forwarded here, control messages from here travel upstream
    pub forward_to: SocketAddr,
    #[serde(default)]
    pub drop_probability: f64,
    #[serde(default)]
    pub delay_probability: f64,
    #[serde(rename = "delay_ms", deserialize_with = "millis", default)]
    pub delay: Duration,
    /// fixed seed for reproducible loss patterns
    #[serde(default)]
    pub seed: Option<u64>,
}

impl RelayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.drop_probability) {
            bail!("relay {}: drop probability must be between 0 and 1", self.name);
        }
        if !(0.0..=1.0).contains(&self.delay_probability) {
            bail!("relay {}: delay probability must be between 0 and 1", self.name);
        }
        Ok(())
    }
}

/// The complete configuration as read from a TOML file. Missing sections get their defaults,
///  missing `[[receiver]]` or `[[relay]]` entries mean there are none.
#[derive(Debug, Clone, Deserialize)]
pub struct NackstreamConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(rename = "receiver", default)]
    pub receivers: Vec<ReceiverConfig>,
    #[serde(rename = "relay", default)]
    pub relays: Vec<RelayConfig>,
}

impl Default for NackstreamConfig {
    /// The demo topology used when there is no config file: two paths, one dropping 10% of the
    ///  packets, the other delaying 5% of them by 20ms
    fn default() -> Self {
        NackstreamConfig {
            session: SessionConfig::default(),
            sender: SenderConfig::default(),
            receivers: vec![
                ReceiverConfig::new("client1", SocketAddr::from(([127, 0, 0, 1], 9101))),
                ReceiverConfig::new("client2", SocketAddr::from(([127, 0, 0, 1], 9102))),
            ],
            relays: vec![
                RelayConfig {
                    name: "proxy1".to_string(),
                    listen_addr: SocketAddr::from(([127, 0, 0, 1], 9001)),
                    forward_to: SocketAddr::from(([127, 0, 0, 1], 9101)),
                    drop_probability: 0.1,
                    delay_probability: 0.0,
                    delay: Duration::ZERO,
                    seed: None,
                },
                RelayConfig {
                    name: "proxy2".to_string(),
                    listen_addr: SocketAddr::from(([127, 0, 0, 1], 9002)),
                    forward_to: SocketAddr::from(([127, 0, 0, 1], 9102)),
                    drop_probability: 0.0,
                    delay_probability: 0.05,
                    delay: Duration::from_millis(20),
                    seed: None,
                },
            ],
        }
    }
}

impl NackstreamConfig {
    pub const DEFAULT_FILE_NAME: &'static str = "nackstream.toml";

    pub fn from_toml_str(s: &str) -> anyhow::Result<NackstreamConfig> {
        let config: NackstreamConfig = toml::from_str(s)
            .context("cannot parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<NackstreamConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Loads the config from an explicit path, or from the first default location that exists.
    ///  If there is neither, the built-in defaults are used.
    pub fn load(path: Option<&Path>) -> anyhow::Result<NackstreamConfig> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        match Self::find_config_file() {
            Some(path) => {
                debug!("using config file {}", path.display());
                Self::from_file(&path)
            }
            None => {
                debug!("no config file found - using defaults");
                let config = NackstreamConfig::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    fn find_config_file() -> Option<PathBuf> {
        ["", "..", "../.."].iter()
            .map(|dir| Path::new(dir).join(Self::DEFAULT_FILE_NAME))
            .find(|p| p.is_file())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.session.validate()?;
        self.sender.validate()?;
        for relay in &self.relays {
            relay.validate()?;
        }
        Ok(())
    }

    pub fn receiver(&self, name: &str) -> anyhow::Result<&ReceiverConfig> {
        match self.receivers.iter().find(|r| r.name == name) {
            Some(r) => Ok(r),
            None => bail!("no receiver named {:?} in the configuration", name),
        }
    }

    pub fn relay(&self, name: &str) -> anyhow::Result<&RelayConfig> {
        match self.relays.iter().find(|r| r.name == name) {
            Some(r) => Ok(r),
            None => bail!("no relay named {:?} in the configuration", name),
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(raw))
}
