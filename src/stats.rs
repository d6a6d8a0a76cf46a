use std::fmt::{Display, Formatter};
use std::time::Duration;

/// number of samples the latency statistics are based on
pub const LATENCY_SAMPLES: usize = 1000;

/// Mean and standard deviation over the most recent `N` values, updated incrementally.
pub struct RollingData<const N: usize> {
    buf: SampleBuffer<N>,
    cached_sum: f64,
    cached_square_sum: f64,
}
impl<const N: usize> Default for RollingData<N> {
    fn default() -> Self {
        RollingData {
            buf: SampleBuffer::Growing(Vec::new()),
            cached_sum: 0.0,
            cached_square_sum: 0.0,
        }
    }
}
impl<const N: usize> RollingData<N> {
    pub fn add_value(&mut self, value: f64) {
        if let Some(evicted) = self.buf.add_value(value) {
            self.cached_sum -= evicted;
            self.cached_square_sum -= evicted * evicted;
        }

        self.cached_sum += value;
        self.cached_square_sum += value * value;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mean(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(self.cached_sum / self.buf.len() as f64)
    }

    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        if self.buf.len() < 2 {
            return Some(0.0);
        }

        let diff_of_squares = self.cached_square_sum - mean * mean * self.buf.len() as f64;
        // rounding can make this slightly negative for (nearly) constant data
        Some((diff_of_squares.max(0.0) / (self.buf.len() - 1) as f64).sqrt())
    }
}

enum SampleBuffer<const N: usize> {
    Growing(Vec<f64>),
    Ring {
        buf: Vec<f64>,
        next: usize,
    },
}
impl <const N: usize> SampleBuffer<N> {
    fn len(&self) -> usize {
        match self {
            SampleBuffer::Growing(buf) => buf.len(),
            SampleBuffer::Ring { buf, .. } => buf.len(),
        }
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add_value(&mut self, value: f64) -> Option<f64> {
        match self {
            SampleBuffer::Growing(buf) => {
                buf.push(value);
                if buf.len() == N {
                    let buf = std::mem::take(buf);
                    *self = SampleBuffer::Ring { buf, next: 0 };
                }
                None
            }
            SampleBuffer::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % N;
                Some(evicted)
            }
        }
    }
}

/// Latency of delivered packets, measured from the timestamp embedded by the sender. This is
///  informational only: sender and receiver clocks are not assumed to be synchronized.
#[derive(Default)]
pub struct LatencyStats {
    millis: RollingData<LATENCY_SAMPLES>,
}
impl LatencyStats {
    pub fn add_sample(&mut self, latency: Duration) {
        self.millis.add_value(latency.as_secs_f64() * 1000.0);
    }

    pub fn mean_millis(&self) -> Option<f64> {
        self.millis.mean()
    }

    pub fn std_dev_millis(&self) -> Option<f64> {
        self.millis.std_dev()
    }
}

/// Counters maintained by the reorder buffer
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ReorderCounters {
    /// every data packet that reached the reorder buffer, including duplicates
    pub received: u64,
    /// delivered to the application, in order
    pub processed: u64,
    /// stale packets and repeated arrivals of buffered packets
    pub duplicates: u64,
    /// distinct sequence numbers that were NACK'ed at least once
    pub lost_detected: u64,
    /// NACKs including retries
    pub nacks_sent: u64,
}

/// A point-in-time view of a receiver's state, for periodic logging and the final report
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverStats {
    pub counters: ReorderCounters,
    pub buffered: usize,
    pub next_expected: u64,
    pub total_expected: u64,
    pub latency_mean_millis: Option<f64>,
    pub latency_std_dev_millis: Option<f64>,
}

impl Display for ReceiverStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "received={} processed={}/{} duplicates={} buffered={} lost_detected={} nacks_sent={} next_expected={}",
               self.counters.received,
               self.counters.processed,
               self.total_expected,
               self.counters.duplicates,
               self.buffered,
               self.counters.lost_detected,
               self.counters.nacks_sent,
               self.next_expected,
        )?;
        if let (Some(mean), Some(std_dev)) = (self.latency_mean_millis, self.latency_std_dev_millis) {
            write!(f, " latency={:.3}ms±{:.3}ms", mean, std_dev)?;
        }
        Ok(())
    }
}
