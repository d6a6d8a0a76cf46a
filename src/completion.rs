use std::net::SocketAddr;
use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tracing::{debug, info};

/// Keeps track of which receivers signalled completion (`FIN`) to the sender. A `FIN` is
///  idempotent per source address.
///
/// Sources are not checked against the configured destinations: the sender usually sees
///  receivers through relays or NAT, so any address counts. A stray `FIN` from outside the
///  session therefore counts towards `expected` and can end the session early.
pub struct CompletionTracker {
    expected: usize,
    completed: watch::Sender<FxHashSet<SocketAddr>>,
}

impl CompletionTracker {
    pub fn new(expected: usize) -> CompletionTracker {
        let (completed, _) = watch::channel(FxHashSet::default());
        CompletionTracker {
            expected,
            completed,
        }
    }

    /// returns true if this is the first completion signal from this source
    pub fn on_fin(&self, from: SocketAddr) -> bool {
        let is_new = self.completed.send_if_modified(|completed| completed.insert(from));
        if is_new {
            info!("received FIN from {:?} - {}/{} receivers completed", from, self.completed_count(), self.expected);
        }
        else {
            debug!("received duplicate FIN from {:?}", from);
        }
        is_new
    }

    pub fn completed_count(&self) -> usize {
        self.completed.borrow().len()
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() >= self.expected
    }

    /// returns once all expected receivers have signalled completion
    pub async fn wait_all(&self) {
        let mut recv = self.completed.subscribe();
        let expected = self.expected;
        // the sender half lives in self, so the channel cannot be closed while we wait
        let _ = recv.wait_for(|completed| completed.len() >= expected).await;
    }
}
