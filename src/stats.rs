// KeyMux — rolling call counter.
//
// Feeds the "calls in the last minute" figure surfaced by the system stats
// and precheck status endpoints. Observability only; selection correctness
// never depends on it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Events older than this are pruned on every write.
const RETENTION: Duration = Duration::from_secs(600);

pub struct CallStats {
    events: Mutex<VecDeque<Instant>>,
}

impl Default for CallStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStats {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one selector call.
    pub async fn record(&self) {
        let now = Instant::now();
        let mut events = self.events.lock().await;
        events.push_back(now);
        while let Some(front) = events.front() {
            if now.duration_since(*front) > RETENTION {
                events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of selector calls observed in the last `minutes` minutes.
    pub async fn calls_in_last_minutes(&self, minutes: u64) -> usize {
        let cutoff = Duration::from_secs(minutes * 60);
        let now = Instant::now();
        let events = self.events.lock().await;
        events
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= cutoff)
            .count()
    }
}
