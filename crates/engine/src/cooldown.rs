use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// At most one decision-provider consultation per strategy per window.
///
/// Entries expire on their own; expired ones are pruned whenever the table is
/// written, and a closing strategy is evicted explicitly.
#[derive(Debug)]
pub struct CooldownTable {
    window: Duration,
    last_call: RwLock<HashMap<String, Instant>>,
}

impl CooldownTable {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_call: RwLock::new(HashMap::new()),
        }
    }

    /// Claims the window for `strategy_id`. Returns `false` if it was still cooling.
    pub async fn try_mark(&self, strategy_id: &str) -> bool {
        let now = Instant::now();
        let mut last_call = self.last_call.write().await;
        last_call.retain(|_, at| now.duration_since(*at) < self.window);
        if last_call.contains_key(strategy_id) {
            return false;
        }
        last_call.insert(strategy_id.to_string(), now);
        true
    }

    pub async fn evict(&self, strategy_id: &str) {
        self.last_call.write().await.remove(strategy_id);
    }

    pub async fn len(&self) -> usize {
        self.last_call.read().await.len()
    }
}
