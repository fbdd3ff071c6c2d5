use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::error::EngineError;
use crate::snapshot::types::WalletSnapshot;

/// Build results are shared between all joiners of a flight, so both arms
/// must be cheaply cloneable.
pub type SharedBuild = std::result::Result<Arc<WalletSnapshot>, Arc<EngineError>>;

type Key = (i64, String);

/// At most one in-flight snapshot build per (chain, wallet). The map is
/// locked only to insert or remove a flight; the build itself runs outside
/// the lock. Waiters receive the leader's result over a broadcast channel;
/// dropping a waiter never cancels the shared build.
pub struct SingleFlight {
    inflight: Mutex<HashMap<Key, broadcast::Sender<SharedBuild>>>,
    builds_started: AtomicU64,
}

pub enum Flight {
    /// This caller starts the build and must call `finish` with the result.
    Leader(broadcast::Sender<SharedBuild>),
    /// Another caller is already building; await the broadcast.
    Follower(broadcast::Receiver<SharedBuild>),
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            builds_started: AtomicU64::new(0),
        }
    }

    pub fn join(&self, chain_id: i64, wallet: &str) -> Flight {
        let key = (chain_id, wallet.to_string());
        let mut map = self.inflight.lock().expect("single-flight lock poisoned");
        if let Some(tx) = map.get(&key) {
            return Flight::Follower(tx.subscribe());
        }
        let (tx, _) = broadcast::channel(1);
        map.insert(key, tx.clone());
        self.builds_started.fetch_add(1, Ordering::Relaxed);
        Flight::Leader(tx)
    }

    /// Remove the flight, then publish. A caller arriving between the two
    /// steps starts a fresh build, which is the contract: results are never
    /// served to joiners of a later generation.
    pub fn finish(
        &self,
        chain_id: i64,
        wallet: &str,
        tx: &broadcast::Sender<SharedBuild>,
        result: SharedBuild,
    ) {
        let key = (chain_id, wallet.to_string());
        self.inflight
            .lock()
            .expect("single-flight lock poisoned")
            .remove(&key);
        let _ = tx.send(result);
    }

    /// Total number of builds ever led. Test hook for dedup assertions.
    pub fn builds_started(&self) -> u64 {
        self.builds_started.load(Ordering::Relaxed)
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn snapshot() -> Arc<WalletSnapshot> {
        Arc::new(WalletSnapshot {
            chain_id: 1,
            chain_name: "ethereum".to_string(),
            native: "0".to_string(),
            result: vec![],
            block_number: 1,
            syncing: false,
            count: 0,
        })
    }

    #[tokio::test]
    async fn concurrent_joiners_share_one_build() {
        let flights = Arc::new(SingleFlight::new());
        let mut handles = Vec::new();

        for _ in 0..20 {
            let flights = Arc::clone(&flights);
            handles.push(tokio::spawn(async move {
                match flights.join(1, "0xabc") {
                    Flight::Leader(tx) => {
                        // Simulate a slow build so every other task joins.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        flights.finish(1, "0xabc", &tx, Ok(snapshot()));
                        true
                    }
                    Flight::Follower(mut rx) => {
                        rx.recv().await.expect("leader result").expect("build ok");
                        false
                    }
                }
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            if handle.await.unwrap() {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
        assert_eq!(flights.builds_started(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_build_independently() {
        let flights = SingleFlight::new();
        assert!(matches!(flights.join(1, "0xabc"), Flight::Leader(_)));
        assert!(matches!(flights.join(56, "0xabc"), Flight::Leader(_)));
        assert!(matches!(flights.join(1, "0xdef"), Flight::Leader(_)));
        assert!(matches!(flights.join(1, "0xabc"), Flight::Follower(_)));
        assert_eq!(flights.builds_started(), 3);
    }

    #[tokio::test]
    async fn failure_is_delivered_and_slot_freed() {
        let flights = SingleFlight::new();
        let tx = match flights.join(1, "0xabc") {
            Flight::Leader(tx) => tx,
            Flight::Follower(_) => panic!("expected leader"),
        };
        let mut rx = match flights.join(1, "0xabc") {
            Flight::Follower(rx) => rx,
            Flight::Leader(_) => panic!("expected follower"),
        };

        flights.finish(
            1,
            "0xabc",
            &tx,
            Err(Arc::new(EngineError::ProviderUnavailable {
                chain_id: 1,
                reason: "down".to_string(),
            })),
        );

        assert!(rx.recv().await.unwrap().is_err());
        // Next caller starts a fresh build.
        assert!(matches!(flights.join(1, "0xabc"), Flight::Leader(_)));
    }
}
