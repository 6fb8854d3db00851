//! Common test utilities for store scenario tests

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::backend::InMemoryBackend;
use crate::realtime::InMemoryRealtime;
use crate::session::Identity;

/// Helpers shared across test modules.
pub mod serde {
    /// Assert that serde_json emits the same payload before and after round-tripping.
    pub fn assert_round_trip_json<T>(value: &T)
    where
        T: ::serde::Serialize + ::serde::de::DeserializeOwned,
    {
        let json = serde_json::to_value(value)
            .expect("serialization to value should succeed during round-trip testing");
        let restored: T = serde_json::from_value(json.clone())
            .expect("deserialization from value should succeed during round-trip testing");
        let json_after = serde_json::to_value(restored)
            .expect("re-serialization should succeed during round-trip testing");
        assert_eq!(json_after, json, "serde_json round-trip altered the payload");
    }
}

/// Backend and change feed shared by every simulated client.
pub struct World {
    pub backend: Arc<InMemoryBackend>,
    pub realtime: Arc<InMemoryRealtime>,
}

impl World {
    pub fn new(seed: u64) -> Self {
        let realtime = InMemoryRealtime::new();
        let backend = InMemoryBackend::with_seed(seed).with_realtime(realtime.clone());
        Self {
            backend: Arc::new(backend),
            realtime: Arc::new(realtime),
        }
    }

    /// Registers a player and returns its identity feed.
    pub fn player(&self, email: &str) -> (Identity, watch::Receiver<Option<Identity>>) {
        let identity = Identity::new(Uuid::new_v4(), email);
        self.backend.register_player(identity.id, email);
        let (_, rx) = watch::channel(Some(identity.clone()));
        (identity, rx)
    }
}

/// Polls `cond` until it holds, failing the test after two seconds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
