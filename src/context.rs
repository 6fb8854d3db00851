//! Explicitly passed application context: the backend, the change feed and
//! the session every store is built from.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::{Backend, InMemoryBackend, SupabaseBackend};
use crate::config::{ClientConfig, DEFAULT_POLL_INTERVAL};
use crate::game::GameStore;
use crate::lobby::LobbyStore;
use crate::realtime::{InMemoryRealtime, RealtimeHub, SupabaseRealtime};
use crate::session::{AuthError, AuthProvider, GoTrueAuth, SessionStore};
use crate::tokio_tools::spawn_named_task;

const LOG_TARGET: &str = "context";
const LOCAL_ORIGIN: &str = "http://localhost:5173";

#[derive(Clone)]
pub struct AppContext {
    pub backend: Arc<dyn Backend>,
    pub realtime: Arc<dyn RealtimeHub>,
    pub session: Arc<SessionStore>,
    pub poll_interval: Duration,
}

impl AppContext {
    pub fn new(
        backend: Arc<dyn Backend>,
        realtime: Arc<dyn RealtimeHub>,
        session: Arc<SessionStore>,
    ) -> Self {
        Self {
            backend,
            realtime,
            session,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wires the hosted services and restores the session. The session's
    /// access token follows sign-in and sign-out onto both clients.
    pub async fn connect(
        config: &ClientConfig,
        access_token: Option<String>,
        origin: Option<&str>,
    ) -> Result<(Self, JoinHandle<()>), AuthError> {
        let backend = SupabaseBackend::new(config);
        let realtime = SupabaseRealtime::new(config.into());
        let mut auth = GoTrueAuth::new(config);
        if let Some(token) = access_token {
            auth = auth.with_access_token(token);
        }
        let provider: Arc<dyn AuthProvider> = Arc::new(auth);
        let session = Arc::new(SessionStore::new(provider, origin.unwrap_or(LOCAL_ORIGIN)));

        let identity = session.initialize().await?;
        let token = identity.and_then(|identity| identity.access_token);
        backend.set_access_token(token.clone());
        realtime.set_access_token(token);

        let sync = spawn_token_sync(session.clone(), backend.clone(), realtime.clone());
        let context = Self::new(Arc::new(backend), Arc::new(realtime), session)
            .with_poll_interval(config.poll_interval);
        info!(target = LOG_TARGET, url = %config.supabase_url, "connected to hosted services");
        Ok((context, sync))
    }

    /// Local emulation for demos: one backend and feed shared by every client.
    pub fn local(seed: u64) -> (Arc<InMemoryBackend>, Arc<InMemoryRealtime>) {
        let realtime = InMemoryRealtime::new();
        let backend = InMemoryBackend::with_seed(seed).with_realtime(realtime.clone());
        (Arc::new(backend), Arc::new(realtime))
    }

    pub fn lobby(&self) -> LobbyStore {
        LobbyStore::new(
            self.backend.clone(),
            self.realtime.clone(),
            self.session.subscribe(),
        )
    }

    pub fn game(&self) -> GameStore {
        GameStore::new(
            self.backend.clone(),
            self.realtime.clone(),
            self.session.subscribe(),
        )
        .with_poll_interval(self.poll_interval)
    }
}

fn spawn_token_sync(
    session: Arc<SessionStore>,
    backend: SupabaseBackend,
    realtime: SupabaseRealtime,
) -> JoinHandle<()> {
    let mut identity = session.subscribe();
    spawn_named_task("session-token-sync", async move {
        while identity.changed().await.is_ok() {
            let token = identity
                .borrow_and_update()
                .as_ref()
                .and_then(|identity| identity.access_token.clone());
            debug!(target = LOG_TARGET, signed_in = token.is_some(), "access token changed");
            backend.set_access_token(token.clone());
            realtime.set_access_token(token);
        }
    })
}
