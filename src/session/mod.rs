//! Authenticated identity and navigation gating.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

pub mod auth;
pub mod routes;

pub use auth::{AuthError, AuthProvider, GoTrueAuth, Identity, StaticAuth};
pub use routes::{guard, Navigation, Route};

const LOG_TARGET: &str = "session";

/// Query parameters handed to the auth callback route.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub token_hash: Option<String>,
    pub kind: Option<String>,
}

impl CallbackParams {
    pub fn from_url(url: &Url) -> Self {
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "token_hash" => params.token_hash = Some(value.into_owned()),
                "type" => params.kind = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }
}

#[derive(Debug, Default)]
struct SessionFlags {
    loading: bool,
    error: Option<String>,
}

/// Holds the current identity and pushes changes to subscribers.
pub struct SessionStore {
    provider: Arc<dyn AuthProvider>,
    identity: watch::Sender<Option<Identity>>,
    flags: RwLock<SessionFlags>,
    origin: String,
}

impl SessionStore {
    /// `origin` is the public base the callback route is served from.
    pub fn new(provider: Arc<dyn AuthProvider>, origin: impl Into<String>) -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            provider,
            identity,
            flags: RwLock::new(SessionFlags::default()),
            origin: origin.into(),
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.borrow().is_some()
    }

    pub fn loading(&self) -> bool {
        self.flags.read().loading
    }

    pub fn error(&self) -> Option<String> {
        self.flags.read().error.clone()
    }

    fn callback_url(&self) -> String {
        format!("{}{}", self.origin.trim_end_matches('/'), Route::AuthCallback)
    }

    fn set_identity(&self, identity: Option<Identity>) {
        match &identity {
            Some(id) => info!(target = LOG_TARGET, player_id = %id.id, "signed in"),
            None => info!(target = LOG_TARGET, "signed out"),
        }
        self.identity.send_replace(identity);
    }

    fn record<T>(&self, result: Result<T, AuthError>) -> Result<T, AuthError> {
        let mut flags = self.flags.write();
        flags.loading = false;
        if let Err(err) = &result {
            warn!(target = LOG_TARGET, error = %err, "auth operation failed");
            flags.error = Some(err.to_string());
        }
        result
    }

    fn begin(&self) {
        let mut flags = self.flags.write();
        flags.loading = true;
        flags.error = None;
    }

    /// Restores a persisted session, if there is one.
    pub async fn initialize(&self) -> Result<Option<Identity>, AuthError> {
        self.begin();
        let restored = self.provider.restore().await;
        if let Ok(identity) = &restored {
            self.set_identity(identity.clone());
        }
        self.record(restored)
    }

    pub async fn sign_in_with_magic_link(&self, email: &str) -> Result<(), AuthError> {
        self.begin();
        let result = self
            .provider
            .send_magic_link(email, &self.callback_url())
            .await;
        self.record(result)
    }

    pub fn sign_in_with_provider(&self, provider: &str) -> Result<Url, AuthError> {
        let result = self.provider.provider_url(provider, &self.callback_url());
        self.record(result)
    }

    /// Completes a magic-link or federated sign-in.
    pub async fn handle_auth_callback(&self, params: &CallbackParams) -> Result<Identity, AuthError> {
        self.begin();
        let result = match (&params.token_hash, &params.kind) {
            (Some(hash), Some(kind)) => self.provider.verify_token_hash(hash, kind).await,
            _ => self
                .provider
                .restore()
                .await
                .and_then(|identity| identity.ok_or(AuthError::NoSession)),
        };
        if let Ok(identity) = &result {
            self.set_identity(Some(identity.clone()));
        }
        self.record(result)
    }

    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.begin();
        let result = self.provider.sign_out().await;
        if result.is_ok() {
            self.set_identity(None);
        }
        self.record(result)
    }

    pub fn guard(&self, route: Route) -> Navigation {
        guard(route, self.identity.borrow().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use uuid::Uuid;

    fn store(identity: Option<Identity>) -> SessionStore {
        let provider = match identity {
            Some(identity) => StaticAuth::signed_in(identity),
            None => StaticAuth::signed_out(),
        };
        SessionStore::new(Arc::new(provider), "http://localhost:5173")
    }

    #[tokio::test]
    async fn initialize_restores_and_notifies() -> Result<()> {
        let me = Identity::new(Uuid::new_v4(), "oink@example.com");
        let session = store(Some(me.clone()));
        let mut changes = session.subscribe();

        assert_eq!(session.initialize().await?, Some(me.clone()));
        changes.changed().await?;
        assert_eq!(changes.borrow().as_ref(), Some(&me));
        assert_eq!(session.guard(Route::Login), Navigation::Redirect(Route::Lobby));

        session.sign_out().await?;
        assert!(!session.is_authenticated());
        assert_eq!(session.guard(Route::Lobby), Navigation::Redirect(Route::Login));
        Ok(())
    }

    #[tokio::test]
    async fn callback_without_session_reports_error() -> Result<()> {
        let session = store(None);
        let err = session
            .handle_auth_callback(&CallbackParams::default())
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::NoSession);
        assert_eq!(session.error().as_deref(), Some("no session found"));
        assert!(!session.loading());
        Ok(())
    }

    #[test]
    fn callback_params_come_from_the_query() -> Result<()> {
        let url = Url::parse("http://localhost/auth/callback?token_hash=abc&type=magiclink")?;
        let params = CallbackParams::from_url(&url);
        assert_eq!(params.token_hash.as_deref(), Some("abc"));
        assert_eq!(params.kind.as_deref(), Some("magiclink"));
        Ok(())
    }

    #[test]
    fn provider_sign_in_redirects_back_to_callback() -> Result<()> {
        let session = store(None);
        let url = session.sign_in_with_provider("google")?;
        let redirect = url
            .query_pairs()
            .find(|(k, _)| k == "redirect_to")
            .map(|(_, v)| v.into_owned());
        assert_eq!(redirect.as_deref(), Some("http://localhost:5173/auth/callback"));
        Ok(())
    }
}
