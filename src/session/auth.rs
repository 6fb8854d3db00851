use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::domain::PlayerId;

const LOG_TARGET: &str = "session::auth";

/// The signed-in player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: PlayerId,
    pub email: Option<String>,
    pub access_token: Option<String>,
}

impl Identity {
    pub fn new(id: PlayerId, email: impl Into<String>) -> Self {
        Self {
            id,
            email: Some(email.into()),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Local part of the e-mail address.
    pub fn display_name(&self) -> Option<&str> {
        self.email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("auth transport error: {0}")]
    Transport(String),
    #[error("auth request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("failed to decode auth response: {0}")]
    Decode(String),
    #[error("invalid auth configuration: {0}")]
    Config(String),
    #[error("no session found")]
    NoSession,
}

impl AuthError {
    fn transport(err: impl ToString) -> Self {
        Self::Transport(err.to_string())
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Session persisted from a previous sign-in, if any.
    async fn restore(&self) -> Result<Option<Identity>, AuthError>;

    async fn send_magic_link(&self, email: &str, redirect_to: &str) -> Result<(), AuthError>;

    /// Where the browser must go to start a federated sign-in.
    fn provider_url(&self, provider: &str, redirect_to: &str) -> Result<Url, AuthError>;

    async fn verify_token_hash(&self, token_hash: &str, kind: &str)
        -> Result<Identity, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;
}

#[derive(Debug, Deserialize)]
struct UserBody {
    id: PlayerId,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    access_token: String,
    user: UserBody,
}

/// Hosted identity service speaking the `/auth/v1` REST surface.
pub struct GoTrueAuth {
    http: Client,
    base: String,
    anon_key: String,
    access_token: RwLock<Option<String>>,
}

impl GoTrueAuth {
    pub fn new(cfg: &ClientConfig) -> Self {
        Self {
            http: Client::new(),
            base: cfg.auth_url(),
            anon_key: cfg.anon_key.clone(),
            access_token: RwLock::new(None),
        }
    }

    /// Seeds a session obtained out of band, e.g. from a command-line flag.
    pub fn with_access_token(self, token: impl Into<String>) -> Self {
        *self.access_token.write() = Some(token.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AuthError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(AuthError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl AuthProvider for GoTrueAuth {
    async fn restore(&self) -> Result<Option<Identity>, AuthError> {
        let Some(token) = self.access_token.read().clone() else {
            return Ok(None);
        };
        let response = self
            .http
            .get(self.endpoint("user"))
            .header("apikey", &self.anon_key)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(AuthError::transport)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(target = LOG_TARGET, "stored session was rejected");
            *self.access_token.write() = None;
            return Ok(None);
        }
        let user: UserBody = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| AuthError::Decode(err.to_string()))?;
        Ok(Some(Identity {
            id: user.id,
            email: user.email,
            access_token: Some(token),
        }))
    }

    async fn send_magic_link(&self, email: &str, redirect_to: &str) -> Result<(), AuthError> {
        let response = self
            .http
            .post(self.endpoint("otp"))
            .query(&[("redirect_to", redirect_to)])
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "create_user": true }))
            .send()
            .await
            .map_err(AuthError::transport)?;
        Self::check(response).await?;
        debug!(target = LOG_TARGET, email, "magic link sent");
        Ok(())
    }

    fn provider_url(&self, provider: &str, redirect_to: &str) -> Result<Url, AuthError> {
        Url::parse_with_params(
            &self.endpoint("authorize"),
            &[("provider", provider), ("redirect_to", redirect_to)],
        )
        .map_err(|err| AuthError::Config(err.to_string()))
    }

    async fn verify_token_hash(
        &self,
        token_hash: &str,
        kind: &str,
    ) -> Result<Identity, AuthError> {
        let response = self
            .http
            .post(self.endpoint("verify"))
            .header("apikey", &self.anon_key)
            .json(&json!({ "token_hash": token_hash, "type": kind }))
            .send()
            .await
            .map_err(AuthError::transport)?;
        let session: SessionBody = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| AuthError::Decode(err.to_string()))?;
        *self.access_token.write() = Some(session.access_token.clone());
        Ok(Identity {
            id: session.user.id,
            email: session.user.email,
            access_token: Some(session.access_token),
        })
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let Some(token) = self.access_token.write().take() else {
            return Ok(());
        };
        let response = self
            .http
            .post(self.endpoint("logout"))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(AuthError::transport)?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Fixed identity, for local play and tests.
#[derive(Debug, Default)]
pub struct StaticAuth {
    identity: RwLock<Option<Identity>>,
}

impl StaticAuth {
    pub fn signed_in(identity: Identity) -> Self {
        Self {
            identity: RwLock::new(Some(identity)),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn restore(&self) -> Result<Option<Identity>, AuthError> {
        Ok(self.identity.read().clone())
    }

    async fn send_magic_link(&self, _email: &str, _redirect_to: &str) -> Result<(), AuthError> {
        Ok(())
    }

    fn provider_url(&self, provider: &str, redirect_to: &str) -> Result<Url, AuthError> {
        Url::parse_with_params(
            "http://localhost/auth/v1/authorize",
            &[("provider", provider), ("redirect_to", redirect_to)],
        )
        .map_err(|err| AuthError::Config(err.to_string()))
    }

    async fn verify_token_hash(
        &self,
        _token_hash: &str,
        _kind: &str,
    ) -> Result<Identity, AuthError> {
        self.identity.read().clone().ok_or(AuthError::NoSession)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        *self.identity.write() = None;
        Ok(())
    }
}
