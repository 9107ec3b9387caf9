use crate::models::UserProfile;
use crate::store::SessionStore;
use crate::transport::unwrap_envelope;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Credentials of the signed-in account, persisted as a single record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    NoSession,
    LoggedOut,
    MissingRefreshToken,
    RefreshFailed,
}

/// Application-level authentication state. Front ends watch this instead of
/// the session layer navigating on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Authenticated,
    Unauthenticated(SignOutReason),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("no refresh token stored")]
    MissingToken,
    #[error("session refresh rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPair {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String, RefreshFailure>>>;

/// Owns the session lifecycle: establishing it, refreshing it and ending it.
///
/// Refreshes are single-flight. Every caller that asks for a refresh while one
/// is outstanding awaits the same request and observes the same outcome.
#[derive(Clone)]
pub struct AuthCoordinator {
    store: SessionStore,
    http: Client,
    refresh_url: String,
    status: Arc<watch::Sender<AuthStatus>>,
    in_flight: Arc<Mutex<Option<RefreshFuture>>>,
}

impl AuthCoordinator {
    pub fn new(store: SessionStore, http: Client, refresh_url: impl Into<String>) -> Self {
        let initial = if store.current().is_some() {
            AuthStatus::Authenticated
        } else {
            AuthStatus::Unauthenticated(SignOutReason::NoSession)
        };
        let (status, _) = watch::channel(initial);
        Self {
            store,
            http,
            refresh_url: refresh_url.into(),
            status: Arc::new(status),
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn status(&self) -> AuthStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.status.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        self.store.current()
    }

    /// Persist a freshly issued session and mark the client authenticated.
    pub fn establish(&self, session: Session) -> anyhow::Result<()> {
        self.store.save(&session)?;
        self.status.send_replace(AuthStatus::Authenticated);
        info!(
            user = session.user.as_ref().map(|u| u.id.as_str()).unwrap_or("unknown"),
            "session established"
        );
        Ok(())
    }

    /// Drop the persisted session and publish the unauthenticated state.
    pub fn end_session(&self, reason: SignOutReason) {
        if let Err(err) = self.store.clear() {
            warn!(%err, "failed to remove persisted session");
        }
        self.status.send_replace(AuthStatus::Unauthenticated(reason));
        info!(?reason, "session ended");
    }

    /// Obtain a new access token, sharing any refresh already in flight.
    pub async fn refresh(&self) -> Result<String, RefreshFailure> {
        let refresh = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let pending = self.clone().run_refresh().boxed().shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        let outcome = refresh.clone().await;

        let mut slot = self.in_flight.lock();
        if slot
            .as_ref()
            .is_some_and(|pending| pending.ptr_eq(&refresh))
        {
            *slot = None;
        }
        outcome
    }

    async fn run_refresh(self) -> Result<String, RefreshFailure> {
        // Already signed out: keep the reason the session ended with.
        if self.store.current().is_none() {
            debug!("refresh requested without a session");
            return Err(RefreshFailure::MissingToken);
        }
        let Some(refresh_token) = self.store.refresh_token() else {
            warn!("access token rejected and no refresh token is stored");
            self.end_session(SignOutReason::MissingRefreshToken);
            return Err(RefreshFailure::MissingToken);
        };

        info!("access token rejected, refreshing session");
        match self.request_tokens(&refresh_token).await {
            Ok(pair) => {
                let next_refresh = pair.refresh_token.or(Some(refresh_token));
                if let Err(err) = self
                    .store
                    .update_tokens(pair.access_token.clone(), next_refresh)
                {
                    warn!(%err, "refreshed session could not be written to disk");
                }
                self.status.send_replace(AuthStatus::Authenticated);
                Ok(pair.access_token)
            }
            Err(reason) => {
                warn!(%reason, "session refresh failed");
                self.end_session(SignOutReason::RefreshFailed);
                Err(RefreshFailure::Rejected(reason))
            }
        }
    }

    async fn request_tokens(&self, refresh_token: &str) -> Result<TokenPair, String> {
        let response = self
            .http
            .post(&self.refresh_url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("refresh endpoint answered {status}"));
        }
        let body: serde_json::Value = response.json().await.map_err(|err| err.to_string())?;
        serde_json::from_value(unwrap_envelope(body))
            .map_err(|err| format!("malformed refresh response: {err}"))
    }
}
