use crate::auth::{AuthCoordinator, Session, SignOutReason};
use crate::channel::{ChannelError, ConnectionId, RealtimeChannel};
use crate::chat::ChatStore;
use crate::config::ClientConfig;
use crate::connector::{Connector, WsConnector};
use crate::models::UserProfile;
use crate::store::SessionStore;
use crate::transport::{ApiRequest, SessionTransport, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("not signed in")]
    NotSignedIn,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("session could not be saved: {0}")]
    Storage(String),
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    user: Option<UserProfile>,
}

/// Root service object: one session store, one transport and one realtime
/// channel per instance. Front ends build it once and share clones.
#[derive(Clone)]
pub struct CampusClient {
    config: ClientConfig,
    transport: SessionTransport,
    channel: RealtimeChannel,
}

impl CampusClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let store = SessionStore::new(config.data_dir.clone());
        let connector = Arc::new(WsConnector::new(config.socket_url.clone()));
        Self::with_parts(config, store, connector)
    }

    pub fn with_parts(
        config: ClientConfig,
        store: SessionStore,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        let transport = SessionTransport::new(&config, store)?;
        let channel = RealtimeChannel::new(connector);
        Ok(Self {
            config,
            transport,
            channel,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &SessionTransport {
        &self.transport
    }

    pub fn auth(&self) -> &AuthCoordinator {
        self.transport.auth()
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    pub fn session(&self) -> Option<Session> {
        self.auth().session()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ClientError> {
        let request = ApiRequest::post("/auth/login")
            .json(&LoginRequest { email, password })?
            .without_refresh();
        let response: LoginResponse = self.transport.send(request).await?;
        let session = Session {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            user: response.user,
        };
        self.auth()
            .establish(session.clone())
            .map_err(|err| ClientError::Storage(format!("{err:#}")))?;
        Ok(session)
    }

    /// Sign out: tell the server, drop the realtime link, forget the session.
    pub async fn logout(&self) {
        if self.session().is_some() {
            let request = ApiRequest::post("/auth/logout").without_refresh();
            if let Err(err) = self.transport.request(request).await {
                debug!(%err, "server-side logout failed, clearing local session anyway");
            }
        }
        self.channel.disconnect();
        self.auth().end_session(SignOutReason::LoggedOut);
    }

    /// Open the realtime channel with the current access token.
    pub async fn connect_realtime(&self) -> Result<ConnectionId, ClientError> {
        let token = self
            .transport
            .auth()
            .store()
            .access_token()
            .ok_or(ClientError::NotSignedIn)?;
        match self.channel.connect(&token).await {
            Ok(id) => Ok(id),
            Err(err) => {
                warn!(%err, "continuing without realtime updates");
                Err(err.into())
            }
        }
    }

    /// Chat cache for the signed-in user, already receiving realtime events.
    pub fn open_chat(&self) -> Result<ChatStore, ClientError> {
        let user = self
            .session()
            .and_then(|session| session.user)
            .ok_or(ClientError::NotSignedIn)?;
        let chat = ChatStore::new(user.id.clone(), self.transport.clone(), self.channel.clone());
        chat.attach();
        info!(user = %user.id, "chat opened");
        Ok(chat)
    }
}
