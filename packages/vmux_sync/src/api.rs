//! REST calls against the relay: voice tokens and the auth plumbing.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::{CredentialStore, Credentials};
use crate::config::RelayConfig;
use crate::error::ClientError;
use crate::models::VoiceToken;

const AUTH_STATUS_PATH: &str = "/api/auth/status";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AuthStatus {
    #[serde(default)]
    pub auth_enabled: bool,
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Device {
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    /// Epoch seconds
    #[serde(default)]
    pub paired_at: Option<f64>,
    #[serde(default)]
    pub last_seen: Option<f64>,
}

#[derive(Debug, Serialize)]
struct PairRequest<'a> {
    code: &'a str,
    device_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct PairResponse {
    token: String,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    device_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<Device>,
}

/// Shared HTTP client. Cheap to clone; clones share the bearer token.
#[derive(Clone)]
pub struct RelayApi {
    client: reqwest::Client,
    base_url: String,
    /// Sent as `identity` when requesting voice tokens.
    identity: String,
    credentials: CredentialStore,
    bearer: Arc<RwLock<Option<String>>>,
}

impl RelayApi {
    pub fn new(config: &RelayConfig, credentials: CredentialStore) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        let bearer = match credentials.load() {
            Ok(creds) => creds.map(|c| c.token),
            Err(e) => {
                warn!("Ignoring unreadable credentials: {:#}", e);
                None
            }
        };

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            identity: format!("client-{}", &uuid::Uuid::new_v4().simple().to_string()[..6]),
            credentials,
            bearer: Arc::new(RwLock::new(bearer)),
        })
    }

    pub async fn bearer(&self) -> Option<String> {
        self.bearer.read().await.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let rb = self.client.request(method, self.url(path));
        match self.bearer().await {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    async fn send(&self, rb: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let resp = rb.send().await.map_err(ClientError::from_reqwest)?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        rb: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        self.send(rb)
            .await?
            .json::<T>()
            .await
            .map_err(ClientError::from_reqwest)
    }

    /// A 401 from anything but the auth-status endpoint is only a hint;
    /// confirm before dropping credentials.
    async fn guard<T>(&self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if matches!(result, Err(ClientError::Unauthorized)) {
            self.verify_after_unauthorized().await;
        }
        result
    }

    pub async fn fetch_token(&self, room: &str) -> Result<VoiceToken, ClientError> {
        let rb = self
            .request(reqwest::Method::GET, "/api/token")
            .await
            .query(&[("room", room), ("identity", self.identity.as_str())]);
        let result = self.send_json::<VoiceToken>(rb).await;
        self.guard(result).await
    }

    pub async fn auth_status(&self) -> Result<AuthStatus, ClientError> {
        let rb = self.request(reqwest::Method::GET, AUTH_STATUS_PATH).await;
        self.send_json(rb).await
    }

    /// Exchange a pairing code for a device token and store it.
    pub async fn pair(&self, code: &str, device_name: &str) -> Result<Credentials, ClientError> {
        let rb = self
            .request(reqwest::Method::POST, "/api/auth/pair")
            .await
            .json(&PairRequest { code, device_name });
        let resp: PairResponse = self.send_json(rb).await?;

        let creds = Credentials {
            token: resp.token,
            device_id: resp.device_id,
            device_name: resp.device_name.or_else(|| Some(device_name.to_string())),
        };
        self.credentials.save(&creds)?;
        *self.bearer.write().await = Some(creds.token.clone());
        info!("Paired as {:?}", creds.device_name);
        Ok(creds)
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, ClientError> {
        let rb = self.request(reqwest::Method::GET, "/api/auth/devices").await;
        let result = self.send_json::<DevicesResponse>(rb).await.map(|r| r.devices);
        self.guard(result).await
    }

    pub async fn revoke_device(&self, device_id: &str) -> Result<(), ClientError> {
        let path = format!("/api/auth/devices/{}", device_id);
        let rb = self.request(reqwest::Method::DELETE, &path).await;
        let result = self.send(rb).await.map(|_| ());
        self.guard(result).await
    }

    /// Re-check the canonical auth status after a 401. Returns true when the
    /// stored credentials were cleared.
    pub async fn verify_after_unauthorized(&self) -> bool {
        let confirmed = match self.auth_status().await {
            Ok(status) => status.auth_enabled && !status.authenticated,
            Err(ClientError::Unauthorized) => true,
            Err(e) => {
                debug!("Auth status unavailable after 401, keeping credentials: {}", e);
                false
            }
        };
        if !confirmed {
            return false;
        }

        warn!("Relay no longer accepts this device, clearing credentials");
        *self.bearer.write().await = None;
        if let Err(e) = self.credentials.clear() {
            warn!("Failed to remove credentials file: {:#}", e);
        }
        true
    }
}
