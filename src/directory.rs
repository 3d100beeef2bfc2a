//! Client for the directory service ("centrum").
//!
//! The directory is the bootstrap and liveness authority: new dispatchers
//! register with it, running dispatchers wake/sleep against it, and worker
//! connect/disconnect counts are reported to it.

use std::sync::RwLock;

use serde::Deserialize;

use crate::error::{DispatchError, Result};

/// A directory entry, `pub@ip:port` with the pubkey in hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherAddr {
    pub pubkey_hex: String,
    pub ip: String,
    pub port: u16,
}

impl DispatcherAddr {
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/d", self.ip, self.port)
    }

    pub fn version_url(&self) -> String {
        format!("http://{}:{}/version", self.ip, self.port)
    }
}

/// Parse a directory address string of the form `pub@ip:port`.
pub fn parse_addr(addr: &str) -> Result<DispatcherAddr> {
    let (pubkey_hex, rest) = addr
        .split_once('@')
        .ok_or_else(|| DispatchError::InvalidAddr(addr.to_string()))?;
    let (ip, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| DispatchError::InvalidAddr(addr.to_string()))?;
    if pubkey_hex.is_empty() || ip.is_empty() || hex::decode(pubkey_hex).is_err() {
        return Err(DispatchError::InvalidAddr(addr.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| DispatchError::InvalidAddr(addr.to_string()))?;
    Ok(DispatcherAddr {
        pubkey_hex: pubkey_hex.to_string(),
        ip: ip.to_string(),
        port,
    })
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DispatchersResponse {
    #[serde(default)]
    dispatchers: Vec<String>,
}

/// HTTP client for the directory. The token handed out at registration is
/// attached to every subsequent call.
#[derive(Debug)]
pub struct Directory {
    base_url: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl Directory {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            token: RwLock::new(None),
        }
    }

    pub fn set_token(&self, token: String) {
        *self.token.write().unwrap() = Some(token);
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_status(&self, path: &str, body: serde_json::Value) -> Result<StatusResponse> {
        let mut req = self.client.post(self.url(path)).json(&body);
        if let Some(token) = self.token() {
            req = req.bearer_auth(token);
        }
        let res: StatusResponse = req.send().await?.json().await?;
        if res.status != "success" {
            return Err(DispatchError::Directory(format!(
                "{path} returned status {}",
                res.status
            )));
        }
        Ok(res)
    }

    /// Register a brand-new dispatcher; stores and returns the token.
    pub async fn new_dispatcher(&self, pub_hex: &str, ip: &str, port: u16) -> Result<String> {
        let res = self
            .post_status(
                "/dispatcher/new",
                serde_json::json!({"pub": pub_hex, "ip": ip, "port": port}),
            )
            .await?;
        let token = res
            .token
            .ok_or_else(|| DispatchError::Directory("registration returned no token".into()))?;
        self.set_token(token.clone());
        Ok(token)
    }

    pub async fn get_dispatchers(&self) -> Result<Vec<String>> {
        let res: DispatchersResponse = self
            .client
            .get(self.url("/dispatchers"))
            .send()
            .await?
            .json()
            .await?;
        Ok(res.dispatchers)
    }

    pub async fn wake(&self) -> Result<()> {
        self.post_status("/dispatcher/wake", serde_json::json!({}))
            .await
            .map(|_| ())
    }

    pub async fn sleep(&self) -> Result<()> {
        self.post_status("/dispatcher/sleep", serde_json::json!({}))
            .await
            .map(|_| ())
    }

    /// Liveness counters; failures here are logged by callers, never fatal.
    pub async fn connect_worker(&self) -> Result<()> {
        self.post_status("/worker/connect", serde_json::json!({}))
            .await
            .map(|_| ())
    }

    pub async fn disconnect_worker(&self) -> Result<()> {
        self.post_status("/worker/disconnect", serde_json::json!({}))
            .await
            .map(|_| ())
    }
}
