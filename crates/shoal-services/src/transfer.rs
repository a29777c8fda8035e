//! Store transfer API — the calls placement makes against store nodes.
//!
//! Stores expose a small JSON API on their export port. Byte movement
//! happens store-to-store: placement only tells the source to push.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use shoal_core::record::PeerRecord;

pub trait TransferApi: Send + Sync {
    /// Ask `source` to push `hash` to `destination`.
    fn send(
        &self,
        source: &PeerRecord,
        destination: &PeerRecord,
        hash: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Ask `store` to delete its copy of `hash`.
    fn remove(&self, store: &PeerRecord, hash: &str) -> impl Future<Output = Result<()>> + Send;

    /// Ask `store` to re-hash its copy and report whether it is intact.
    fn verify(&self, store: &PeerRecord, hash: &str) -> impl Future<Output = Result<bool>> + Send;

    fn exists(&self, store: &PeerRecord, hash: &str) -> impl Future<Output = Result<bool>> + Send;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendRequest {
    pub hash: String,
    pub destination: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
}

/// [`TransferApi`] over HTTP with `reqwest`.
#[derive(Clone)]
pub struct HttpTransfer {
    client: reqwest::Client,
}

impl HttpTransfer {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build transfer client")?;
        Ok(Self { client })
    }

    fn base_url(store: &PeerRecord) -> Result<String> {
        let port = store
            .port("export")
            .with_context(|| format!("{} advertises no export port", store.name))?;
        Ok(format!("http://{}:{}", store.host, port))
    }
}

impl TransferApi for HttpTransfer {
    async fn send(&self, source: &PeerRecord, destination: &PeerRecord, hash: &str) -> Result<()> {
        let url = format!("{}/content/{hash}/send", Self::base_url(source)?);
        let body = SendRequest {
            hash: hash.to_string(),
            destination: destination.name.clone(),
            host: destination.host.clone(),
            port: destination
                .port("export")
                .with_context(|| format!("{} advertises no export port", destination.name))?,
        };
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach {} at {url}", source.name))?
            .error_for_status()
            .with_context(|| format!("{} refused to send {hash}", source.name))?;
        Ok(())
    }

    async fn remove(&self, store: &PeerRecord, hash: &str) -> Result<()> {
        let url = format!("{}/content/{hash}", Self::base_url(store)?);
        self.client
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {} at {url}", store.name))?
            .error_for_status()
            .with_context(|| format!("{} refused to remove {hash}", store.name))?;
        Ok(())
    }

    async fn verify(&self, store: &PeerRecord, hash: &str) -> Result<bool> {
        let url = format!("{}/content/{hash}/verify", Self::base_url(store)?);
        let resp: VerifyResponse = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {} at {url}", store.name))?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse verify response")?;
        Ok(resp.valid)
    }

    async fn exists(&self, store: &PeerRecord, hash: &str) -> Result<bool> {
        let url = format!("{}/content/{hash}", Self::base_url(store)?);
        let resp = self
            .client
            .head(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {} at {url}", store.name))?;
        Ok(resp.status().is_success())
    }
}
