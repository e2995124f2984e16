//! HTTP client for querying partitions served by peer nodes.

use super::RemotePlanPIndex;
use crate::pindex::kvlite::KvLiteQueryResults;
use crate::{Error, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

/// Client for one remote partition's query and count endpoints.
pub struct IndexClient {
    pub query_url: String,
    pub count_url: String,
    http: reqwest::Client,
}

impl IndexClient {
    /// Build a client for a peer's pindex endpoints:
    /// `http://<hostPort>/api/pindex/<name>/{query,count}`.
    pub fn for_pindex(remote: &RemotePlanPIndex) -> Self {
        let base = format!(
            "http://{}/api/pindex/{}",
            remote.node_def.host_port, remote.plan_pindex.name
        );
        Self::new(format!("{base}/query"), format!("{base}/count"))
    }

    pub fn new(query_url: String, count_url: String) -> Self {
        Self {
            query_url,
            count_url,
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the remote partition's document count.
    pub async fn count(&self, cancel: CancellationToken) -> Result<u64> {
        let send = async {
            let resp = self
                .http
                .get(&self.count_url)
                .send()
                .await?
                .error_for_status()?;
            let body: CountResponse = resp.json().await?;
            Ok::<u64, Error>(body.count)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            rv = send => rv,
        }
    }

    /// Issue a query against the remote partition. The request carries
    /// the full envelope, including the consistency vector, so the peer
    /// applies its own waits over the partitions it serves.
    pub async fn query(
        &self,
        req: &serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<KvLiteQueryResults> {
        let send = async {
            let resp = self
                .http
                .post(&self.query_url)
                .json(req)
                .send()
                .await?
                .error_for_status()?;
            let body: KvLiteQueryResults = resp.json().await?;
            Ok::<KvLiteQueryResults, Error>(body)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            rv = send => rv,
        }
    }
}
