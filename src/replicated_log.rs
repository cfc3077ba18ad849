//! Leader-based synchronous fan-out replication (§4.8, component C8).
//!
//! Grounded on `original_source/pspf/log/replicated_log.py`
//! (`ReplicatedLog`): acquire leadership, write locally, fan out to every
//! other registered node, return once local write and all peer attempts
//! have settled. §9 open question 1 resolves the "TODO: Handle failures?"
//! in that source to *best-effort* fan-out -- a slow or dead peer never
//! blocks the leader, and failures are logged, not retried here.
//!
//! HTTP client setup follows the `reqwest::Client::builder()` idiom used for
//! service discovery in `networking::discovery::consul`; the follower-side
//! endpoint uses the `axum::Router` + `State` shape from `api::rest::server`,
//! trimmed to the one route this component needs.

use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{BoxError, Json, Router};
use tower::ServiceBuilder;

use crate::cluster::ClusterRegistry;
use crate::error::{FluxError, Result};
use crate::log::PartitionedLog;
use crate::record::Record;
use crate::stores::DedupStore;

/// Wraps a [`PartitionedLog`] with leadership-gated appends and best-effort
/// replication to the rest of the cluster.
pub struct ReplicatedLog {
    local: Arc<PartitionedLog>,
    registry: Arc<dyn ClusterRegistry>,
    dedup: Arc<dyn DedupStore>,
    http: reqwest::Client,
    lease_ttl: Duration,
}

impl ReplicatedLog {
    pub fn new(local: Arc<PartitionedLog>, registry: Arc<dyn ClusterRegistry>, dedup: Arc<dyn DedupStore>, replication_timeout: Duration, lease_ttl: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(replication_timeout)
            .build()
            .map_err(|e| FluxError::StoreUnavailable(e.to_string()))?;
        Ok(Self {
            local,
            registry,
            dedup,
            http,
            lease_ttl,
        })
    }

    pub fn partitions(&self) -> u32 {
        self.local.partitions()
    }

    pub fn high_watermark(&self, partition: u32) -> u64 {
        self.local.high_watermark(partition)
    }

    pub fn read(&self, partition: u32, from_offset: u64) -> Result<Vec<Record>> {
        self.local.read(partition, from_offset)
    }

    /// Leader-path append: requires this node to hold (or acquire) the
    /// partition's leadership before writing, then fans the record out to
    /// every other live node on a best-effort basis.
    pub async fn append(&self, record: Record) -> Result<Record> {
        let partition = crate::config::hash_partition(&record.key, self.local.partitions());
        if !self.registry.try_lead(partition, self.lease_ttl).await? {
            return Err(FluxError::NotLeader(partition));
        }

        let written = self.local.append(record)?;

        let peers = self.registry.get_other_nodes().await?;
        if peers.is_empty() {
            return Ok(written);
        }

        let attempts = peers.into_iter().map(|peer| {
            let http = self.http.clone();
            let record = written.clone();
            async move {
                let url = format!("http://{}:{}/internal/replicate", peer.host, peer.port);
                match http.post(&url).json(&record).send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => tracing::warn!(peer = %peer.node_id, status = %resp.status(), "replica rejected record"),
                    Err(e) => tracing::warn!(peer = %peer.node_id, error = %e, "failed to replicate record"),
                }
            }
        });
        futures_join_all(attempts).await;

        Ok(written)
    }

    /// Follower-side ingest: appends directly, bypassing the leadership
    /// check, and is idempotent by consulting dedup since the leader may
    /// retry a send the follower already applied.
    pub async fn append_follower(&self, record: Record) -> Result<()> {
        if self.dedup.has_processed(record.id).await? {
            return Ok(());
        }
        self.local.append_at(record.clone())?;
        self.dedup.mark_processed(record.id, Duration::from_secs(86_400)).await?;
        Ok(())
    }
}

async fn futures_join_all<I>(iter: I)
where
    I: IntoIterator,
    I::Item: std::future::Future<Output = ()> + Send + 'static,
{
    let mut handles = Vec::new();
    for fut in iter {
        handles.push(tokio::spawn(fut));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

/// Builds the follower-ingest router: `POST /internal/replicate`. A timeout
/// layer bounds how long a single ingest may take, matching the "no
/// operation blocks indefinitely without a supervised cancel path" rule of
/// §5 on the receiving side of replication, not just the sending side.
pub fn follower_router(log: Arc<ReplicatedLog>, request_timeout: Duration) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(|_: BoxError| async { StatusCode::REQUEST_TIMEOUT }))
        .timeout(request_timeout);

    Router::new().route("/internal/replicate", post(replicate_handler)).layer(middleware).with_state(log)
}

async fn replicate_handler(State(log): State<Arc<ReplicatedLog>>, Json(record): Json<Record>) -> Response {
    match log.append_follower(record).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "follower ingest failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterTable, InMemoryClusterRegistry};
    use crate::stores::InMemoryDedupStore;

    fn record() -> Record {
        Record::new(b"k".to_vec(), b"v".to_vec(), "t", 0)
    }

    #[tokio::test]
    async fn append_without_leadership_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(PartitionedLog::open(dir.path(), 1, 1024 * 1024).unwrap());
        let table = ClusterTable::new();
        let a = Arc::new(InMemoryClusterRegistry::new(table.clone(), "a", 9000));
        let b = Arc::new(InMemoryClusterRegistry::new(table.clone(), "b", 9001));

        // b claims leadership of partition 0 first.
        assert!(b.try_lead(0, Duration::from_secs(10)).await.unwrap());

        let replicated = ReplicatedLog::new(log, a, Arc::new(InMemoryDedupStore::new()), Duration::from_secs(2), Duration::from_secs(10)).unwrap();
        let err = replicated.append(record()).await.unwrap_err();
        assert!(matches!(err, FluxError::NotLeader(_)));
    }

    #[tokio::test]
    async fn leader_append_with_no_peers_succeeds_locally() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(PartitionedLog::open(dir.path(), 1, 1024 * 1024).unwrap());
        let table = ClusterTable::new();
        let registry = Arc::new(InMemoryClusterRegistry::new(table, "a", 9000));
        let replicated = ReplicatedLog::new(log, registry, Arc::new(InMemoryDedupStore::new()), Duration::from_secs(2), Duration::from_secs(10)).unwrap();

        let written = replicated.append(record()).await.unwrap();
        assert_eq!(written.offset, 0);
        assert_eq!(replicated.high_watermark(0), 1);
    }

    #[tokio::test]
    async fn follower_ingest_is_idempotent_by_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(PartitionedLog::open(dir.path(), 1, 1024 * 1024).unwrap());
        let table = ClusterTable::new();
        let registry = Arc::new(InMemoryClusterRegistry::new(table, "a", 9000));
        let replicated = ReplicatedLog::new(log, registry, Arc::new(InMemoryDedupStore::new()), Duration::from_secs(2), Duration::from_secs(10)).unwrap();

        let r = record();
        replicated.append_follower(r.clone()).await.unwrap();
        replicated.append_follower(r).await.unwrap();
        assert_eq!(replicated.high_watermark(0), 1, "duplicate follower ingest must not double-append");
    }
}
