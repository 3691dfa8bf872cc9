use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::LookupError;

/// One record returned by the user-lookup service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

/// External service resolving user ids to avatar references.
#[async_trait]
pub trait UserLookup: Send + Sync {
    /// Resolve a batch of ids. Ids the service does not know may be omitted.
    async fn lookup(&self, user_ids: &[String]) -> Result<Vec<UserRecord>, LookupError>;
}

/// Used when no lookup service is configured: every user resolves to "no
/// avatar" without a network call.
pub struct NoopUserLookup;

#[async_trait]
impl UserLookup for NoopUserLookup {
    async fn lookup(&self, user_ids: &[String]) -> Result<Vec<UserRecord>, LookupError> {
        Ok(user_ids
            .iter()
            .map(|id| UserRecord {
                id: id.clone(),
                avatar_ref: None,
            })
            .collect())
    }
}

#[derive(Serialize)]
struct LookupRequest<'a> {
    ids: &'a [String],
}

/// HTTP client for the user-lookup service: `POST {url}` with
/// `{"ids": [...]}`, answered by a JSON array of [`UserRecord`].
#[derive(Debug, Clone)]
pub struct HttpUserLookup {
    http: Client,
    url: String,
}

impl HttpUserLookup {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, LookupError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("liveclass/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LookupError::Http(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl UserLookup for HttpUserLookup {
    async fn lookup(&self, user_ids: &[String]) -> Result<Vec<UserRecord>, LookupError> {
        let resp = self
            .http
            .post(&self.url)
            .json(&LookupRequest { ids: user_ids })
            .send()
            .await
            .map_err(|e| LookupError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(LookupError::Remote(format!(
                "user lookup returned {}",
                resp.status()
            )));
        }
        resp.json::<Vec<UserRecord>>()
            .await
            .map_err(|e| LookupError::Decode(e.to_string()))
    }
}

/// Removes claimed ids from the in-flight map even when the resolving
/// future is dropped mid-lookup.
struct InFlightClaim<'a> {
    in_flight: &'a DashMap<String, watch::Receiver<()>>,
    user_ids: Vec<String>,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        for id in &self.user_ids {
            self.in_flight.remove(id);
        }
    }
}

/// Process-wide user id -> avatar reference cache.
///
/// Entries are never invalidated; the cache is size-bounded so a long-running
/// process cannot grow it without limit. Ids being looked up are tracked so
/// two rooms resolving the same user share one lookup.
pub struct AvatarCache {
    entries: moka::future::Cache<String, Option<String>>,
    in_flight: DashMap<String, watch::Receiver<()>>,
    lookup: Arc<dyn UserLookup>,
}

impl AvatarCache {
    pub fn new(lookup: Arc<dyn UserLookup>, max_entries: u64) -> Self {
        Self {
            entries: moka::future::Cache::builder()
                .max_capacity(max_entries)
                .build(),
            in_flight: DashMap::new(),
            lookup,
        }
    }

    /// Cached avatar for a user. `None` both for "unknown yet" and "has no
    /// avatar".
    pub async fn avatar(&self, user_id: &str) -> Option<String> {
        self.entries.get(user_id).await.flatten()
    }

    pub fn is_resolved(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Make sure every id has been looked up at least once. Missing ids are
    /// fetched in a single batch; ids already being fetched elsewhere are
    /// awaited instead of fetched again. Failures leave ids unresolved so a
    /// later call retries them.
    pub async fn resolve(&self, user_ids: &[String]) {
        let mut seen = HashSet::new();
        let mut claimed = Vec::new();
        let mut waiting = Vec::new();
        let (done_tx, done_rx) = watch::channel(());

        for id in user_ids {
            if !seen.insert(id.as_str()) || self.entries.contains_key(id) {
                continue;
            }
            match self.in_flight.entry(id.clone()) {
                Entry::Occupied(pending) => waiting.push(pending.get().clone()),
                Entry::Vacant(slot) => {
                    slot.insert(done_rx.clone());
                    claimed.push(id.clone());
                }
            }
        }

        if !claimed.is_empty() {
            let claim = InFlightClaim {
                in_flight: &self.in_flight,
                user_ids: claimed,
            };
            match self.lookup.lookup(&claim.user_ids).await {
                Ok(records) => {
                    for record in records {
                        if claim.user_ids.contains(&record.id) {
                            self.entries.insert(record.id, record.avatar_ref).await;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        users = claim.user_ids.len(),
                        "avatar lookup failed, continuing without avatars: {e}"
                    );
                }
            }
            drop(claim);
        }
        drop(done_tx);

        for mut pending in waiting {
            // Resolves once the owning lookup finishes or is dropped.
            let _ = pending.changed().await;
        }
    }
}
