use crate::error::{AUTH_FETCH_ME_FAILED, CHART_FETCH_FAILED, NET_REQUEST_TIMEOUT, RECORD_FETCH_FAILED};
use anyhow::{bail, Result};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::warn;

const ME_TIMEOUT: Duration = Duration::from_secs(8);
const CHART_TIMEOUT: Duration = Duration::from_secs(8);
const RECORD_TIMEOUT: Duration = Duration::from_secs(8);
const QUOTE_TIMEOUT: Duration = Duration::from_secs(3);
const QUOTE_TTL: Duration = Duration::from_millis(60_000);

#[derive(Debug, Deserialize)]
pub struct UpstreamUserInfo {
    pub id: i32,
    pub name: String,
    pub language: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Chart {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Record {
    pub id: i32,
    pub player: i32,
    pub score: i32,
    pub perfect: i32,
    pub good: i32,
    pub bad: i32,
    pub miss: i32,
    pub max_combo: i32,
    pub accuracy: f32,
    pub full_combo: bool,
    pub std: f32,
    pub std_score: f32,
}

struct QuoteCache {
    value: Option<(tokio::time::Instant, Arc<str>)>,
}

/// Client for the upstream identity service: bounded-timeout `/me`,
/// `/chart/{id}`, `/record/{id}` lookups, plus a cached, coalesced fetch of
/// the banner's decorative quote.
///
/// The quote cache's mutex is held across the upstream call while
/// refreshing: concurrent callers that land inside that window simply wait
/// for the in-flight fetch instead of issuing their own, which is what
/// gives a burst of authentications at most one upstream quote request.
pub struct IdentityClient {
    client: reqwest::Client,
    host: String,
    quote_cache: Mutex<QuoteCache>,
}

impl IdentityClient {
    pub fn new(host: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            host,
            quote_cache: Mutex::new(QuoteCache { value: None }),
        }
    }

    pub async fn me(&self, token: &str) -> Result<UpstreamUserInfo> {
        let resp = tokio::time::timeout(
            ME_TIMEOUT,
            self.client
                .get(format!("{}/me", self.host))
                .header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"))
                .send(),
        )
        .await
        .map_err(|_| anyhow::anyhow!(NET_REQUEST_TIMEOUT))?;

        let resp = match resp.and_then(|it| it.error_for_status()) {
            Ok(resp) => resp,
            Err(err) => {
                warn!("failed to fetch /me: {err:?}");
                bail!(AUTH_FETCH_ME_FAILED);
            }
        };
        resp.json().await.map_err(|err| {
            warn!("failed to decode /me response: {err:?}");
            anyhow::anyhow!(AUTH_FETCH_ME_FAILED)
        })
    }

    pub async fn chart(&self, id: i32) -> Result<Chart> {
        let resp = tokio::time::timeout(
            CHART_TIMEOUT,
            self.client.get(format!("{}/chart/{id}", self.host)).send(),
        )
        .await
        .map_err(|_| anyhow::anyhow!(NET_REQUEST_TIMEOUT))?;

        let resp = match resp.and_then(|it| it.error_for_status()) {
            Ok(resp) => resp,
            Err(err) => {
                warn!("failed to fetch chart {id}: {err:?}");
                bail!(CHART_FETCH_FAILED);
            }
        };
        resp.json()
            .await
            .map_err(|_| anyhow::anyhow!(CHART_FETCH_FAILED))
    }

    pub async fn record(&self, id: i32) -> Result<Record> {
        let resp = tokio::time::timeout(
            RECORD_TIMEOUT,
            self.client.get(format!("{}/record/{id}", self.host)).send(),
        )
        .await
        .map_err(|_| anyhow::anyhow!(NET_REQUEST_TIMEOUT))?;

        let resp = match resp.and_then(|it| it.error_for_status()) {
            Ok(resp) => resp,
            Err(err) => {
                warn!("failed to fetch record {id}: {err:?}");
                bail!(RECORD_FETCH_FAILED);
            }
        };
        resp.json()
            .await
            .map_err(|_| anyhow::anyhow!(RECORD_FETCH_FAILED))
    }

    /// A short inspirational line decorating the welcome banner. Failures
    /// are non-fatal to the caller: on upstream error this returns `Ok("")`
    /// since a missing quote must never block authentication. A failed
    /// fetch is not cached, so the next caller (even one landing inside
    /// what would've been the TTL window) tries again rather than being
    /// stuck with a blank quote for a full 60s after a transient blip.
    pub async fn quote(&self) -> Result<Arc<str>> {
        let mut guard = self.quote_cache.lock().await;
        if let Some((fetched_at, value)) = &guard.value {
            if fetched_at.elapsed() < QUOTE_TTL {
                return Ok(Arc::clone(value));
            }
        }
        let fetched: Result<String> = async {
            Ok(tokio::time::timeout(
                QUOTE_TIMEOUT,
                self.client.get(format!("{}/quote", self.host)).send(),
            )
            .await??
            .error_for_status()?
            .text()
            .await?)
        }
        .await;
        match fetched {
            Ok(text) => {
                let value: Arc<str> = text.into();
                guard.value = Some((tokio::time::Instant::now(), Arc::clone(&value)));
                Ok(value)
            }
            Err(err) => {
                warn!("failed to fetch banner quote: {err:?}");
                Ok("".into())
            }
        }
    }
}
