//! Cloudflare cache purging.
//!
//! Purge jobs run on a single-consumer queue so the API is never hit
//! concurrently. Each job carries at most [`URLS_PER_JOB`] URLs and is
//! retried up to [`MAX_ATTEMPTS`] times; rate-limit responses back off for
//! a minute, everything else for five seconds. A purge that ultimately
//! fails is logged and dropped — deletion never blocks on the CDN.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use crate::config::Config;

pub const URLS_PER_JOB: usize = 30;
pub const MAX_ATTEMPTS: u32 = 3;
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Auth {
    /// `Authorization: Bearer <token>` — preferred.
    ApiToken(String),
    /// `X-Auth-User-Service-Key`.
    UserServiceKey(String),
    /// `X-Auth-Key` + `X-Auth-Email` — legacy.
    KeyEmail(String, String),
}

#[derive(Clone)]
pub struct CdnPurger {
    tx: mpsc::UnboundedSender<Vec<String>>,
}

impl CdnPurger {
    /// Starts the purge worker when a zone and some form of credentials are
    /// configured; returns `None` otherwise.
    pub fn from_config(config: &Config, client: reqwest::Client) -> Option<Self> {
        let zone = config.cf_zone_id.clone()?;
        let auth = pick_auth(config)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(rx, client, zone, auth));
        Some(Self { tx })
    }

    /// Enqueues URLs for purging, pre-chunked to the API's batch size.
    /// Never blocks and never fails the caller.
    pub fn enqueue(&self, urls: Vec<String>) {
        for job in chunk_urls(urls) {
            if self.tx.send(job).is_err() {
                tracing::warn!("cdn purge worker is gone; dropping purge job");
                return;
            }
        }
    }
}

fn pick_auth(config: &Config) -> Option<Auth> {
    if let Some(token) = &config.cf_api_token {
        return Some(Auth::ApiToken(token.clone()));
    }
    if let Some(key) = &config.cf_user_service_key {
        return Some(Auth::UserServiceKey(key.clone()));
    }
    if let (Some(key), Some(email)) = (&config.cf_api_key, &config.cf_email) {
        return Some(Auth::KeyEmail(key.clone(), email.clone()));
    }
    None
}

fn chunk_urls(urls: Vec<String>) -> Vec<Vec<String>> {
    urls.chunks(URLS_PER_JOB).map(<[String]>::to_vec).collect()
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<Vec<String>>,
    client: reqwest::Client,
    zone: String,
    auth: Auth,
) {
    while let Some(job) = rx.recv().await {
        purge_with_retry(&client, &zone, &auth, &job).await;
    }
}

async fn purge_with_retry(client: &reqwest::Client, zone: &str, auth: &Auth, urls: &[String]) {
    let endpoint = format!("https://api.cloudflare.com/client/v4/zones/{zone}/purge_cache");

    for attempt in 1..=MAX_ATTEMPTS {
        let request = apply_auth(client.post(&endpoint), auth).json(&json!({ "files": urls }));

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(urls = urls.len(), "cdn purge succeeded");
                return;
            }
            Ok(response) => {
                let backoff = backoff_for_status(response.status().as_u16());
                tracing::warn!(
                    status = %response.status(),
                    attempt,
                    "cdn purge rejected, backing off {}s",
                    backoff.as_secs()
                );
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                }
            }
            Err(e) => {
                tracing::warn!(attempt, "cdn purge request failed: {e}");
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    tracing::error!(urls = urls.len(), "cdn purge gave up after {MAX_ATTEMPTS} attempts");
}

fn apply_auth(request: reqwest::RequestBuilder, auth: &Auth) -> reqwest::RequestBuilder {
    match auth {
        Auth::ApiToken(token) => request.bearer_auth(token),
        Auth::UserServiceKey(key) => request.header("X-Auth-User-Service-Key", key),
        Auth::KeyEmail(key, email) => request
            .header("X-Auth-Key", key)
            .header("X-Auth-Email", email),
    }
}

fn backoff_for_status(status: u16) -> Duration {
    if status == 429 {
        RATE_LIMIT_BACKOFF
    } else {
        ERROR_BACKOFF
    }
}
