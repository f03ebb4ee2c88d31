use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recall_config::MemoryLlmConfig;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::{Value, json};
use tracing::{debug, warn};

const FALLBACK_COOLDOWN: Duration = Duration::from_secs(600);
const MIN_COOLDOWN: Duration = Duration::from_secs(1);

/// Hosted text-completion service.
///
/// Implementations do not retry; a failed call surfaces to the caller.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Complete `prompt`. `model_hint` may be empty or name a preferred model.
    async fn complete(&self, prompt: &str, model_hint: &str) -> anyhow::Result<String>;
}

/// OpenAI-compatible `/chat/completions` client.
///
/// A model answering 429 or a quota error is parked for its `Retry-After`
/// period and the request moves to the next model in the pool. Any other
/// failure is returned as is.
pub struct ApiClient {
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
    pool: Mutex<ModelPool>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str, models_csv: &str) -> anyhow::Result<Self> {
        let pool = ModelPool::from_csv(models_csv)
            .ok_or_else(|| anyhow!("no completion models configured (memory.llm.models)"))?;
        Ok(Self {
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
            pool: Mutex::new(pool),
        })
    }

    pub fn from_config(config: &MemoryLlmConfig) -> anyhow::Result<Self> {
        Self::new(&config.base_url, &config.api_key, &config.models)
    }

    fn with_pool<T>(&self, f: impl FnOnce(&mut ModelPool) -> T) -> anyhow::Result<T> {
        let mut pool = self
            .pool
            .lock()
            .map_err(|_| anyhow!("completion model pool lock poisoned"))?;
        Ok(f(&mut pool))
    }

    async fn post(&self, model: &str, prompt: &str) -> anyhow::Result<Reply> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": 0.1
            }))
            .send()
            .await
            .with_context(|| format!("completion request to {model} failed"))?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let body = response
            .text()
            .await
            .with_context(|| format!("reading completion body from {model} failed"))?;

        if status.is_success() {
            return extract_message(&body).map(Reply::Text);
        }
        if is_throttled(status, &body) {
            return Ok(Reply::Throttled {
                cooldown: retry_after.unwrap_or(FALLBACK_COOLDOWN),
            });
        }
        bail!("completion request to {model} returned {status}: {body}")
    }
}

enum Reply {
    Text(String),
    Throttled { cooldown: Duration },
}

#[async_trait]
impl CompletionClient for ApiClient {
    /// Each model is tried at most once per call; a throttled model is parked
    /// and the call moves on, failing once every model has answered.
    async fn complete(&self, prompt: &str, model_hint: &str) -> anyhow::Result<String> {
        let mut tried = BTreeSet::new();
        let mut hint = model_hint;
        loop {
            let Some(model) = self.with_pool(|pool| pool.select_untried(hint, &tried))? else {
                if tried.is_empty() {
                    bail!("every completion model is cooling down after rate limiting");
                }
                let tried: Vec<String> = tried.into_iter().collect();
                bail!("every completion model is rate limited (tried {})", tried.join(", "));
            };
            debug!(%model, "requesting completion");
            tried.insert(model.clone());

            match self.post(&model, prompt).await? {
                Reply::Text(text) => return Ok(text),
                Reply::Throttled { cooldown } => {
                    let cooldown = cooldown.max(MIN_COOLDOWN);
                    self.with_pool(|pool| pool.cool_down(&model, cooldown))?;
                    warn!(
                        %model,
                        cooldown_secs = cooldown.as_secs(),
                        "completion model throttled"
                    );
                    hint = "";
                }
            }
        }
    }
}

/// Ordered set of interchangeable models with per-model cooldowns.
#[derive(Debug, Clone)]
pub struct ModelPool {
    models: Vec<String>,
    parked_until: BTreeMap<String, Instant>,
    cursor: usize,
}

impl ModelPool {
    /// `None` when the list holds no model names.
    pub fn from_csv(models_csv: &str) -> Option<Self> {
        let models: Vec<String> = models_csv
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        (!models.is_empty()).then(|| Self {
            models,
            parked_until: BTreeMap::new(),
            cursor: 0,
        })
    }

    /// The hinted model when it is in the pool and usable, otherwise the
    /// next usable model in round-robin order.
    pub fn select(&mut self, hint: &str) -> Option<String> {
        self.select_untried(hint, &BTreeSet::new())
    }

    /// Like [`ModelPool::select`], never returning a model in `tried`.
    pub fn select_untried(&mut self, hint: &str, tried: &BTreeSet<String>) -> Option<String> {
        self.release_expired();
        let hint = hint.trim();
        if let Some(model) = self
            .models
            .iter()
            .find(|model| model.as_str() == hint && self.is_usable(model, tried))
        {
            return Some(model.clone());
        }
        let offset = self.first_usable_offset(tried)?;
        let index = (self.cursor + offset) % self.models.len();
        self.cursor = index + 1;
        Some(self.models[index].clone())
    }

    /// The model the next un-hinted [`ModelPool::select`] would return.
    pub fn upcoming(&mut self) -> Option<String> {
        self.release_expired();
        let offset = self.first_usable_offset(&BTreeSet::new())?;
        Some(self.models[(self.cursor + offset) % self.models.len()].clone())
    }

    pub fn cool_down(&mut self, model: &str, period: Duration) {
        self.parked_until
            .insert(model.to_string(), Instant::now() + period);
    }

    pub fn is_exhausted(&self) -> bool {
        self.models.iter().all(|model| self.is_parked(model))
    }

    fn first_usable_offset(&self, tried: &BTreeSet<String>) -> Option<usize> {
        let len = self.models.len();
        (0..len).find(|offset| self.is_usable(&self.models[(self.cursor + offset) % len], tried))
    }

    fn is_usable(&self, model: &str, tried: &BTreeSet<String>) -> bool {
        !tried.contains(model) && !self.is_parked(model)
    }

    fn is_parked(&self, model: &str) -> bool {
        self.parked_until
            .get(model)
            .is_some_and(|until| *until > Instant::now())
    }

    fn release_expired(&mut self) {
        let now = Instant::now();
        self.parked_until.retain(|_, until| *until > now);
    }
}

fn is_throttled(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let body = body.to_ascii_lowercase();
    ["rate_limit", "rate limit", "quota"]
        .iter()
        .any(|marker| body.contains(marker))
}

/// `Retry-After` as delta-seconds or an HTTP date.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at: DateTime<Utc> = DateTime::parse_from_rfc2822(value).ok()?.into();
    let secs = (at - Utc::now()).num_seconds().max(0);
    Some(Duration::from_secs(secs.unsigned_abs()))
}

fn extract_message(body: &str) -> anyhow::Result<String> {
    let parsed: Value =
        serde_json::from_str(body).context("completion response is not valid JSON")?;
    parsed
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("completion response has no choices[0].message.content"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const THROTTLED: &str = "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 0\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}";

    fn ok_reply(content: &str) -> String {
        let body = json!({"choices": [{"message": {"content": content}}]}).to_string();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Serves `reply(request_index, request_text)` for every connection and
    /// returns the base URL plus a request counter.
    async fn serve(
        reply: impl Fn(usize, &str) -> String + Send + Sync + 'static,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let request = read_request(&mut stream).await;
                let index = seen.fetch_add(1, Ordering::SeqCst);
                let response = reply(index, &request);
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (format!("http://{addr}/v1"), count)
    }

    fn pool(models: &str) -> ModelPool {
        ModelPool::from_csv(models).unwrap()
    }

    #[test]
    fn test_pool_rejects_empty_list() {
        assert!(ModelPool::from_csv("").is_none());
        assert!(ModelPool::from_csv(" , ,").is_none());
    }

    #[test]
    fn test_select_round_robins() {
        let mut pool = pool("m1, m2");
        assert_eq!(pool.select("").as_deref(), Some("m1"));
        assert_eq!(pool.select("").as_deref(), Some("m2"));
        assert_eq!(pool.select("").as_deref(), Some("m1"));
    }

    #[test]
    fn test_select_prefers_usable_hint() {
        let mut pool = pool("m1,m2");
        assert_eq!(pool.select("m2").as_deref(), Some("m2"));
        assert_eq!(pool.select("not-in-pool").as_deref(), Some("m1"));

        pool.cool_down("m2", Duration::from_secs(60));
        assert_eq!(pool.select("m2").as_deref(), Some("m1"));
    }

    #[test]
    fn test_parked_model_is_skipped_until_expiry() {
        let mut pool = pool("m1,m2,m3");
        pool.cool_down("m1", Duration::from_secs(60));
        assert_eq!(pool.upcoming().as_deref(), Some("m2"));
        assert_eq!(pool.select("").as_deref(), Some("m2"));

        pool.cool_down("m3", Duration::ZERO);
        assert_eq!(pool.select("").as_deref(), Some("m3"));
    }

    #[test]
    fn test_exhausted_pool_selects_nothing() {
        let mut pool = pool("m1,m2");
        pool.cool_down("m1", Duration::from_secs(60));
        pool.cool_down("m2", Duration::from_secs(60));
        assert!(pool.is_exhausted());
        assert_eq!(pool.select("m1"), None);
        assert_eq!(pool.upcoming(), None);
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("45"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_retry_after_past_date_is_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn test_throttle_detection() {
        assert!(is_throttled(StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(is_throttled(
            StatusCode::FORBIDDEN,
            r#"{"error":{"type":"insufficient_quota"}}"#
        ));
        assert!(!is_throttled(StatusCode::BAD_GATEWAY, "upstream down"));
    }

    #[test]
    fn test_extract_message() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"- did things"}}]}"#;
        assert_eq!(extract_message(body).unwrap(), "- did things");
        assert!(extract_message(r#"{"choices":[]}"#).is_err());
        assert!(extract_message("<html>").is_err());
    }

    #[tokio::test]
    async fn test_complete_gives_up_after_each_model_is_throttled() {
        let (base_url, requests) = serve(|_, _| THROTTLED.to_string()).await;
        let client = ApiClient::new(&base_url, "k", "m1,m2").unwrap();

        let result =
            tokio::time::timeout(Duration::from_secs(10), client.complete("hi", "")).await;
        let err = result.expect("complete must return").unwrap_err();
        assert!(err.to_string().contains("rate limited"), "{err}");
        assert_eq!(requests.load(Ordering::SeqCst), 2);

        // Zero Retry-After still parks the models for a moment.
        let err = client.complete("hi", "").await.unwrap_err();
        assert!(err.to_string().contains("cooling down"), "{err}");
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_complete_fails_over_to_next_model() {
        let (base_url, requests) = serve(|index, request| {
            if index == 0 {
                assert!(request.contains(r#""model":"m1""#), "{request}");
                THROTTLED.to_string()
            } else {
                assert!(request.contains(r#""model":"m2""#), "{request}");
                ok_reply("- summarized")
            }
        })
        .await;
        let client = ApiClient::new(&base_url, "k", "m1,m2").unwrap();

        let text = client.complete("hi", "m1").await.unwrap();
        assert_eq!(text, "- summarized");
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_complete_surfaces_other_failures_without_retry() {
        let (base_url, requests) = serve(|_, _| {
            "HTTP/1.1 502 Bad Gateway\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndown"
                .to_string()
        })
        .await;
        let client = ApiClient::new(&base_url, "k", "m1,m2").unwrap();

        let err = client.complete("hi", "").await.unwrap_err();
        assert!(err.to_string().contains("502"), "{err}");
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_select_untried_skips_tried_models() {
        let mut pool = pool("m1,m2");
        let tried = BTreeSet::from(["m1".to_string()]);
        assert_eq!(pool.select_untried("m1", &tried).as_deref(), Some("m2"));
        let tried = BTreeSet::from(["m1".to_string(), "m2".to_string()]);
        assert_eq!(pool.select_untried("", &tried), None);
    }

    #[test]
    fn test_client_needs_models_and_normalizes_url() {
        assert!(ApiClient::new("https://llm.example/v1", "k", "").is_err());
        let client = ApiClient::new("https://llm.example/v1/", "k", "m1").unwrap();
        assert_eq!(client.endpoint, "https://llm.example/v1/chat/completions");
    }
}
