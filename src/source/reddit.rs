use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SourceSettings;
use crate::error::{Error, Result};
use crate::source::{ContentItem, ContentSource, Credentials, Cursor, ItemKind, RateSignal, Reply};

/// Refresh the token this long before the platform says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Longest reset window accepted from `x-ratelimit-reset`.
const MAX_RATE_RESET: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// OAuth client for the Reddit API, authenticated as a script app.
pub struct RedditClient {
    http: Client,
    credentials: Credentials,
    api_url: String,
    auth_url: String,
    page_limit: u32,
    token: RwLock<Option<AccessToken>>,
}

impl RedditClient {
    pub fn new(credentials: Credentials, settings: &SourceSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout))
            .user_agent(settings.user_agent.clone())
            .gzip(true)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            credentials,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            auth_url: settings.auth_url.trim_end_matches('/').to_string(),
            page_limit: settings.page_limit,
            token: RwLock::new(None),
        })
    }

    /// Run the password grant and cache the resulting access token.
    pub async fn login(&self) -> Result<()> {
        let url = format!("{}/api/v1/access_token", self.auth_url);
        debug!("Requesting access token from {}", url);

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.credentials.app_id, Some(&self.credentials.app_secret))
            .form(&[
                ("grant_type", "password"),
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::Http(format!("Token endpoint returned HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "Token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let body: TokenResponse = response.json().await?;
        let value = match (body.access_token, body.error) {
            (Some(token), None) => token,
            (_, Some(error)) => return Err(Error::Auth(format!("Login rejected: {}", error))),
            (None, None) => {
                return Err(Error::Auth("Token endpoint returned no access token".to_string()))
            }
        };

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(3600));
        *self.token.write() = Some(AccessToken {
            value,
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });

        info!(username = %self.credentials.username, "Logged in");
        Ok(())
    }

    async fn bearer(&self) -> Result<String> {
        let cached = self
            .token
            .read()
            .clone()
            .filter(|t| Instant::now() < t.expires_at)
            .map(|t| t.value);
        if let Some(token) = cached {
            return Ok(token);
        }

        self.login().await?;
        self.token
            .read()
            .clone()
            .map(|t| t.value)
            .ok_or_else(|| Error::Auth("No access token after login".to_string()))
    }

    fn invalidate_token(&self) {
        *self.token.write() = None;
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<RequestBuilder> {
        let token = self.bearer().await?;
        Ok(self
            .http
            .get(format!("{}{}", self.api_url, path))
            .bearer_auth(token)
            .query(query)
            .query(&[("raw_json", "1")]))
    }

    async fn post(&self, path: &str, form: &[(&str, String)]) -> Result<RequestBuilder> {
        let token = self.bearer().await?;
        Ok(self
            .http
            .post(format!("{}{}", self.api_url, path))
            .bearer_auth(token)
            .form(form))
    }

    async fn execute<T: DeserializeOwned>(&self, request: Result<RequestBuilder>) -> Reply<T> {
        let request = match request {
            Ok(request) => request,
            Err(err) => return Reply::err(err),
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return Reply::err(err.into()),
        };

        let rate = rate_signal(response.headers());
        let status = response.status();

        let outcome = if status.is_success() {
            response.json::<T>().await.map_err(Error::from)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(self.status_error(status, body))
        };

        Reply::new(outcome, rate)
    }

    fn status_error(&self, status: StatusCode, body: String) -> Error {
        let message = truncate(&body, 200);
        match status {
            StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(format!(
                "upstream is throttling us despite the local gate: {}",
                message
            )),
            StatusCode::UNAUTHORIZED => {
                warn!("Access token rejected; will log in again");
                self.invalidate_token();
                Error::Http(format!("HTTP 401: {}", message))
            }
            s if s.is_server_error() => Error::Http(format!("HTTP {}: {}", s.as_u16(), message)),
            s => Error::Rejected {
                status: s.as_u16(),
                message,
            },
        }
    }

    fn user_listing_query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("sort", "new".to_string()),
            ("limit", self.page_limit.to_string()),
        ]
    }
}

#[async_trait]
impl ContentSource for RedditClient {
    async fn fetch_new_items(
        &self,
        collection: &str,
        cursor: &Cursor,
    ) -> Reply<(Vec<ContentItem>, Cursor)> {
        let mut query = vec![("limit", self.page_limit.to_string())];
        // Listings run newest-first, so "before" selects items newer than the anchor.
        if let Some(newest) = &cursor.newest {
            query.push(("before", newest.clone()));
        }

        let request = self.get(&format!("/r/{}/new", collection), &query).await;
        let reply: Reply<Listing<PostData>> = self.execute(request).await;

        let Reply { outcome, rate } = reply;
        let outcome = outcome.map(|listing| {
            let posts: Vec<PostData> = listing.data.children.into_iter().map(|c| c.data).collect();
            let next = advance_cursor(cursor, &posts);
            (posts.into_iter().map(ContentItem::from).collect(), next)
        });
        Reply::new(outcome, rate)
    }

    async fn fetch_author_posts(&self, author_name: &str) -> Reply<Vec<ContentItem>> {
        let request = self
            .get(&format!("/user/{}/submitted", author_name), &self.user_listing_query())
            .await;
        let reply: Reply<Listing<PostData>> = self.execute(request).await;
        map_reply(reply, |listing| {
            listing
                .data
                .children
                .into_iter()
                .map(|c| ContentItem::from(c.data))
                .collect()
        })
    }

    async fn fetch_author_comments(&self, author_name: &str) -> Reply<Vec<ContentItem>> {
        let request = self
            .get(&format!("/user/{}/comments", author_name), &self.user_listing_query())
            .await;
        let reply: Reply<Listing<CommentData>> = self.execute(request).await;
        map_reply(reply, |listing| {
            listing
                .data
                .children
                .into_iter()
                .map(|c| ContentItem::from(c.data))
                .collect()
        })
    }

    async fn cross_post(
        &self,
        item: &ContentItem,
        destination: &str,
    ) -> Reply<Option<ContentItem>> {
        let form = [
            ("api_type", "json".to_string()),
            ("kind", "crosspost".to_string()),
            ("sr", destination.to_string()),
            ("title", item.title.clone()),
            ("url", item.url.clone()),
            ("crosspost_fullname", item.full_id.clone()),
            ("resubmit", "false".to_string()),
            ("sendreplies", "false".to_string()),
        ];
        let request = self.post("/api/submit", &form).await;
        let reply: Reply<SubmitResponse> = self.execute(request).await;

        let Reply { outcome, rate } = reply;
        let outcome = outcome.and_then(|body| {
            if let Some(error) = body.json.errors.first() {
                let code = error.first().cloned().unwrap_or_default();
                let message = error.iter().skip(1).cloned().collect::<Vec<_>>().join(": ");
                return Err(if code == "RATELIMIT" {
                    Error::RateLimited(message)
                } else {
                    Error::Rejected {
                        status: 200,
                        message: format!("{} {}", code, message),
                    }
                });
            }

            Ok(body.json.data.map(|data| ContentItem {
                id: data.id,
                full_id: data.name,
                kind: ItemKind::Post,
                author_id: String::new(),
                author_name: self.credentials.username.clone(),
                title: item.title.clone(),
                source_collection: destination.to_string(),
                url: data.url,
            }))
        });
        Reply::new(outcome, rate)
    }

    async fn approve(&self, item: &ContentItem) -> Reply<()> {
        let request = self
            .post("/api/approve", &[("id", item.full_id.clone())])
            .await;
        let reply: Reply<serde_json::Value> = self.execute(request).await;
        map_reply(reply, |_| ())
    }
}

fn map_reply<T, U>(reply: Reply<T>, f: impl FnOnce(T) -> U) -> Reply<U> {
    Reply::new(reply.outcome.map(f), reply.rate)
}

fn advance_cursor(previous: &Cursor, posts: &[PostData]) -> Cursor {
    let newest = posts
        .iter()
        .max_by(|a, b| a.created_utc.total_cmp(&b.created_utc))
        .map(|p| p.name.clone());
    let oldest = posts
        .iter()
        .min_by(|a, b| a.created_utc.total_cmp(&b.created_utc))
        .map(|p| p.name.clone());

    match (newest, oldest) {
        (Some(newest), Some(oldest)) => Cursor {
            newest: Some(newest),
            oldest: Some(oldest),
        },
        _ => previous.clone(),
    }
}

/// Read `x-ratelimit-remaining` / `x-ratelimit-reset`. The remaining count is
/// sent as a float.
fn rate_signal(headers: &HeaderMap) -> Option<RateSignal> {
    let header = |name: &str| -> Option<f64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
    };

    let remaining = header("x-ratelimit-remaining")?;
    let reset = header("x-ratelimit-reset")?;
    let reset_in = Duration::try_from_secs_f64(reset.max(0.0))
        .unwrap_or(MAX_RATE_RESET)
        .min(MAX_RATE_RESET);
    Some(RateSignal {
        remaining: remaining.max(0.0).floor() as u32,
        reset_in,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    data: ListingData<T>,
}

#[derive(Debug, Deserialize)]
struct ListingData<T> {
    children: Vec<Thing<T>>,
}

#[derive(Debug, Deserialize)]
struct Thing<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct PostData {
    id: String,
    name: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    author_fullname: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    subreddit: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    created_utc: f64,
}

#[derive(Debug, Deserialize)]
struct CommentData {
    id: String,
    name: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    author_fullname: Option<String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    subreddit: String,
}

impl From<PostData> for ContentItem {
    fn from(post: PostData) -> Self {
        Self {
            id: post.id,
            full_id: post.name,
            kind: ItemKind::Post,
            author_id: post.author_fullname.unwrap_or_default(),
            author_name: post.author,
            title: post.title,
            source_collection: post.subreddit,
            url: post.url.unwrap_or_default(),
        }
    }
}

impl From<CommentData> for ContentItem {
    fn from(comment: CommentData) -> Self {
        Self {
            id: comment.id,
            full_id: comment.name,
            kind: ItemKind::Comment,
            author_id: comment.author_fullname.unwrap_or_default(),
            author_name: comment.author,
            title: comment.body,
            source_collection: comment.subreddit,
            url: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    json: SubmitJson,
}

#[derive(Debug, Deserialize)]
struct SubmitJson {
    #[serde(default)]
    errors: Vec<Vec<String>>,
    #[serde(default)]
    data: Option<SubmitData>,
}

#[derive(Debug, Deserialize)]
struct SubmitData {
    id: String,
    name: String,
    #[serde(default)]
    url: String,
}
