use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;

use crate::collectors::rate_limit::RateLimitStatus;
use crate::collectors::retry::RetryPolicy;
use crate::collectors::{
    AccountIdentity, CollectionOptions, CollectionResult, OriginalPost, PlatformCollector,
    RawSocialMessage, Sender, decode_body,
};
use crate::error::{CollectError, ErrorKind};
use crate::models::platform::{MessageKind, Platform};

const TWEET_FIELDS: &str = "created_at,author_id,conversation_id,referenced_tweets";
const USER_FIELDS: &str = "name,username,profile_image_url";
const DM_EVENT_FIELDS: &str = "id,text,created_at,sender_id,dm_conversation_id";

/// Recent search only accepts a `start_time` within the last seven days.
const RECENT_SEARCH_WINDOW: TimeDelta = TimeDelta::days(7);
const RECENT_SEARCH_MARGIN: TimeDelta = TimeDelta::minutes(5);

/// X (Twitter) API v2 collector.
pub struct TwitterCollector {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    includes: Includes,
    #[serde(default)]
    meta: Meta,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<TwitterUser>,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwitterUser {
    id: String,
    name: Option<String>,
    username: Option<String>,
    profile_image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    text: String,
    author_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    referenced_tweets: Vec<ReferencedTweet>,
}

#[derive(Debug, Deserialize)]
struct ReferencedTweet {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct DmEvent {
    id: String,
    #[serde(default)]
    text: String,
    sender_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

impl TwitterCollector {
    pub fn new(client: reqwest::Client, base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    /// GET `path`, recording rate-limit headers from every response.
    async fn fetch(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<String, CollectError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;

        self.record_rate_limit(resp.headers());
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            return Ok(body);
        }

        let message = error_message(&body);
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CollectError::RateLimited {
                platform: Platform::Twitter,
                message,
            });
        }
        Err(CollectError::Api {
            platform: Platform::Twitter,
            status: status.as_u16(),
            message,
        })
    }

    fn record_rate_limit(&self, headers: &HeaderMap) {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let remaining = header("x-rate-limit-remaining").and_then(|v| v.parse::<u32>().ok());
        let limit = header("x-rate-limit-limit").and_then(|v| v.parse::<u32>().ok());
        let reset = header("x-rate-limit-reset").and_then(|v| v.parse::<i64>().ok());

        if let (Some(remaining), Some(limit), Some(reset)) = (remaining, limit, reset) {
            self.retry.tracker().update(remaining, limit, reset);
        }
    }

    async fn fetch_page(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Page, CollectError> {
        let body = self
            .retry
            .execute(|| self.fetch(token, path, query))
            .await?;
        decode_body(&body, path)
    }

    fn tweets_to_result(
        &self,
        account: &AccountIdentity,
        kind: MessageKind,
        page: Page,
    ) -> CollectionResult {
        let messages = page
            .data
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<Tweet>(raw.clone()) {
                Ok(tweet) => Some(tweet_to_message(tweet, kind, &page.includes, raw)),
                Err(e) => {
                    tracing::warn!(account_id = %account.account_id, "skipping malformed tweet: {e}");
                    None
                }
            })
            .collect();

        self.result(account, messages, page.meta.next_token)
    }

    fn result(
        &self,
        account: &AccountIdentity,
        messages: Vec<RawSocialMessage>,
        next_token: Option<String>,
    ) -> CollectionResult {
        CollectionResult {
            platform: Platform::Twitter,
            account_id: account.account_id,
            messages,
            has_more: next_token.is_some(),
            cursor: next_token,
            rate_limit: self.retry.rate_limit_status(),
        }
    }

    fn empty(&self, account: &AccountIdentity) -> CollectionResult {
        CollectionResult::empty(
            Platform::Twitter,
            account.account_id,
            self.retry.rate_limit_status(),
        )
    }
}

#[async_trait]
impl PlatformCollector for TwitterCollector {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn can_collect(&self, token: &str) -> bool {
        match self.fetch(token, "/2/users/me", &[]).await {
            Ok(_) => true,
            // A throttled or failing probe says nothing about the token; the
            // retrying collect calls classify it.
            Err(e) if e.kind() != ErrorKind::Permanent => {
                tracing::debug!("Twitter auth probe inconclusive, collecting anyway: {e}");
                true
            }
            Err(e) => {
                tracing::debug!("Twitter auth probe failed: {e}");
                false
            }
        }
    }

    async fn collect_mentions(
        &self,
        token: &str,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError> {
        let path = format!("/2/users/{}/mentions", account.platform_account_id);
        let mut query = tweet_query(options.limit, options.since, 5);
        if let Some(cursor) = &options.cursor {
            query.push(("pagination_token", cursor.clone()));
        }

        let page = self.fetch_page(token, &path, &query).await?;
        Ok(self.tweets_to_result(account, MessageKind::Mention, page))
    }

    async fn collect_direct_messages(
        &self,
        token: &str,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError> {
        let mut query = vec![
            ("dm_event.fields", DM_EVENT_FIELDS.to_string()),
            ("event_types", "MessageCreate".to_string()),
            ("expansions", "sender_id".to_string()),
            ("user.fields", USER_FIELDS.to_string()),
            ("max_results", options.limit.clamp(1, 100).to_string()),
        ];
        if let Some(cursor) = &options.cursor {
            query.push(("pagination_token", cursor.clone()));
        }

        let page = match self.fetch_page(token, "/2/dm_events", &query).await {
            Ok(page) => page,
            // Tokens without the dm.read scope get 403 here.
            Err(CollectError::Api { status: 403, message, .. }) => {
                tracing::warn!(
                    account_id = %account.account_id,
                    "Twitter DM access denied, skipping direct messages: {message}"
                );
                return Ok(self.empty(account));
            }
            Err(e) => return Err(e),
        };

        // Events come newest first and the endpoint has no time filter, so
        // stop paging once the watermark is reached.
        let mut reached_since = false;
        let mut messages = Vec::new();
        for raw in page.data {
            let event = match serde_json::from_value::<DmEvent>(raw.clone()) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(account_id = %account.account_id, "skipping malformed DM event: {e}");
                    continue;
                }
            };
            let sender_id = event.sender_id.clone().unwrap_or_default();
            if sender_id == account.platform_account_id {
                continue;
            }
            let received_at = event.created_at.unwrap_or_else(Utc::now);
            if options.since.is_some_and(|since| received_at <= since) {
                reached_since = true;
                continue;
            }
            messages.push(RawSocialMessage {
                platform_item_id: event.id,
                kind: MessageKind::DirectMessage,
                content: event.text,
                sender: sender_for(&sender_id, &page.includes),
                original_post: None,
                received_at,
                raw,
            });
        }

        let next_token = if reached_since {
            None
        } else {
            page.meta.next_token
        };
        Ok(self.result(account, messages, next_token))
    }

    async fn collect_comments(
        &self,
        token: &str,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError> {
        let Some(handle) = account.handle.as_deref() else {
            tracing::debug!(
                account_id = %account.account_id,
                "no Twitter handle on account, skipping replies"
            );
            return Ok(self.empty(account));
        };

        let floor = Utc::now() - RECENT_SEARCH_WINDOW + RECENT_SEARCH_MARGIN;
        let since = options.since.map(|since| since.max(floor));
        let mut query = tweet_query(options.limit, since, 10);
        query.push((
            "query",
            format!("to:{} is:reply", handle.trim_start_matches('@')),
        ));
        if let Some(cursor) = &options.cursor {
            query.push(("next_token", cursor.clone()));
        }

        let page = self
            .fetch_page(token, "/2/tweets/search/recent", &query)
            .await?;
        Ok(self.tweets_to_result(account, MessageKind::Comment, page))
    }

    fn rate_limit_status(&self) -> Option<RateLimitStatus> {
        self.retry.rate_limit_status()
    }
}

fn tweet_query(
    limit: u32,
    since: Option<DateTime<Utc>>,
    min_results: u32,
) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("tweet.fields", TWEET_FIELDS.to_string()),
        ("expansions", "author_id".to_string()),
        ("user.fields", USER_FIELDS.to_string()),
        ("max_results", limit.clamp(min_results, 100).to_string()),
    ];
    if let Some(since) = since {
        query.push(("start_time", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
    }
    query
}

fn tweet_to_message(tweet: Tweet, kind: MessageKind, includes: &Includes, raw: Value) -> RawSocialMessage {
    let original_post = tweet
        .referenced_tweets
        .iter()
        .find(|r| r.kind == "replied_to" || r.kind == "quoted")
        .map(|r| OriginalPost {
            platform_post_id: r.id.clone(),
            url: Some(format!("https://twitter.com/i/web/status/{}", r.id)),
        });

    RawSocialMessage {
        platform_item_id: tweet.id,
        kind,
        content: tweet.text,
        sender: sender_for(tweet.author_id.as_deref().unwrap_or_default(), includes),
        original_post,
        received_at: tweet.created_at.unwrap_or_else(Utc::now),
        raw,
    }
}

fn sender_for(user_id: &str, includes: &Includes) -> Sender {
    match includes.users.iter().find(|u| u.id == user_id) {
        Some(user) => Sender {
            platform_id: user.id.clone(),
            name: user.name.clone(),
            handle: user.username.clone(),
            avatar_url: user.profile_image_url.clone(),
        },
        None => Sender {
            platform_id: user_id.to_string(),
            name: None,
            handle: None,
            avatar_url: None,
        },
    }
}

/// Best-effort human message from a v2 error body.
fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| {
            v.get("detail")
                .or_else(|| v.get("title"))
                .or_else(|| v.pointer("/errors/0/message"))
        })
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| body.chars().take(200).collect())
}
