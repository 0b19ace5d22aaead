use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
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

/// Graph API error codes that mean "slow down".
const THROTTLE_CODES: [i64; 4] = [4, 17, 32, 613];

/// Unknown/temporary service errors, retryable whatever the HTTP status.
const TRANSIENT_CODES: [i64; 2] = [1, 2];

/// Facebook Pages collector over the Graph API.
pub struct FacebookCollector {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

/// Successful Graph call, or a permission error the page token can't get past.
enum GraphResponse {
    Body(String),
    PermissionDenied(String),
}

#[derive(Debug, Deserialize)]
struct Edge {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    paging: Paging,
}

#[derive(Debug, Default, Deserialize)]
struct Paging {
    #[serde(default)]
    cursors: Cursors,
    next: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Cursors {
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphUser {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphMessage {
    id: String,
    #[serde(default)]
    message: String,
    from: Option<GraphUser>,
    created_time: Option<String>,
    permalink_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: String,
    #[serde(default)]
    code: i64,
}

#[derive(Debug, Default, Deserialize)]
struct AppUsage {
    #[serde(default)]
    call_count: u32,
    #[serde(default)]
    total_cputime: u32,
    #[serde(default)]
    total_time: u32,
    #[serde(default)]
    estimated_time_to_regain_access: i64,
}

impl AppUsage {
    fn percent(&self) -> u32 {
        self.call_count.max(self.total_cputime).max(self.total_time)
    }
}

impl FacebookCollector {
    pub fn new(client: reqwest::Client, base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    async fn fetch(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<GraphResponse, CollectError> {
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
            return Ok(GraphResponse::Body(body));
        }

        let (code, message) = match serde_json::from_str::<GraphErrorBody>(&body) {
            Ok(parsed) => (parsed.error.code, parsed.error.message),
            Err(_) => (0, body.chars().take(200).collect()),
        };

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || THROTTLE_CODES.contains(&code) {
            return Err(CollectError::RateLimited {
                platform: Platform::Facebook,
                message,
            });
        }
        if code == 10 || (200..300).contains(&code) {
            return Ok(GraphResponse::PermissionDenied(message));
        }
        let status = if TRANSIENT_CODES.contains(&code) {
            reqwest::StatusCode::SERVICE_UNAVAILABLE
        } else {
            status
        };
        Err(CollectError::Api {
            platform: Platform::Facebook,
            status: status.as_u16(),
            message,
        })
    }

    /// Graph reports usage as percentages in `x-app-usage` (and per page in
    /// `x-business-use-case-usage`); 100% means throttled.
    fn record_rate_limit(&self, headers: &HeaderMap) {
        let mut usages: Vec<AppUsage> = Vec::new();

        if let Some(usage) = headers
            .get("x-app-usage")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| serde_json::from_str::<AppUsage>(v).ok())
        {
            usages.push(usage);
        }
        if let Some(buc) = headers
            .get("x-business-use-case-usage")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                serde_json::from_str::<std::collections::HashMap<String, Vec<AppUsage>>>(v).ok()
            })
        {
            usages.extend(buc.into_values().flatten());
        }

        if usages.is_empty() {
            return;
        }

        let used = usages.iter().map(AppUsage::percent).max().unwrap_or(0).min(100);
        let regain_minutes = usages
            .iter()
            .map(|u| u.estimated_time_to_regain_access)
            .max()
            .unwrap_or(0);
        let window = if regain_minutes > 0 {
            TimeDelta::minutes(regain_minutes)
        } else {
            TimeDelta::hours(1)
        };

        self.retry
            .tracker()
            .set(RateLimitStatus::new(100 - used, 100, Utc::now() + window));
    }

    /// Fetch one edge page; `None` when the token lacks the permission.
    async fn fetch_edge(
        &self,
        token: &str,
        account: &AccountIdentity,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Edge>, CollectError> {
        match self.retry.execute(|| self.fetch(token, path, query)).await? {
            GraphResponse::Body(body) => decode_body(&body, path).map(Some),
            GraphResponse::PermissionDenied(message) => {
                tracing::warn!(
                    account_id = %account.account_id,
                    "Facebook permission missing for {path}, skipping: {message}"
                );
                Ok(None)
            }
        }
    }

    fn result(
        &self,
        account: &AccountIdentity,
        messages: Vec<RawSocialMessage>,
        paging: Paging,
    ) -> CollectionResult {
        let has_more = paging.next.is_some();
        CollectionResult {
            platform: Platform::Facebook,
            account_id: account.account_id,
            messages,
            has_more,
            cursor: if has_more { paging.cursors.after } else { None },
            rate_limit: self.retry.rate_limit_status(),
        }
    }

    fn empty(&self, account: &AccountIdentity) -> CollectionResult {
        CollectionResult::empty(
            Platform::Facebook,
            account.account_id,
            self.retry.rate_limit_status(),
        )
    }
}

#[async_trait]
impl PlatformCollector for FacebookCollector {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    async fn can_collect(&self, token: &str) -> bool {
        let query = [("fields", "id".to_string())];
        match self.fetch(token, "/me", &query).await {
            Ok(GraphResponse::Body(_)) => true,
            Ok(GraphResponse::PermissionDenied(message)) => {
                tracing::debug!("Facebook auth probe denied: {message}");
                false
            }
            // A throttled or failing probe says nothing about the token; the
            // retrying collect calls classify it.
            Err(e) if e.kind() != ErrorKind::Permanent => {
                tracing::debug!("Facebook auth probe inconclusive, collecting anyway: {e}");
                true
            }
            Err(e) => {
                tracing::debug!("Facebook auth probe failed: {e}");
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
        let path = format!("/{}/tagged", account.platform_account_id);
        let mut query = edge_query(options);
        query.push((
            "fields",
            "id,message,from,created_time,permalink_url".to_string(),
        ));

        let Some(edge) = self.fetch_edge(token, account, &path, &query).await? else {
            return Ok(self.empty(account));
        };

        let messages = edge
            .data
            .into_iter()
            .filter_map(|raw| {
                let item = parse_item(account, raw.clone())?;
                Some(to_message(item, MessageKind::Mention, None, raw))
            })
            .collect();
        Ok(self.result(account, messages, edge.paging))
    }

    async fn collect_direct_messages(
        &self,
        token: &str,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError> {
        let path = format!("/{}/conversations", account.platform_account_id);
        let mut query = edge_query(options);
        query.push(("platform", "messenger".to_string()));
        query.push((
            "fields",
            format!(
                "id,updated_time,messages.limit({}){{id,message,from,created_time}}",
                options.limit.max(1)
            ),
        ));

        let Some(edge) = self.fetch_edge(token, account, &path, &query).await? else {
            return Ok(self.empty(account));
        };

        let mut messages = Vec::new();
        for conversation in &edge.data {
            for raw in nested(conversation, "messages") {
                let Some(item) = parse_item(account, raw.clone()) else {
                    continue;
                };
                if is_own(account, &item) || is_older(options, &item) {
                    continue;
                }
                messages.push(to_message(item, MessageKind::DirectMessage, None, raw));
            }
        }
        Ok(self.result(account, messages, edge.paging))
    }

    async fn collect_comments(
        &self,
        token: &str,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError> {
        // `since` on the feed filters posts, not their comments; new comments
        // on old posts are filtered per comment below instead.
        let path = format!("/{}/feed", account.platform_account_id);
        let mut query = paging_query(options);
        query.push((
            "fields",
            format!(
                "id,permalink_url,updated_time,comments.limit({}){{id,message,from,created_time}}",
                options.limit.max(1)
            ),
        ));

        let Some(edge) = self.fetch_edge(token, account, &path, &query).await? else {
            return Ok(self.empty(account));
        };

        let mut messages = Vec::new();
        for post in &edge.data {
            let Some(post_id) = post.get("id").and_then(Value::as_str) else {
                continue;
            };
            let original = OriginalPost {
                platform_post_id: post_id.to_string(),
                url: post
                    .get("permalink_url")
                    .and_then(Value::as_str)
                    .map(String::from),
            };
            for raw in nested(post, "comments") {
                let Some(item) = parse_item(account, raw.clone()) else {
                    continue;
                };
                if is_own(account, &item) || is_older(options, &item) {
                    continue;
                }
                messages.push(to_message(
                    item,
                    MessageKind::Comment,
                    Some(original.clone()),
                    raw,
                ));
            }
        }

        // Stop paging once a whole page has seen no activity since the watermark.
        let stale = options.since.is_some_and(|since| {
            !edge.data.iter().any(|post| {
                post.get("updated_time")
                    .and_then(Value::as_str)
                    .and_then(parse_graph_time)
                    .is_none_or(|updated| updated > since)
            })
        });
        let paging = if stale { Paging::default() } else { edge.paging };
        Ok(self.result(account, messages, paging))
    }

    fn rate_limit_status(&self) -> Option<RateLimitStatus> {
        self.retry.rate_limit_status()
    }
}

fn edge_query(options: &CollectionOptions) -> Vec<(&'static str, String)> {
    let mut query = paging_query(options);
    if let Some(since) = options.since {
        query.push(("since", since.timestamp().to_string()));
    }
    query
}

fn paging_query(options: &CollectionOptions) -> Vec<(&'static str, String)> {
    let mut query = vec![("limit", options.limit.clamp(1, 100).to_string())];
    if let Some(cursor) = &options.cursor {
        query.push(("after", cursor.clone()));
    }
    query
}

/// Items of a nested edge such as `messages{...}` or `comments{...}`.
fn nested(parent: &Value, edge: &str) -> Vec<Value> {
    parent
        .get(edge)
        .and_then(|e| e.get("data"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn parse_item(account: &AccountIdentity, raw: Value) -> Option<GraphMessage> {
    match serde_json::from_value::<GraphMessage>(raw) {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::warn!(account_id = %account.account_id, "skipping malformed Graph item: {e}");
            None
        }
    }
}

fn is_own(account: &AccountIdentity, item: &GraphMessage) -> bool {
    item.from
        .as_ref()
        .is_some_and(|from| from.id == account.platform_account_id)
}

fn is_older(options: &CollectionOptions, item: &GraphMessage) -> bool {
    match (options.since, item.created_time.as_deref().and_then(parse_graph_time)) {
        (Some(since), Some(created)) => created <= since,
        _ => false,
    }
}

/// Graph timestamps look like `2024-05-01T12:00:00+0000`.
fn parse_graph_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn to_message(
    item: GraphMessage,
    kind: MessageKind,
    original_post: Option<OriginalPost>,
    raw: Value,
) -> RawSocialMessage {
    let received_at = item
        .created_time
        .as_deref()
        .and_then(parse_graph_time)
        .unwrap_or_else(Utc::now);
    let sender = match item.from {
        Some(from) => Sender {
            platform_id: from.id,
            name: from.name,
            handle: None,
            avatar_url: None,
        },
        None => Sender {
            platform_id: String::new(),
            name: None,
            handle: None,
            avatar_url: None,
        },
    };
    let original_post = original_post.or_else(|| {
        item.permalink_url.map(|url| OriginalPost {
            platform_post_id: item.id.clone(),
            url: Some(url),
        })
    });

    RawSocialMessage {
        platform_item_id: item.id,
        kind,
        content: item.message,
        sender,
        original_post,
        received_at,
        raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::collectors::backoff::BackoffConfig;

    fn collector(server: &MockServer, max_retries: u32) -> FacebookCollector {
        FacebookCollector::new(
            reqwest::Client::new(),
            &server.uri(),
            RetryPolicy::new(BackoffConfig {
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                multiplier: 2.0,
                max_retries,
            }),
        )
    }

    fn page() -> AccountIdentity {
        AccountIdentity {
            account_id: Uuid::new_v4(),
            platform_account_id: "page-1".to_string(),
            handle: None,
        }
    }

    fn options() -> CollectionOptions {
        CollectionOptions {
            limit: 25,
            ..Default::default()
        }
    }

    #[test]
    fn parses_graph_timestamps() {
        let parsed = parse_graph_time("2024-05-01T12:00:00+0000").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert!(parse_graph_time("yesterday").is_none());
    }

    #[tokio::test]
    async fn comments_are_flattened_and_linked_to_posts() {
        let server = MockServer::start().await;
        let body = json!({
            "data": [{
                "id": "page-1_post-9",
                "permalink_url": "https://facebook.com/post-9",
                "comments": {"data": [
                    {"id": "c1", "message": "great", "from": {"id": "u1", "name": "Ana"},
                     "created_time": "2024-05-01T12:00:00+0000"},
                    {"id": "c2", "message": "thanks!", "from": {"id": "page-1", "name": "Acme"},
                     "created_time": "2024-05-01T12:05:00+0000"}
                ]}
            }],
            "paging": {"cursors": {"after": "cur-2"}, "next": "https://graph/next"}
        });
        Mock::given(method("GET"))
            .and(path("/page-1/feed"))
            .and(query_param("limit", "25"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-app-usage", r#"{"call_count":40,"total_cputime":10,"total_time":12}"#)
                    .set_body_json(&body),
            )
            .mount(&server)
            .await;

        let fb = collector(&server, 0);
        let result = fb.collect_comments("tok", &page(), &options()).await.unwrap();

        assert_eq!(result.messages.len(), 1, "page's own reply is excluded");
        let comment = &result.messages[0];
        assert_eq!(comment.platform_item_id, "c1");
        assert_eq!(comment.kind, MessageKind::Comment);
        assert_eq!(comment.sender.name.as_deref(), Some("Ana"));
        let post = comment.original_post.as_ref().unwrap();
        assert_eq!(post.platform_post_id, "page-1_post-9");
        assert_eq!(post.url.as_deref(), Some("https://facebook.com/post-9"));
        assert!(result.has_more);
        assert_eq!(result.cursor.as_deref(), Some("cur-2"));

        let status = result.rate_limit.unwrap();
        assert_eq!(status.remaining, 60);
        assert_eq!(status.limit, 100);
    }

    #[tokio::test]
    async fn conversations_skip_page_authored_messages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page-1/conversations"))
            .and(query_param("platform", "messenger"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "t_1", "messages": {"data": [
                    {"id": "m1", "message": "is this open?", "from": {"id": "u9"}},
                    {"id": "m2", "message": "yes", "from": {"id": "page-1"}}
                ]}}]
            })))
            .mount(&server)
            .await;

        let result = collector(&server, 0)
            .collect_direct_messages("tok", &page(), &options())
            .await
            .unwrap();

        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].platform_item_id, "m1");
        assert!(!result.has_more);
        assert!(result.cursor.is_none());
    }

    #[tokio::test]
    async fn missing_permission_downgrades_to_empty_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page-1/tagged"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"message": "(#10) Requires pages_read_engagement", "type": "OAuthException", "code": 10}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = collector(&server, 3)
            .collect_mentions("tok", &page(), &options())
            .await
            .expect("permission errors are not failures");
        assert!(result.messages.is_empty());
    }

    #[tokio::test]
    async fn throttle_codes_are_rate_limits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page-1/tagged"))
            .respond_with(
                ResponseTemplate::new(400)
                    .insert_header(
                        "x-business-use-case-usage",
                        r#"{"page-1":[{"type":"pages","call_count":100,"total_cputime":20,"total_time":20,"estimated_time_to_regain_access":0}]}"#,
                    )
                    .set_body_json(json!({
                        "error": {"message": "Application request limit reached", "code": 4}
                    })),
            )
            .mount(&server)
            .await;

        let fb = collector(&server, 0);
        let err = fb
            .collect_mentions("tok", &page(), &options())
            .await
            .unwrap_err();

        assert!(err.is_rate_limit());
        let status = fb.rate_limit_status().unwrap();
        assert!(status.is_limited);
        assert!(status.reset_at > Utc::now());
    }

    #[tokio::test]
    async fn other_client_errors_fail_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page-1/tagged"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Unsupported get request", "code": 100}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = collector(&server, 3)
            .collect_mentions("tok", &page(), &options())
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Api { status: 400, .. }));
    }

    #[tokio::test]
    async fn temporary_service_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page-1/tagged"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Service temporarily unavailable", "code": 2}
            })))
            .expect(3)
            .mount(&server)
            .await;

        let err = collector(&server, 2)
            .collect_mentions("tok", &page(), &options())
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Api { status: 503, .. }));
    }

    #[tokio::test]
    async fn auth_probe_uses_me_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Error validating access token", "code": 190}
            })))
            .mount(&server)
            .await;

        assert!(!collector(&server, 0).can_collect("expired").await);
    }

    #[tokio::test]
    async fn throttled_auth_probe_still_collects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Application request limit reached", "code": 4}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let fb = collector(&server, 0);
        assert!(fb.can_collect("busy").await);
        assert!(fb.can_collect("flaky").await);
    }

    #[tokio::test]
    async fn new_comments_on_old_posts_are_collected() {
        let server = MockServer::start().await;
        let body = json!({
            "data": [{
                "id": "page-1_post-1",
                "updated_time": "2024-05-03T09:00:00+0000",
                "comments": {"data": [
                    {"id": "c-old", "message": "first", "from": {"id": "u1"},
                     "created_time": "2024-04-01T12:00:00+0000"},
                    {"id": "c-new", "message": "still valid?", "from": {"id": "u2"},
                     "created_time": "2024-05-03T09:00:00+0000"}
                ]}
            }],
            "paging": {"cursors": {"after": "cur-2"}, "next": "https://graph/next"}
        });
        Mock::given(method("GET"))
            .and(path("/page-1/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .expect(1)
            .mount(&server)
            .await;

        let opts = CollectionOptions {
            since: Some("2024-05-02T00:00:00Z".parse().unwrap()),
            ..options()
        };
        let result = collector(&server, 0)
            .collect_comments("tok", &page(), &opts)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(
            requests[0].url.query_pairs().all(|(k, _)| k != "since"),
            "feed requests must not filter posts by creation time"
        );
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].platform_item_id, "c-new");
        assert!(result.has_more);
        assert_eq!(result.cursor.as_deref(), Some("cur-2"));
    }

    #[tokio::test]
    async fn feed_paging_stops_at_inactive_posts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page-1/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "page-1_post-0", "updated_time": "2024-03-01T00:00:00+0000"}],
                "paging": {"cursors": {"after": "cur-3"}, "next": "https://graph/next"}
            })))
            .mount(&server)
            .await;

        let opts = CollectionOptions {
            since: Some("2024-05-02T00:00:00Z".parse().unwrap()),
            ..options()
        };
        let result = collector(&server, 0)
            .collect_comments("tok", &page(), &opts)
            .await
            .unwrap();

        assert!(result.messages.is_empty());
        assert!(!result.has_more);
        assert!(result.cursor.is_none());
    }
}
