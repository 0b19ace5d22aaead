// Platform collectors: the retry/rate-limit primitive, the collector contract
// every platform adapter implements, and the built-in adapters.

pub mod backoff;
pub mod facebook;
pub mod rate_limit;
pub mod retry;
pub mod twitter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::collectors::rate_limit::RateLimitStatus;
use crate::collectors::retry::RetryPolicy;
use crate::config::Config;
use crate::error::CollectError;
use crate::models::platform::{MessageKind, Platform};

/// Who sent an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sender {
    pub platform_id: String,
    pub name: Option<String>,
    pub handle: Option<String>,
    pub avatar_url: Option<String>,
}

/// Post a comment or reply was left on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OriginalPost {
    pub platform_post_id: String,
    pub url: Option<String>,
}

/// One inbound item, normalized across platforms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawSocialMessage {
    pub platform_item_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub sender: Sender,
    pub original_post: Option<OriginalPost>,
    pub received_at: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// Output of a single collector call.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionResult {
    pub platform: Platform,
    pub account_id: Uuid,
    pub messages: Vec<RawSocialMessage>,
    pub has_more: bool,
    pub cursor: Option<String>,
    pub rate_limit: Option<RateLimitStatus>,
}

impl CollectionResult {
    pub fn empty(platform: Platform, account_id: Uuid, rate_limit: Option<RateLimitStatus>) -> Self {
        Self {
            platform,
            account_id,
            messages: Vec::new(),
            has_more: false,
            cursor: None,
            rate_limit,
        }
    }
}

/// The connected account a collector fetches for. Never carries the token.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountIdentity {
    pub account_id: Uuid,
    /// Platform-native id of the account (user id, page id).
    pub platform_account_id: String,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    /// Only return items newer than this.
    pub since: Option<DateTime<Utc>>,
    /// Opaque pagination cursor from a previous [`CollectionResult`].
    pub cursor: Option<String>,
    pub limit: u32,
}

/// Contract every platform adapter implements.
///
/// The three `collect_*` calls are each wrapped in the collector's own
/// [`RetryPolicy`]. Whether a given non-2xx response (missing permission
/// scope, say) becomes an empty successful result is decided per platform.
#[async_trait]
pub trait PlatformCollector: Send + Sync {
    fn platform(&self) -> Platform;

    /// Cheap auth probe. `false` means the token is unusable this pass.
    async fn can_collect(&self, token: &str) -> bool;

    async fn collect_mentions(
        &self,
        token: &str,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError>;

    async fn collect_direct_messages(
        &self,
        token: &str,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError>;

    async fn collect_comments(
        &self,
        token: &str,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError>;

    fn rate_limit_status(&self) -> Option<RateLimitStatus>;
}

/// One collector slot per known platform.
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    twitter: Option<Arc<dyn PlatformCollector>>,
    facebook: Option<Arc<dyn PlatformCollector>>,
    instagram: Option<Arc<dyn PlatformCollector>>,
    linkedin: Option<Arc<dyn PlatformCollector>>,
}

impl CollectorRegistry {
    /// Registry with the built-in Twitter and Facebook collectors.
    pub fn from_config(config: &Config) -> Result<Self, CollectError> {
        let backoff = config.backoff();
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("inboxcollector/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut registry = Self::default();
        registry.register(Arc::new(twitter::TwitterCollector::new(
            client.clone(),
            &config.twitter_api_base,
            RetryPolicy::new(backoff),
        )));
        registry.register(Arc::new(facebook::FacebookCollector::new(
            client,
            &config.facebook_graph_base,
            RetryPolicy::new(backoff),
        )));
        Ok(registry)
    }

    /// Install `collector` in its platform's slot, replacing any previous one.
    pub fn register(&mut self, collector: Arc<dyn PlatformCollector>) {
        let slot = match collector.platform() {
            Platform::Twitter => &mut self.twitter,
            Platform::Facebook => &mut self.facebook,
            Platform::Instagram => &mut self.instagram,
            Platform::Linkedin => &mut self.linkedin,
        };
        *slot = Some(collector);
    }

    pub fn get(&self, platform: Platform) -> Option<&Arc<dyn PlatformCollector>> {
        match platform {
            Platform::Twitter => self.twitter.as_ref(),
            Platform::Facebook => self.facebook.as_ref(),
            Platform::Instagram => self.instagram.as_ref(),
            Platform::Linkedin => self.linkedin.as_ref(),
        }
    }

    pub fn platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.get(*p).is_some())
            .collect()
    }
}

/// Parse a JSON body, keeping the endpoint name for the error.
pub(crate) fn decode_body<T: serde::de::DeserializeOwned>(
    body: &str,
    context: &str,
) -> Result<T, CollectError> {
    serde_json::from_str(body).map_err(|source| CollectError::Deserialize {
        context: context.to_string(),
        source,
    })
}
