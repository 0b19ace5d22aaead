//! Collection orchestration.
//!
//! [`Collection`] sequences the three collector calls for an account, fans
//! that out over a workspace's accounts, and over every workspace. None of the
//! three levels returns an error: every failure is folded into a
//! [`CollectionJobResult`] so the scheduler never has to wrap these calls.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collectors::rate_limit::{RESET_SAFETY_BUFFER, RateLimitStatus};
use crate::collectors::{CollectionOptions, CollectionResult, CollectorRegistry, PlatformCollector};
use crate::error::{AppError, CollectError};
use crate::jobs::store::{AccountStore, InboxStore};
use crate::jobs::summary::summarize_collection_results;
use crate::jobs::{CollectionJobResult, CollectionJobStatus};
use crate::models::account::ActiveAccount;
use crate::models::inbox_item::{DedupKey, InboxItem, NewInboxItem};
use crate::models::platform::Platform;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Page size requested from each collector call.
    pub page_size: u32,
    /// Pages followed per message kind before moving on. Older items past
    /// the cap are not collected.
    pub max_pages: u32,
    /// Longest pause between accounts after a rate-limited result. Longer
    /// resets are not waited out within the pass.
    pub max_inter_account_wait: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: 10,
            max_inter_account_wait: Duration::from_secs(60),
        }
    }
}

/// Published after every newly persisted inbox item, for downstream
/// enrichment that must stay out of the collection path.
#[derive(Debug, Clone, Serialize)]
pub struct InboxItemPersisted {
    pub account_id: Uuid,
    pub item: InboxItem,
}

/// Message kinds collected per account, in call order.
#[derive(Debug, Clone, Copy)]
enum Feed {
    Mentions,
    DirectMessages,
    Comments,
}

impl Feed {
    const ALL: [Feed; 3] = [Feed::Mentions, Feed::DirectMessages, Feed::Comments];

    fn as_str(self) -> &'static str {
        match self {
            Feed::Mentions => "mentions",
            Feed::DirectMessages => "direct_messages",
            Feed::Comments => "comments",
        }
    }
}

/// Counters for an account job in flight. Consumed by [`JobProgress::finish`].
struct JobProgress {
    platform: Platform,
    account_id: Uuid,
    started_at: DateTime<Utc>,
    messages_collected: u32,
    new_messages: u32,
    duplicates_skipped: u32,
    /// Messages dropped on a failed store call; any keeps the watermark.
    persist_failures: u32,
}

impl JobProgress {
    fn start(account: &ActiveAccount) -> Self {
        Self {
            platform: account.platform,
            account_id: account.id,
            started_at: Utc::now(),
            messages_collected: 0,
            new_messages: 0,
            duplicates_skipped: 0,
            persist_failures: 0,
        }
    }

    fn finish(
        self,
        status: CollectionJobStatus,
        error: Option<String>,
        rate_limit: Option<RateLimitStatus>,
    ) -> CollectionJobResult {
        CollectionJobResult {
            status,
            platform: self.platform,
            account_id: self.account_id,
            messages_collected: self.messages_collected,
            new_messages: self.new_messages,
            duplicates_skipped: self.duplicates_skipped,
            error,
            started_at: self.started_at,
            completed_at: Some(Utc::now()),
            rate_limit,
        }
    }

    fn fail(self, err: &CollectError, rate_limit: Option<RateLimitStatus>) -> CollectionJobResult {
        let status = if err.is_rate_limit() {
            CollectionJobStatus::RateLimited
        } else {
            CollectionJobStatus::Failed
        };
        self.finish(status, Some(err.to_string()), rate_limit)
    }
}

pub struct Collection {
    registry: CollectorRegistry,
    accounts: Arc<dyn AccountStore>,
    inbox: Arc<dyn InboxStore>,
    settings: RunnerSettings,
    events: broadcast::Sender<InboxItemPersisted>,
    shutdown: CancellationToken,
}

impl Collection {
    pub fn new(
        registry: CollectorRegistry,
        accounts: Arc<dyn AccountStore>,
        inbox: Arc<dyn InboxStore>,
        settings: RunnerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            registry,
            accounts,
            inbox,
            settings,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboxItemPersisted> {
        self.events.subscribe()
    }

    /// Cancelling this token stops in-flight collector calls (including their
    /// retry sleeps) and skips the remaining accounts and workspaces.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn find_account(&self, account_id: Uuid) -> Result<ActiveAccount, AppError> {
        self.accounts.get_active_account(account_id).await
    }

    async fn cancellable<T>(
        &self,
        operation: impl Future<Output = Result<T, CollectError>>,
    ) -> Result<T, CollectError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(CollectError::Cancelled),
            result = operation => result,
        }
    }

    /// Run mentions, DMs and comments for one account, then dedup and persist.
    pub async fn collect_from_account(&self, account: &ActiveAccount) -> CollectionJobResult {
        let mut job = JobProgress::start(account);

        let Some(collector) = self.registry.get(account.platform) else {
            let err = CollectError::NoCollector(account.platform);
            tracing::error!(account_id = %account.id, platform = %account.platform, "{err}");
            return job.fail(&err, None);
        };

        let authorized = self
            .cancellable(async { Ok(collector.can_collect(&account.access_token).await) })
            .await;
        match authorized {
            Ok(true) => {}
            Ok(false) => {
                let err = CollectError::InvalidToken(account.id);
                tracing::error!(account_id = %account.id, platform = %account.platform, "{err}");
                return job.fail(&err, collector.rate_limit_status());
            }
            Err(err) => return job.fail(&err, collector.rate_limit_status()),
        }

        match self.collect_all(collector.as_ref(), account, &mut job).await {
            Ok(()) => {
                let watermark = job.started_at;
                let persist_failures = job.persist_failures;
                let result = job.finish(
                    CollectionJobStatus::Completed,
                    None,
                    collector.rate_limit_status(),
                );
                tracing::info!(
                    account_id = %account.id,
                    platform = %account.platform,
                    collected = result.messages_collected,
                    new = result.new_messages,
                    duplicates = result.duplicates_skipped,
                    "account collection completed"
                );
                if persist_failures > 0 {
                    // Dropped messages must be fetched again next pass.
                    tracing::warn!(
                        account_id = %account.id,
                        dropped = persist_failures,
                        "Messages failed to persist, keeping previous watermark"
                    );
                } else if let Err(e) = self.accounts.record_collected(account.id, watermark).await {
                    tracing::warn!(account_id = %account.id, "Failed to record collection watermark: {e}");
                }
                result
            }
            Err(err) => {
                tracing::error!(
                    account_id = %account.id,
                    platform = %account.platform,
                    rate_limited = err.is_rate_limit(),
                    "account collection failed: {err}"
                );
                job.fail(&err, collector.rate_limit_status())
            }
        }
    }

    /// Mentions, then DMs, then comments, one after another so each call sees
    /// the rate-limit state the previous one left behind.
    async fn collect_all(
        &self,
        collector: &dyn PlatformCollector,
        account: &ActiveAccount,
        job: &mut JobProgress,
    ) -> Result<(), CollectError> {
        let mut seen = HashSet::new();
        for feed in Feed::ALL {
            self.collect_feed(collector, account, feed, &mut seen, job).await?;
        }
        Ok(())
    }

    /// Follow one kind's cursor until it runs out or the page cap is hit,
    /// persisting each page before requesting the next.
    async fn collect_feed(
        &self,
        collector: &dyn PlatformCollector,
        account: &ActiveAccount,
        feed: Feed,
        seen: &mut HashSet<DedupKey>,
        job: &mut JobProgress,
    ) -> Result<(), CollectError> {
        let token = account.access_token.as_str();
        let identity = account.identity();
        let mut options = CollectionOptions {
            since: account.last_collected_at,
            cursor: None,
            limit: self.settings.page_size,
        };

        for _ in 0..self.settings.max_pages.max(1) {
            let call = match feed {
                Feed::Mentions => collector.collect_mentions(token, &identity, &options),
                Feed::DirectMessages => {
                    collector.collect_direct_messages(token, &identity, &options)
                }
                Feed::Comments => collector.collect_comments(token, &identity, &options),
            };
            let result = self.cancellable(call).await?;

            let has_more = result.has_more;
            let next = result.cursor.clone().filter(|_| has_more);
            self.persist(account, result, seen, job).await;

            match next {
                Some(cursor) => options.cursor = Some(cursor),
                None => {
                    if has_more {
                        tracing::warn!(
                            account_id = %account.id,
                            feed = feed.as_str(),
                            "More pages reported without a cursor, stopping"
                        );
                    }
                    return Ok(());
                }
            }
        }

        tracing::warn!(
            account_id = %account.id,
            feed = feed.as_str(),
            max_pages = self.settings.max_pages,
            "Page cap reached, older items are not collected"
        );
        Ok(())
    }

    /// Dedup and store one batch. A failing message is logged and skipped.
    async fn persist(
        &self,
        account: &ActiveAccount,
        result: CollectionResult,
        seen: &mut HashSet<DedupKey>,
        job: &mut JobProgress,
    ) {
        for message in result.messages {
            job.messages_collected += 1;
            let item = NewInboxItem::from_message(account, message);
            let key = item.key();

            if seen.contains(&key) {
                job.duplicates_skipped += 1;
                continue;
            }

            match self.inbox.exists_by_key(&key).await {
                Ok(true) => {
                    job.duplicates_skipped += 1;
                    seen.insert(key);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        account_id = %account.id,
                        item_id = %key.platform_item_id,
                        "Failed to check inbox item: {e}"
                    );
                    job.persist_failures += 1;
                    continue;
                }
            }

            match self.inbox.upsert(item).await {
                Ok(stored) => {
                    job.new_messages += 1;
                    seen.insert(key);
                    // No subscribers is fine.
                    let _ = self.events.send(InboxItemPersisted {
                        account_id: account.id,
                        item: stored,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        account_id = %account.id,
                        item_id = %key.platform_item_id,
                        "Failed to store inbox item: {e}"
                    );
                    job.persist_failures += 1;
                }
            }
        }
    }

    /// Collect every active account of a workspace, strictly one at a time.
    pub async fn run_workspace_collection_job(&self, workspace_id: Uuid) -> Vec<CollectionJobResult> {
        let accounts = match self.accounts.list_active_accounts(workspace_id).await {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::error!(%workspace_id, "Failed to load accounts: {e}");
                return Vec::new();
            }
        };

        tracing::info!(%workspace_id, accounts = accounts.len(), "workspace collection started");

        let mut results = Vec::with_capacity(accounts.len());
        // Platforms whose reset is too far away to wait for in this pass.
        let mut exhausted: HashMap<Platform, RateLimitStatus> = HashMap::new();

        for account in &accounts {
            if self.shutdown.is_cancelled() {
                tracing::warn!(%workspace_id, "collection cancelled, skipping remaining accounts");
                break;
            }

            if let Some(status) = exhausted.get(&account.platform) {
                if Utc::now() < status.reset_at {
                    results.push(skipped_for_rate_limit(account, status));
                    continue;
                }
                exhausted.remove(&account.platform);
            }

            let result = self.collect_from_account(account).await;

            if result.status == CollectionJobStatus::RateLimited
                && let Some(status) = &result.rate_limit
            {
                let wait = status.time_until_reset_at(Utc::now());
                if wait >= self.settings.max_inter_account_wait {
                    tracing::warn!(
                        %workspace_id,
                        platform = %account.platform,
                        wait_secs = wait.as_secs(),
                        "rate limit reset too far away, deferring platform to next run"
                    );
                    exhausted.insert(account.platform, status.clone());
                } else if !wait.is_zero() {
                    let pause = wait + RESET_SAFETY_BUFFER;
                    tracing::info!(
                        %workspace_id,
                        platform = %account.platform,
                        pause_ms = pause.as_millis() as u64,
                        "pausing before next account for rate limit reset"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }

            results.push(result);
        }

        let summary = summarize_collection_results(workspace_id, &results);
        tracing::info!(
            %workspace_id,
            accounts = summary.total_accounts,
            successful = summary.successful_collections,
            failed = summary.failed_collections,
            rate_limited = summary.rate_limited_collections,
            new_messages = summary.total_new_messages,
            "workspace collection finished"
        );

        results
    }

    /// Collect every workspace with at least one active account, one at a time.
    pub async fn run_global_collection_job(&self) -> BTreeMap<Uuid, Vec<CollectionJobResult>> {
        let workspaces = match self.accounts.list_workspaces_with_active_accounts().await {
            Ok(workspaces) => workspaces,
            Err(e) => {
                tracing::error!("Failed to load workspaces: {e}");
                return BTreeMap::new();
            }
        };

        tracing::info!(workspaces = workspaces.len(), "global collection started");

        let mut all = BTreeMap::new();
        for workspace_id in workspaces {
            if self.shutdown.is_cancelled() {
                tracing::warn!("collection cancelled, skipping remaining workspaces");
                break;
            }
            let results = self.run_workspace_collection_job(workspace_id).await;
            all.insert(workspace_id, results);
        }

        tracing::info!(workspaces = all.len(), "global collection finished");
        all
    }
}

fn skipped_for_rate_limit(account: &ActiveAccount, status: &RateLimitStatus) -> CollectionJobResult {
    tracing::info!(
        account_id = %account.id,
        platform = %account.platform,
        reset_at = %status.reset_at,
        "skipping account until rate limit resets"
    );
    JobProgress::start(account).finish(
        CollectionJobStatus::RateLimited,
        Some(format!(
            "Skipped until {} rate limit resets at {}",
            account.platform, status.reset_at
        )),
        Some(status.clone()),
    )
}
