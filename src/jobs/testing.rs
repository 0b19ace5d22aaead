//! In-memory collaborators for runner and scheduler tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::collectors::rate_limit::RateLimitStatus;
use crate::collectors::{
    AccountIdentity, CollectionOptions, CollectionResult, PlatformCollector, RawSocialMessage,
    Sender,
};
use crate::error::{AppError, CollectError};
use crate::jobs::CollectionJobResult;
use crate::jobs::store::{AccountStore, InboxStore, RunLog};
use crate::models::account::ActiveAccount;
use crate::models::collection_run::RunTrigger;
use crate::models::inbox_item::{DedupKey, InboxItem, NewInboxItem};
use crate::models::platform::{MessageKind, Platform};

pub(crate) fn account(workspace_id: Uuid, platform: Platform) -> ActiveAccount {
    ActiveAccount {
        id: Uuid::new_v4(),
        workspace_id,
        platform,
        platform_account_id: "1000".to_string(),
        handle: Some("acme".to_string()),
        access_token: "token".to_string(),
        last_collected_at: None,
    }
}

pub(crate) fn message(id: &str, kind: MessageKind) -> RawSocialMessage {
    RawSocialMessage {
        platform_item_id: id.to_string(),
        kind,
        content: format!("hello from {id}"),
        sender: Sender {
            platform_id: "42".to_string(),
            name: Some("Jane".to_string()),
            handle: Some("jane".to_string()),
            avatar_url: None,
        },
        original_post: None,
        received_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        raw: serde_json::json!({ "id": id }),
    }
}

/// Canned response for one collector call.
pub(crate) enum Script {
    Messages(Vec<RawSocialMessage>),
    /// Messages plus `has_more = true` but no cursor.
    MoreAvailable(Vec<RawSocialMessage>),
    /// Messages plus `has_more = true` and the cursor of the next page.
    Page(Vec<RawSocialMessage>, &'static str),
    Fail(&'static str),
}

/// Collector that replays scripted responses and records call order and the
/// cursor each call was given.
/// Calls with nothing scripted return an empty page.
pub(crate) struct FakeCollector {
    platform: Platform,
    can_collect: bool,
    rate_limit: Option<RateLimitStatus>,
    mentions: Mutex<VecDeque<Script>>,
    direct_messages: Mutex<VecDeque<Script>>,
    comments: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<&'static str>>,
    cursors: Mutex<Vec<(&'static str, Option<String>)>>,
}

impl FakeCollector {
    pub(crate) fn new(platform: Platform) -> Self {
        Self {
            platform,
            can_collect: true,
            rate_limit: None,
            mentions: Mutex::default(),
            direct_messages: Mutex::default(),
            comments: Mutex::default(),
            calls: Mutex::default(),
            cursors: Mutex::default(),
        }
    }

    pub(crate) fn with_can_collect(mut self, can_collect: bool) -> Self {
        self.can_collect = can_collect;
        self
    }

    pub(crate) fn with_rate_limit(mut self, status: RateLimitStatus) -> Self {
        self.rate_limit = Some(status);
        self
    }

    pub(crate) fn script_mentions(&self, script: Script) {
        self.mentions.lock().unwrap().push_back(script);
    }

    pub(crate) fn script_direct_messages(&self, script: Script) {
        self.direct_messages.lock().unwrap().push_back(script);
    }

    pub(crate) fn script_comments(&self, script: Script) {
        self.comments.lock().unwrap().push_back(script);
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn cursors(&self) -> Vec<(&'static str, Option<String>)> {
        self.cursors.lock().unwrap().clone()
    }

    fn replay(
        &self,
        call: &'static str,
        queue: &Mutex<VecDeque<Script>>,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError> {
        self.calls.lock().unwrap().push(call);
        self.cursors
            .lock()
            .unwrap()
            .push((call, options.cursor.clone()));
        let mut result = CollectionResult::empty(self.platform, account.account_id, self.rate_limit.clone());
        match queue.lock().unwrap().pop_front() {
            None => {}
            Some(Script::Messages(messages)) => result.messages = messages,
            Some(Script::MoreAvailable(messages)) => {
                result.messages = messages;
                result.has_more = true;
            }
            Some(Script::Page(messages, cursor)) => {
                result.messages = messages;
                result.has_more = true;
                result.cursor = Some(cursor.to_string());
            }
            Some(Script::Fail(message)) => return Err(CollectError::Other(message.to_string())),
        }
        Ok(result)
    }
}

#[async_trait]
impl PlatformCollector for FakeCollector {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn can_collect(&self, _token: &str) -> bool {
        self.calls.lock().unwrap().push("can_collect");
        self.can_collect
    }

    async fn collect_mentions(
        &self,
        _token: &str,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError> {
        self.replay("mentions", &self.mentions, account, options)
    }

    async fn collect_direct_messages(
        &self,
        _token: &str,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError> {
        self.replay("direct_messages", &self.direct_messages, account, options)
    }

    async fn collect_comments(
        &self,
        _token: &str,
        account: &AccountIdentity,
        options: &CollectionOptions,
    ) -> Result<CollectionResult, CollectError> {
        self.replay("comments", &self.comments, account, options)
    }

    fn rate_limit_status(&self) -> Option<RateLimitStatus> {
        self.rate_limit.clone()
    }
}

#[derive(Default)]
pub(crate) struct InMemoryInbox {
    existing: Mutex<HashSet<DedupKey>>,
    upserts: Mutex<Vec<NewInboxItem>>,
    failing_item: Mutex<Option<String>>,
    pub(crate) exists_calls: AtomicU32,
}

impl InMemoryInbox {
    pub(crate) fn seed(&self, key: DedupKey) {
        self.existing.lock().unwrap().insert(key);
    }

    pub(crate) fn fail_upsert_for(&self, platform_item_id: &str) {
        *self.failing_item.lock().unwrap() = Some(platform_item_id.to_string());
    }

    pub(crate) fn upserts(&self) -> Vec<NewInboxItem> {
        self.upserts.lock().unwrap().clone()
    }
}

#[async_trait]
impl InboxStore for InMemoryInbox {
    async fn exists_by_key(&self, key: &DedupKey) -> Result<bool, AppError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.existing.lock().unwrap().contains(key))
    }

    async fn upsert(&self, item: NewInboxItem) -> Result<InboxItem, AppError> {
        if self.failing_item.lock().unwrap().as_deref() == Some(item.platform_item_id.as_str()) {
            return Err(AppError::BadRequest("constraint violated".to_string()));
        }
        self.existing.lock().unwrap().insert(item.key());
        self.upserts.lock().unwrap().push(item.clone());
        let now = Utc::now();
        Ok(InboxItem {
            id: Uuid::new_v4(),
            workspace_id: item.workspace_id,
            account_id: item.account_id,
            platform: item.platform.to_string(),
            platform_item_id: item.platform_item_id,
            kind: item.kind.to_string(),
            content: item.content,
            sender_id: item.sender_id,
            sender_name: item.sender_name,
            sender_handle: item.sender_handle,
            sender_avatar_url: item.sender_avatar_url,
            original_post_id: item.original_post_id,
            original_post_url: item.original_post_url,
            received_at: item.received_at,
            raw_data: item.raw_data,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Fixed workspaces and accounts, in insertion order.
#[derive(Default)]
pub(crate) struct StaticAccounts {
    workspaces: Vec<(Uuid, Vec<ActiveAccount>)>,
    failing: bool,
    watermarks: Mutex<Vec<(Uuid, DateTime<Utc>)>>,
}

impl StaticAccounts {
    pub(crate) fn with_workspace(workspace_id: Uuid, accounts: Vec<ActiveAccount>) -> Self {
        let mut store = Self::default();
        store.add_workspace(workspace_id, accounts);
        store
    }

    pub(crate) fn add_workspace(&mut self, workspace_id: Uuid, accounts: Vec<ActiveAccount>) {
        self.workspaces.push((workspace_id, accounts));
    }

    /// Every read fails, as with an unreachable database.
    pub(crate) fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub(crate) fn watermarks(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        self.watermarks.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for StaticAccounts {
    async fn list_active_accounts(&self, workspace_id: Uuid) -> Result<Vec<ActiveAccount>, AppError> {
        self.check()?;
        Ok(self
            .workspaces
            .iter()
            .find(|(id, _)| *id == workspace_id)
            .map(|(_, accounts)| accounts.clone())
            .unwrap_or_default())
    }

    async fn list_workspaces_with_active_accounts(&self) -> Result<Vec<Uuid>, AppError> {
        self.check()?;
        Ok(self
            .workspaces
            .iter()
            .filter(|(_, accounts)| !accounts.is_empty())
            .map(|(id, _)| *id)
            .collect())
    }

    async fn get_active_account(&self, account_id: Uuid) -> Result<ActiveAccount, AppError> {
        self.check()?;
        self.workspaces
            .iter()
            .flat_map(|(_, accounts)| accounts.iter())
            .find(|a| a.id == account_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Active account {account_id} not found")))
    }

    async fn record_collected(&self, account_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        self.watermarks.lock().unwrap().push((account_id, at));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordedRuns {
    runs: Mutex<Vec<(Uuid, RunTrigger, usize)>>,
}

impl RecordedRuns {
    /// (workspace, trigger, result count) per record call.
    pub(crate) fn recorded(&self) -> Vec<(Uuid, RunTrigger, usize)> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunLog for RecordedRuns {
    async fn record(
        &self,
        workspace_id: Uuid,
        trigger: RunTrigger,
        results: &[CollectionJobResult],
    ) -> Result<(), AppError> {
        self.runs.lock().unwrap().push((workspace_id, trigger, results.len()));
        Ok(())
    }
}
