//! # Correlation Module
//!
//! Matches results arriving on the shared result channel with the job that
//! dispatched the task. Each dispatched task registers a one-shot waiter
//! keyed by its task id; the result listener fulfils it.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::task::{TaskId, TaskKind, TaskResult};

/// Handle returned by [`PendingResults::register`], consumed by [`PendingResults::wait`]
#[derive(Debug)]
pub struct PendingTicket {
    task_id: TaskId,
    receiver: oneshot::Receiver<TaskResult>,
}

impl PendingTicket {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

/// Outcome of [`PendingResults::fulfill`]
#[derive(Debug)]
pub enum Fulfilment {
    Delivered,
    /// Nobody was waiting; the result is handed back
    Unclaimed(TaskResult),
}

/// Task id to waiter table
#[derive(Debug, Default)]
pub struct PendingResults {
    waiters: Mutex<HashMap<TaskId, oneshot::Sender<TaskResult>>>,
}

impl PendingResults {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, oneshot::Sender<TaskResult>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter; a previous waiter for the same id is dropped
    pub fn register(&self, task_id: &str) -> PendingTicket {
        let (sender, receiver) = oneshot::channel();
        if self.waiters().insert(task_id.to_string(), sender).is_some() {
            warn!(task_id = %task_id, "Replacing existing waiter");
        }
        PendingTicket {
            task_id: task_id.to_string(),
            receiver,
        }
    }

    pub fn fulfill(&self, result: TaskResult) -> Fulfilment {
        let Some(task_id) = result.task_id.clone() else {
            return Fulfilment::Unclaimed(result);
        };

        let Some(sender) = self.waiters().remove(&task_id) else {
            return Fulfilment::Unclaimed(result);
        };

        match sender.send(result) {
            Ok(()) => Fulfilment::Delivered,
            // The waiter gave up between lookup and send
            Err(result) => Fulfilment::Unclaimed(result),
        }
    }

    /// Wait for the result of `ticket`, `None` on timeout or replacement
    pub async fn wait(&self, ticket: PendingTicket, timeout: Duration) -> Option<TaskResult> {
        let PendingTicket { task_id, receiver } = ticket;

        let outcome = tokio::time::timeout(timeout, receiver).await;
        match outcome {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) => {
                debug!(task_id = %task_id, "Waiter was replaced");
                None
            }
            Err(_) => {
                let mut waiters = self.waiters();
                // Only remove our own entry, never a newer registration
                if waiters.get(&task_id).is_some_and(|s| s.is_closed()) {
                    waiters.remove(&task_id);
                }
                warn!(task_id = %task_id, timeout_secs = timeout.as_secs(), "Timed out waiting for result");
                None
            }
        }
    }

    /// Drop a registration whose task was never published
    pub fn cancel(&self, ticket: PendingTicket) {
        let PendingTicket { task_id, receiver } = ticket;
        drop(receiver);
        let mut waiters = self.waiters();
        if waiters.get(&task_id).is_some_and(|s| s.is_closed()) {
            waiters.remove(&task_id);
        }
    }

    pub fn len(&self) -> usize {
        self.waiters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.waiters().contains_key(task_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Dispatched,
    Processing,
    Delivering,
}

impl TaskStatus {
    pub fn code(self) -> &'static str {
        match self {
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Processing => "processing",
            TaskStatus::Delivering => "delivering",
        }
    }
}

/// Metadata about a dispatched task, kept until the job finishes
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub file_name: String,
    pub file_id: Option<String>,
    pub mime_type: Option<String>,
    pub language_code: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Chat id to active tasks
#[derive(Debug, Default)]
pub struct ActiveTasks {
    chats: Mutex<HashMap<i64, HashMap<TaskId, TaskInfo>>>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn chats(&self) -> std::sync::MutexGuard<'_, HashMap<i64, HashMap<TaskId, TaskInfo>>> {
        self.chats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, chat_id: i64, task_id: &str, info: TaskInfo) {
        self.chats()
            .entry(chat_id)
            .or_default()
            .insert(task_id.to_string(), info);
    }

    pub fn set_status(&self, chat_id: i64, task_id: &str, status: TaskStatus) {
        if let Some(info) = self
            .chats()
            .get_mut(&chat_id)
            .and_then(|tasks| tasks.get_mut(task_id))
        {
            info.status = status;
        }
    }

    /// Remove a task; the chat entry goes away with its last task
    pub fn remove(&self, chat_id: i64, task_id: &str) -> Option<TaskInfo> {
        let mut chats = self.chats();
        let tasks = chats.get_mut(&chat_id)?;
        let removed = tasks.remove(task_id);
        if tasks.is_empty() {
            chats.remove(&chat_id);
        }
        removed
    }

    pub fn get(&self, chat_id: i64, task_id: &str) -> Option<TaskInfo> {
        self.chats()
            .get(&chat_id)
            .and_then(|tasks| tasks.get(task_id))
            .cloned()
    }

    pub fn contains(&self, chat_id: i64, task_id: &str) -> bool {
        self.get(chat_id, task_id).is_some()
    }

    /// Tasks of a chat, oldest first
    pub fn tasks_for(&self, chat_id: i64) -> Vec<(TaskId, TaskInfo)> {
        let mut tasks: Vec<(TaskId, TaskInfo)> = self
            .chats()
            .get(&chat_id)
            .map(|tasks| tasks.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        tasks.sort_by_key(|(_, info)| info.started_at);
        tasks
    }

    pub fn oldest_for(&self, chat_id: i64) -> Option<TaskId> {
        self.tasks_for(chat_id).into_iter().next().map(|(id, _)| id)
    }

    pub fn total(&self) -> usize {
        self.chats().values().map(HashMap::len).sum()
    }

    pub fn has_chat(&self, chat_id: i64) -> bool {
        self.chats().contains_key(&chat_id)
    }
}

/// What the listener did with a result
#[derive(Debug)]
pub enum Routing {
    Delivered,
    /// No waiter but the task is still active; process it directly
    Process(TaskResult),
    Dropped,
}

/// Route one result from the result channel
pub fn route_result(pending: &PendingResults, active: &ActiveTasks, mut result: TaskResult) -> Routing {
    if result.task_id.is_none() {
        match active.oldest_for(result.chat_id) {
            Some(task_id) => {
                debug!(user_id = %result.chat_id, task_id = %task_id, "Result without task id, using oldest active task");
                result.task_id = Some(task_id);
            }
            None => {
                warn!(user_id = %result.chat_id, bot = %result.bot_name, "Result without task id and no active task");
                return Routing::Dropped;
            }
        }
    }

    match pending.fulfill(result) {
        Fulfilment::Delivered => Routing::Delivered,
        Fulfilment::Unclaimed(result) => {
            let task_id = result.task_id.clone().unwrap_or_default();
            if active.contains(result.chat_id, &task_id) {
                Routing::Process(result)
            } else {
                warn!(task_id = %task_id, user_id = %result.chat_id, "Dropping result for unknown task");
                Routing::Dropped
            }
        }
    }
}

/// Consume the result stream until it ends
///
/// Unclaimed results of active tasks are passed to `process` on their own tokio task.
pub async fn run_result_listener<S, P, Fut>(
    mut results: S,
    pending: Arc<PendingResults>,
    active: Arc<ActiveTasks>,
    process: P,
) where
    S: Stream<Item = TaskResult> + Unpin,
    P: Fn(TaskResult) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    info!("Result listener started");
    while let Some(result) = results.next().await {
        match route_result(&pending, &active, result) {
            Routing::Delivered | Routing::Dropped => {}
            Routing::Process(result) => {
                tokio::spawn(process(result));
            }
        }
    }
    warn!("Result stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ResultBody;

    fn result_for(task_id: Option<&str>, chat_id: i64) -> TaskResult {
        let mut result = TaskResult::new(
            TaskKind::Document,
            String::new(),
            chat_id,
            ResultBody::document("text".into(), "summary".into(), "a.txt".into()),
        );
        result.task_id = task_id.map(str::to_string);
        result
    }

    fn info(kind: TaskKind) -> TaskInfo {
        TaskInfo {
            kind,
            status: TaskStatus::Dispatched,
            file_name: "a.txt".to_string(),
            file_id: None,
            mime_type: None,
            language_code: None,
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fulfill_wakes_waiter() {
        let pending = PendingResults::new();
        let ticket = pending.register("t-1");
        assert!(pending.is_pending("t-1"));

        assert!(matches!(
            pending.fulfill(result_for(Some("t-1"), 1)),
            Fulfilment::Delivered
        ));
        let result = pending.wait(ticket, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap().task_id.as_deref(), Some("t-1"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let pending = PendingResults::new();
        let ticket = pending.register("t-1");
        let result = pending.wait(ticket, Duration::from_millis(10)).await;
        assert!(result.is_none());
        assert!(!pending.is_pending("t-1"));
        assert!(matches!(
            pending.fulfill(result_for(Some("t-1"), 1)),
            Fulfilment::Unclaimed(_)
        ));
    }

    #[tokio::test]
    async fn test_register_twice_replaces_older_waiter() {
        let pending = PendingResults::new();
        let first = pending.register("t-1");
        let second = pending.register("t-1");

        assert!(pending.wait(first, Duration::from_secs(1)).await.is_none());
        assert!(pending.is_pending("t-1"));

        pending.fulfill(result_for(Some("t-1"), 1));
        assert!(pending.wait(second, Duration::from_secs(1)).await.is_some());
    }

    #[test]
    fn test_cancel_keeps_newer_registration() {
        let pending = PendingResults::new();
        let ticket = pending.register("t-1");
        pending.cancel(ticket);
        assert!(pending.is_empty());

        let stale = pending.register("t-2");
        let _fresh = pending.register("t-2");
        pending.cancel(stale);
        assert!(pending.is_pending("t-2"));
    }

    #[test]
    fn test_active_tasks_remove_last_clears_chat() {
        let active = ActiveTasks::new();
        active.insert(9, "a", info(TaskKind::Image));
        active.insert(9, "b", info(TaskKind::Audio));
        assert_eq!(active.total(), 2);

        active.remove(9, "a");
        assert!(active.has_chat(9));
        active.remove(9, "b");
        assert!(!active.has_chat(9));
        assert!(active.remove(9, "b").is_none());
    }

    #[test]
    fn test_route_result_without_task_id_uses_oldest() {
        let pending = PendingResults::new();
        let active = ActiveTasks::new();
        active.insert(3, "first", info(TaskKind::Document));
        let _ticket = pending.register("first");

        let routing = route_result(&pending, &active, result_for(None, 3));
        assert!(matches!(routing, Routing::Delivered));
    }

    #[test]
    fn test_route_result_unknown_task_dropped() {
        let pending = PendingResults::new();
        let active = ActiveTasks::new();
        assert!(matches!(
            route_result(&pending, &active, result_for(Some("ghost"), 3)),
            Routing::Dropped
        ));

        active.insert(3, "late", info(TaskKind::Document));
        assert!(matches!(
            route_result(&pending, &active, result_for(Some("late"), 3)),
            Routing::Process(_)
        ));
    }
}
