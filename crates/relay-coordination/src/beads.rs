//! Beads task records and the durable task log.
//!
//! The log is the only authority on task state. It is a JSON-lines file that
//! is rewritten whole through a temp file and rename on every mutation, so a
//! reader never sees a half-written log.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::{CoordinationError, CoordinationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Blocked | Self::Closed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work in the task log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeadsTask {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    /// Lower is more urgent.
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_reason: Option<String>,
}

impl BeadsTask {
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: i32, now: u64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Open,
            priority,
            assignee: None,
            lease_expires: None,
            created_at: now,
            updated_at: now,
            blocked_reason: None,
            closed_reason: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn lease_expired(&self, now: u64) -> bool {
        self.lease_expires.map_or(true, |expires| expires <= now)
    }

    /// Whether the task may be offered to a worker at `now`.
    ///
    /// Open tasks are ready when unassigned or when their lease has run out.
    /// An in-progress task whose lease has expired is treated the same way:
    /// its worker stopped renewing, so the task goes back on offer.
    pub fn is_ready(&self, now: u64) -> bool {
        match self.status {
            TaskStatus::Open => self.assignee.is_none() || self.lease_expired(now),
            TaskStatus::InProgress => self.lease_expired(now),
            TaskStatus::Blocked | TaskStatus::Closed => false,
        }
    }

    /// Whether `worker` currently holds a live lease on this task.
    pub fn is_leased_to(&self, worker: &str, now: u64) -> bool {
        self.status == TaskStatus::InProgress
            && self.assignee.as_deref() == Some(worker)
            && !self.lease_expired(now)
    }

    /// Task description sent to the assigned worker.
    pub fn assignment_body(&self) -> String {
        match &self.description {
            Some(description) => format!("TASK {}: {}\n\n{}", self.id, self.title, description),
            None => format!("TASK {}: {}", self.id, self.title),
        }
    }
}

/// Ready tasks at `now`, most urgent first. Equal priorities keep the oldest
/// task first.
pub fn ready_tasks(tasks: &[BeadsTask], now: u64) -> Vec<BeadsTask> {
    let mut ready: Vec<BeadsTask> = tasks.iter().filter(|t| t.is_ready(now)).cloned().collect();
    ready.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
    ready
}

/// In-place edit applied by [`TaskLog::update`].
pub type TaskMutation = Box<dyn FnOnce(&mut BeadsTask) -> CoordinationResult<()> + Send>;

/// Durable storage for [`BeadsTask`] records.
#[async_trait]
pub trait TaskLog: Send + Sync {
    async fn load(&self) -> CoordinationResult<Vec<BeadsTask>>;

    /// Replace the whole log.
    async fn save(&self, tasks: &[BeadsTask]) -> CoordinationResult<()>;

    /// Read-modify-write of a single task. Last writer wins.
    async fn update(&self, task_id: &str, f: TaskMutation) -> CoordinationResult<BeadsTask>;

    async fn get(&self, task_id: &str) -> CoordinationResult<Option<BeadsTask>> {
        Ok(self.load().await?.into_iter().find(|t| t.id == task_id))
    }

    async fn insert(&self, task: BeadsTask) -> CoordinationResult<()> {
        let mut tasks = self.load().await?;
        tasks.retain(|t| t.id != task.id);
        tasks.push(task);
        self.save(&tasks).await
    }
}

fn apply(tasks: &mut [BeadsTask], task_id: &str, f: TaskMutation) -> CoordinationResult<BeadsTask> {
    let task = tasks
        .iter_mut()
        .find(|t| t.id == task_id)
        .ok_or_else(|| CoordinationError::TaskNotFound(task_id.to_string()))?;
    f(task)?;
    Ok(task.clone())
}

// ---------------------------------------------------------------------------
// JSONL file
// ---------------------------------------------------------------------------

pub struct JsonlTaskLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTaskLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> CoordinationResult<Vec<BeadsTask>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut tasks = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BeadsTask>(line) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping malformed task record"
                ),
            }
        }
        Ok(tasks)
    }

    async fn write_file(&self, tasks: &[BeadsTask]) -> CoordinationResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut out = String::new();
        for task in tasks {
            out.push_str(&serde_json::to_string(task)?);
            out.push('\n');
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, out).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskLog for JsonlTaskLog {
    async fn load(&self) -> CoordinationResult<Vec<BeadsTask>> {
        self.read_file().await
    }

    async fn save(&self, tasks: &[BeadsTask]) -> CoordinationResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write_file(tasks).await
    }

    async fn update(&self, task_id: &str, f: TaskMutation) -> CoordinationResult<BeadsTask> {
        let _guard = self.write_lock.lock().await;
        let mut tasks = self.read_file().await?;
        let updated = apply(&mut tasks, task_id, f)?;
        self.write_file(&tasks).await?;
        Ok(updated)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTaskLog {
    tasks: RwLock<Vec<BeadsTask>>,
}

impl MemoryTaskLog {
    pub fn new(tasks: Vec<BeadsTask>) -> Self {
        Self {
            tasks: RwLock::new(tasks),
        }
    }
}

#[async_trait]
impl TaskLog for MemoryTaskLog {
    async fn load(&self) -> CoordinationResult<Vec<BeadsTask>> {
        Ok(self.tasks.read().await.clone())
    }

    async fn save(&self, tasks: &[BeadsTask]) -> CoordinationResult<()> {
        *self.tasks.write().await = tasks.to_vec();
        Ok(())
    }

    async fn update(&self, task_id: &str, f: TaskMutation) -> CoordinationResult<BeadsTask> {
        let mut tasks = self.tasks.write().await;
        apply(&mut tasks, task_id, f)
    }
}
