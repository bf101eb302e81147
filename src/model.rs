use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "RUNNING" => Some(TaskStatus::Running),
            "SUCCESS" => Some(TaskStatus::Success),
            "FAILURE" => Some(TaskStatus::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

/// Operation tags for the task queue. Dispatch is an exhaustive `match` in
/// the worker; an unknown tag in the database is a claim-time error, not a
/// silently skipped row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskKind {
    SyncPlaylist,
    SyncTracks,
    FetchFeatures,
    FetchArtist,
    Analyze,
    Compute,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::SyncPlaylist => "sync-playlist",
            TaskKind::SyncTracks => "sync-tracks",
            TaskKind::FetchFeatures => "fetch-features",
            TaskKind::FetchArtist => "fetch-artist",
            TaskKind::Analyze => "analyze",
            TaskKind::Compute => "compute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync-playlist" => Some(TaskKind::SyncPlaylist),
            "sync-tracks" => Some(TaskKind::SyncTracks),
            "fetch-features" => Some(TaskKind::FetchFeatures),
            "fetch-artist" => Some(TaskKind::FetchArtist),
            "analyze" => Some(TaskKind::Analyze),
            "compute" => Some(TaskKind::Compute),
            _ => None,
        }
    }

    /// Resource noun reported in notifications for this operation.
    pub fn resource(&self) -> &'static str {
        match self {
            TaskKind::SyncPlaylist => "playlist",
            TaskKind::SyncTracks => "playlist",
            TaskKind::FetchFeatures => "track",
            TaskKind::FetchArtist => "artist",
            TaskKind::Analyze => "analysis",
            TaskKind::Compute => "computation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub external_id: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: i64,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub user_id: i64,
    pub external_id: Option<String>,
    pub ref_id: Option<i64>,
    pub after_task_id: Option<i64>,
    pub gate_key: Option<String>,
    pub group_key: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub task_id: Option<i64>,
    pub group_key: Option<String>,
    pub resource: Option<String>,
    pub resource_id: Option<String>,
    pub operation: String,
    pub status: TaskStatus,
    pub extras: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub id: i64,
    pub notification_id: i64,
    pub user_id: i64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}
