//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business
//! logic lives in the sync stages.

use crate::model::TaskKind;

/// Playlist slice used by the orchestrator stages.
#[derive(Debug, Clone)]
pub struct PlaylistRow {
    pub id: i64,
    pub external_id: String,
    pub user_id: i64,
    pub name: String,
    pub version: Option<String>,
    pub synced: bool,
    pub analyzed: bool,
}

/// Per-track feature slice consumed by the statistics computation.
#[derive(Debug, Clone)]
pub struct TrackFeatureRow {
    pub id: i64,
    pub external_id: String,
    pub name: String,
    pub danceability: Option<f64>,
    pub energy: Option<f64>,
    pub tempo: Option<f64>,
    pub valence: Option<f64>,
    pub loudness: Option<f64>,
    pub speechiness: Option<f64>,
    pub acousticness: Option<f64>,
    pub instrumentalness: Option<f64>,
    pub liveness: Option<f64>,
    pub key_signature: Option<i64>,
    pub mode: Option<i64>,
    pub time_signature: Option<i64>,
}

/// What a notification is bound to: exactly one task or one task group.
#[derive(Debug, Clone)]
pub enum TaskRef {
    Task(i64),
    Group(String),
}

/// Parameters for one queue insert.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub user_id: i64,
    pub external_id: Option<String>,
    pub ref_id: Option<i64>,
    pub after_task_id: Option<i64>,
    pub gate_key: Option<String>,
    pub group_key: Option<String>,
}

impl TaskSpec {
    pub fn new(kind: TaskKind, user_id: i64) -> Self {
        Self {
            kind,
            user_id,
            external_id: None,
            ref_id: None,
            after_task_id: None,
            gate_key: None,
            group_key: None,
        }
    }

    pub fn external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn ref_id(mut self, id: i64) -> Self {
        self.ref_id = Some(id);
        self
    }

    pub fn after(mut self, task_id: i64) -> Self {
        self.after_task_id = Some(task_id);
        self
    }

    pub fn gate(mut self, key: impl Into<String>) -> Self {
        self.gate_key = Some(key.into());
        self
    }

    pub fn group(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }
}
