use super::model::{PlaylistRow, TaskRef, TaskSpec, TrackFeatureRow};
use crate::catalog::{RemoteAlbum, RemoteFeatures, RemotePlaylist};
use crate::model::{Acknowledgement, Notification, SyncTask, TaskKind, TaskStatus, User};
use anyhow::{anyhow, Result};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn get_or_create_user(
    pool: &Pool,
    external_id: &str,
    display_name: Option<&str>,
) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE external_id = ?")
        .bind(external_id)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query("INSERT INTO users (external_id, display_name) VALUES (?, ?) RETURNING id")
        .bind(external_id)
        .bind(display_name)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn set_user_tokens(
    pool: &Pool,
    user_id: i64,
    access_token: &str,
    refresh_token: &str,
) -> Result<()> {
    sqlx::query("UPDATE users SET access_token = ?, refresh_token = ? WHERE id = ?")
        .bind(access_token)
        .bind(refresh_token)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_user(pool: &Pool, user_id: i64) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, external_id, display_name, created_at FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| User {
        id: row.get("id"),
        external_id: row.get("external_id"),
        display_name: row.try_get("display_name").ok(),
        created_at: row.get("created_at"),
    }))
}

// ---------------------------------------------------------------------------
// Resource upserts (keyed by external id; single atomic statement each so
// concurrent workers discovering the same external id converge to one row)
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(external_id = %remote.id))]
pub async fn upsert_playlist(pool: &Pool, user_id: i64, remote: &RemotePlaylist) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO playlists (external_id, user_id, name, owner, version, public, collaborative, artwork_url, synced) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1) \
         ON CONFLICT(external_id) DO UPDATE SET \
             name = excluded.name, owner = excluded.owner, version = excluded.version, \
             public = excluded.public, collaborative = excluded.collaborative, \
             artwork_url = excluded.artwork_url, synced = 1, \
             updated_at = CURRENT_TIMESTAMP \
         RETURNING id",
    )
    .bind(&remote.id)
    .bind(user_id)
    .bind(&remote.name)
    .bind(&remote.owner)
    .bind(&remote.version)
    .bind(remote.public)
    .bind(remote.collaborative)
    .bind(&remote.artwork_url)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn playlist_version(pool: &Pool, external_id: &str) -> Result<Option<String>> {
    let version: Option<Option<String>> =
        sqlx::query_scalar("SELECT version FROM playlists WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(pool)
            .await?;
    Ok(version.flatten())
}

#[instrument(skip_all, fields(external_id))]
pub async fn upsert_artist(pool: &Pool, external_id: &str, name: &str) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO artists (external_id, name, synced) VALUES (?, ?, 1) \
         ON CONFLICT(external_id) DO UPDATE SET \
             name = excluded.name, synced = 1, updated_at = CURRENT_TIMESTAMP \
         RETURNING id",
    )
    .bind(external_id)
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn update_artist_detail(
    pool: &Pool,
    artist_id: i64,
    genres: &[String],
    popularity: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "UPDATE artists SET genres = ?, popularity = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(genres.join(","))
    .bind(popularity)
    .bind(artist_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all, fields(external_id = %remote.id))]
pub async fn upsert_album(pool: &Pool, remote: &RemoteAlbum) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO albums (external_id, name, release_date, artwork_url, synced) \
         VALUES (?, ?, ?, ?, 1) \
         ON CONFLICT(external_id) DO UPDATE SET \
             name = excluded.name, release_date = excluded.release_date, \
             artwork_url = excluded.artwork_url, synced = 1, updated_at = CURRENT_TIMESTAMP \
         RETURNING id",
    )
    .bind(&remote.id)
    .bind(&remote.name)
    .bind(&remote.release_date)
    .bind(&remote.artwork_url)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(external_id))]
pub async fn upsert_track(
    pool: &Pool,
    external_id: &str,
    name: &str,
    artist_id: Option<i64>,
    album_id: Option<i64>,
    duration_ms: Option<i64>,
    popularity: Option<i64>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO tracks (external_id, name, artist_id, album_id, duration_ms, popularity, synced) \
         VALUES (?, ?, ?, ?, ?, ?, 1) \
         ON CONFLICT(external_id) DO UPDATE SET \
             name = excluded.name, artist_id = excluded.artist_id, album_id = excluded.album_id, \
             duration_ms = excluded.duration_ms, popularity = excluded.popularity, \
             synced = 1, updated_at = CURRENT_TIMESTAMP \
         RETURNING id",
    )
    .bind(external_id)
    .bind(name)
    .bind(artist_id)
    .bind(album_id)
    .bind(duration_ms)
    .bind(popularity)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn link_playlist_track(pool: &Pool, playlist_id: i64, track_id: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO playlist_tracks (playlist_id, track_id) VALUES (?, ?)")
        .bind(playlist_id)
        .bind(track_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_track_features(
    pool: &Pool,
    track_id: i64,
    features: &RemoteFeatures,
) -> Result<()> {
    sqlx::query(
        "UPDATE tracks SET danceability = ?, energy = ?, tempo = ?, valence = ?, loudness = ?, \
             speechiness = ?, acousticness = ?, instrumentalness = ?, liveness = ?, \
             key_signature = ?, mode = ?, time_signature = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ?",
    )
    .bind(features.danceability)
    .bind(features.energy)
    .bind(features.tempo)
    .bind(features.valence)
    .bind(features.loudness)
    .bind(features.speechiness)
    .bind(features.acousticness)
    .bind(features.instrumentalness)
    .bind(features.liveness)
    .bind(features.key)
    .bind(features.mode)
    .bind(features.time_signature)
    .bind(track_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_playlist(pool: &Pool, playlist_id: i64) -> Result<Option<PlaylistRow>> {
    let row = sqlx::query(
        "SELECT id, external_id, user_id, name, version, synced, analyzed FROM playlists WHERE id = ?",
    )
    .bind(playlist_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(map_playlist_row))
}

pub async fn get_playlist_by_external_id(
    pool: &Pool,
    external_id: &str,
) -> Result<Option<PlaylistRow>> {
    let row = sqlx::query(
        "SELECT id, external_id, user_id, name, version, synced, analyzed FROM playlists WHERE external_id = ?",
    )
    .bind(external_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(map_playlist_row))
}

fn map_playlist_row(row: sqlx::sqlite::SqliteRow) -> PlaylistRow {
    PlaylistRow {
        id: row.get("id"),
        external_id: row.get("external_id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        version: row.try_get::<Option<String>, _>("version").ok().flatten(),
        synced: row.get::<i64, _>("synced") != 0,
        analyzed: row.get::<i64, _>("analyzed") != 0,
    }
}

/// Flip the analyzed flag. Guarded by `synced` both here and by the table
/// CHECK constraint; returns an error instead of regressing the invariant.
pub async fn mark_playlist_analyzed(pool: &Pool, playlist_id: i64) -> Result<()> {
    let res = sqlx::query(
        "UPDATE playlists SET analyzed = 1, updated_at = CURRENT_TIMESTAMP WHERE id = ? AND synced = 1",
    )
    .bind(playlist_id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!(
            "playlist {} cannot be marked analyzed while unsynced",
            playlist_id
        ));
    }
    Ok(())
}

pub async fn playlist_track_ids(pool: &Pool, playlist_id: i64) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        "SELECT track_id FROM playlist_tracks WHERE playlist_id = ? ORDER BY track_id",
    )
    .bind(playlist_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Task queue
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(kind = spec.kind.as_str()))]
pub async fn enqueue_task(pool: &Pool, spec: &TaskSpec) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO sync_tasks (kind, user_id, external_id, ref_id, after_task_id, gate_key, group_key) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(spec.kind.as_str())
    .bind(spec.user_id)
    .bind(&spec.external_id)
    .bind(spec.ref_id)
    .bind(spec.after_task_id)
    .bind(&spec.gate_key)
    .bind(&spec.group_key)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Enqueue a strictly sequential chain; each task waits for its
/// predecessor's SUCCESS. Returns the task ids in order.
pub async fn enqueue_chain(pool: &Pool, specs: Vec<TaskSpec>) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(specs.len());
    let mut prev: Option<i64> = None;
    for mut spec in specs {
        if spec.after_task_id.is_none() {
            spec.after_task_id = prev;
        }
        let id = enqueue_task(pool, &spec).await?;
        prev = Some(id);
        ids.push(id);
    }
    Ok(ids)
}

/// Mark PENDING tasks whose predecessor failed as FAILURE themselves,
/// cascading down the chain. The aborted tasks never run.
pub async fn propagate_chain_failures(pool: &Pool) -> Result<u64> {
    let mut total = 0;
    loop {
        let res = sqlx::query(
            "UPDATE sync_tasks SET status = 'FAILURE', error = 'aborted: upstream task failed', \
                 updated_at = CURRENT_TIMESTAMP \
             WHERE status = 'PENDING' AND after_task_id IN \
                 (SELECT id FROM sync_tasks WHERE status = 'FAILURE')",
        )
        .execute(pool)
        .await?;
        if res.rows_affected() == 0 {
            break;
        }
        total += res.rows_affected();
    }
    Ok(total)
}

/// Claim the next ready task: PENDING, predecessor (if any) SUCCESS, and no
/// non-terminal task left under its gate key. The PENDING→RUNNING flip is a
/// single conditional UPDATE, atomic under concurrent workers.
#[instrument(skip_all)]
pub async fn claim_next_task(pool: &Pool) -> Result<Option<SyncTask>> {
    propagate_chain_failures(pool).await?;

    let row = sqlx::query(
        "UPDATE sync_tasks SET status = 'RUNNING', updated_at = CURRENT_TIMESTAMP \
         WHERE id = ( \
             SELECT t.id FROM sync_tasks t \
             LEFT JOIN sync_tasks p ON t.after_task_id = p.id \
             WHERE t.status = 'PENDING' \
               AND (t.after_task_id IS NULL OR p.status = 'SUCCESS') \
               AND (t.gate_key IS NULL OR NOT EXISTS ( \
                   SELECT 1 FROM sync_tasks g \
                   WHERE g.group_key = t.gate_key AND g.status IN ('PENDING', 'RUNNING'))) \
             ORDER BY t.id ASC LIMIT 1 \
         ) AND status = 'PENDING' \
         RETURNING id, kind, status, user_id, external_id, ref_id, after_task_id, gate_key, group_key, error",
    )
    .fetch_optional(pool)
    .await?;

    row.map(map_task_row).transpose()
}

fn map_task_row(row: sqlx::sqlite::SqliteRow) -> Result<SyncTask> {
    let kind_str: String = row.get("kind");
    let kind = TaskKind::parse(&kind_str)
        .ok_or_else(|| anyhow!("unknown task kind {} in queue", kind_str))?;
    let status_str: String = row.get("status");
    let status = TaskStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("unknown task status {} in queue", status_str))?;
    Ok(SyncTask {
        id: row.get("id"),
        kind,
        status,
        user_id: row.get("user_id"),
        external_id: row.try_get::<Option<String>, _>("external_id").ok().flatten(),
        ref_id: row.try_get::<Option<i64>, _>("ref_id").ok().flatten(),
        after_task_id: row
            .try_get::<Option<i64>, _>("after_task_id")
            .ok()
            .flatten(),
        gate_key: row.try_get::<Option<String>, _>("gate_key").ok().flatten(),
        group_key: row.try_get::<Option<String>, _>("group_key").ok().flatten(),
        error: row.try_get::<Option<String>, _>("error").ok().flatten(),
    })
}

#[instrument(skip_all, fields(task_id, status = status.as_str()))]
pub async fn finish_task(
    pool: &Pool,
    task_id: i64,
    status: TaskStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE sync_tasks SET status = ?, error = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_task(pool: &Pool, task_id: i64) -> Result<Option<SyncTask>> {
    let row = sqlx::query(
        "SELECT id, kind, status, user_id, external_id, ref_id, after_task_id, gate_key, group_key, error \
         FROM sync_tasks WHERE id = ?",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?;
    row.map(map_task_row).transpose()
}

pub async fn count_pending_tasks(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sync_tasks WHERE status IN ('PENDING', 'RUNNING')",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Notifications & acknowledgements
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_notification(
    pool: &Pool,
    user_id: i64,
    bound_to: &TaskRef,
    resource: Option<&str>,
    resource_id: Option<&str>,
    operation: &str,
) -> Result<Notification> {
    let (task_id, group_key) = match bound_to {
        TaskRef::Task(id) => (Some(*id), None),
        TaskRef::Group(key) => (None, Some(key.clone())),
    };
    let rec = sqlx::query(
        "INSERT INTO notifications (user_id, task_id, group_key, resource, resource_id, operation, status) \
         VALUES (?, ?, ?, ?, ?, ?, 'RUNNING') RETURNING id",
    )
    .bind(user_id)
    .bind(task_id)
    .bind(&group_key)
    .bind(resource)
    .bind(resource_id)
    .bind(operation)
    .fetch_one(pool)
    .await?;
    let id: i64 = rec.get("id");
    get_notification(pool, id)
        .await?
        .ok_or_else(|| anyhow!("notification {} vanished after insert", id))
}

pub async fn get_notification(pool: &Pool, id: i64) -> Result<Option<Notification>> {
    let row = sqlx::query(
        "SELECT id, user_id, task_id, group_key, resource, resource_id, operation, status, extras \
         FROM notifications WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(map_notification_row).transpose()
}

pub async fn notification_for_task(pool: &Pool, task_id: i64) -> Result<Option<Notification>> {
    let row = sqlx::query(
        "SELECT id, user_id, task_id, group_key, resource, resource_id, operation, status, extras \
         FROM notifications WHERE task_id = ?",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?;
    row.map(map_notification_row).transpose()
}

pub async fn notification_for_group(pool: &Pool, group_key: &str) -> Result<Option<Notification>> {
    let row = sqlx::query(
        "SELECT id, user_id, task_id, group_key, resource, resource_id, operation, status, extras \
         FROM notifications WHERE group_key = ?",
    )
    .bind(group_key)
    .fetch_optional(pool)
    .await?;
    row.map(map_notification_row).transpose()
}

fn map_notification_row(row: sqlx::sqlite::SqliteRow) -> Result<Notification> {
    let status_str: String = row.get("status");
    let status = TaskStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("unknown notification status {}", status_str))?;
    Ok(Notification {
        id: row.get("id"),
        user_id: row.get("user_id"),
        task_id: row.try_get::<Option<i64>, _>("task_id").ok().flatten(),
        group_key: row.try_get::<Option<String>, _>("group_key").ok().flatten(),
        resource: row.try_get::<Option<String>, _>("resource").ok().flatten(),
        resource_id: row
            .try_get::<Option<String>, _>("resource_id")
            .ok()
            .flatten(),
        operation: row.get("operation"),
        status,
        extras: row.try_get::<Option<String>, _>("extras").ok().flatten(),
    })
}

#[instrument(skip_all, fields(notification_id, status = status.as_str()))]
pub async fn update_notification_status(
    pool: &Pool,
    notification_id: i64,
    status: TaskStatus,
    extras: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE notifications SET status = ?, extras = COALESCE(?, extras), \
             updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(extras)
    .bind(notification_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Store a task's result payload on its notification so the completed
/// event carries it after the settling delay.
pub async fn set_notification_extras(pool: &Pool, task_id: i64, extras: &str) -> Result<()> {
    sqlx::query(
        "UPDATE notifications SET extras = ?, updated_at = CURRENT_TIMESTAMP WHERE task_id = ?",
    )
    .bind(extras)
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Get-or-create: at most one acknowledgement exists per notification; a
/// repeat ack returns the existing row unchanged.
#[instrument(skip_all, fields(notification_id))]
pub async fn acknowledge_notification(
    pool: &Pool,
    notification_id: i64,
    user_id: i64,
    message: Option<&str>,
) -> Result<Acknowledgement> {
    sqlx::query(
        "INSERT OR IGNORE INTO acknowledgements (notification_id, user_id, message) VALUES (?, ?, ?)",
    )
    .bind(notification_id)
    .bind(user_id)
    .bind(message)
    .execute(pool)
    .await?;

    let row = sqlx::query(
        "SELECT id, notification_id, user_id, message, created_at FROM acknowledgements \
         WHERE notification_id = ?",
    )
    .bind(notification_id)
    .fetch_one(pool)
    .await?;
    Ok(Acknowledgement {
        id: row.get("id"),
        notification_id: row.get("notification_id"),
        user_id: row.get("user_id"),
        message: row.try_get::<Option<String>, _>("message").ok().flatten(),
        created_at: row.get("created_at"),
    })
}

// ---------------------------------------------------------------------------
// Analyses & computations
// ---------------------------------------------------------------------------

/// Analysis rows are scoped to (playlist, version): a new snapshot version
/// creates a new analysis rather than mutating history.
#[instrument(skip_all, fields(playlist_id, version))]
pub async fn get_or_create_analysis(pool: &Pool, playlist_id: i64, version: &str) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO analyses (playlist_id, version) VALUES (?, ?) \
         ON CONFLICT(playlist_id, version) DO UPDATE SET version = excluded.version \
         RETURNING id",
    )
    .bind(playlist_id)
    .bind(version)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn get_analysis(pool: &Pool, playlist_id: i64, version: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar("SELECT id FROM analyses WHERE playlist_id = ? AND version = ?")
        .bind(playlist_id)
        .bind(version)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

pub async fn attach_analysis_tracks(
    pool: &Pool,
    analysis_id: i64,
    track_ids: &[i64],
) -> Result<()> {
    for track_id in track_ids {
        sqlx::query("INSERT OR IGNORE INTO analysis_tracks (analysis_id, track_id) VALUES (?, ?)")
            .bind(analysis_id)
            .bind(track_id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

pub async fn analysis_track_features(
    pool: &Pool,
    analysis_id: i64,
) -> Result<Vec<TrackFeatureRow>> {
    let rows = sqlx::query(
        "SELECT t.id, t.external_id, t.name, t.danceability, t.energy, t.tempo, t.valence, \
                t.loudness, t.speechiness, t.acousticness, t.instrumentalness, t.liveness, \
                t.key_signature, t.mode, t.time_signature \
         FROM tracks t JOIN analysis_tracks at ON at.track_id = t.id \
         WHERE at.analysis_id = ? ORDER BY t.id",
    )
    .bind(analysis_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| TrackFeatureRow {
            id: row.get("id"),
            external_id: row.get("external_id"),
            name: row.get("name"),
            danceability: row.try_get("danceability").ok(),
            energy: row.try_get("energy").ok(),
            tempo: row.try_get("tempo").ok(),
            valence: row.try_get("valence").ok(),
            loudness: row.try_get("loudness").ok(),
            speechiness: row.try_get("speechiness").ok(),
            acousticness: row.try_get("acousticness").ok(),
            instrumentalness: row.try_get("instrumentalness").ok(),
            liveness: row.try_get("liveness").ok(),
            key_signature: row.try_get("key_signature").ok(),
            mode: row.try_get("mode").ok(),
            time_signature: row.try_get("time_signature").ok(),
        })
        .collect())
}

/// Keyed uniquely by (analysis, playlist); re-running computation overwrites
/// the payload in place.
#[instrument(skip_all, fields(analysis_id, playlist_id))]
pub async fn upsert_computation(
    pool: &Pool,
    analysis_id: i64,
    playlist_id: i64,
    payload: &str,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO computations (analysis_id, playlist_id, payload) VALUES (?, ?, ?) \
         ON CONFLICT(analysis_id, playlist_id) DO UPDATE SET \
             payload = excluded.payload, updated_at = CURRENT_TIMESTAMP \
         RETURNING id",
    )
    .bind(analysis_id)
    .bind(playlist_id)
    .bind(payload)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskKind;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_playlist(id: &str, version: &str) -> RemotePlaylist {
        RemotePlaylist {
            id: id.into(),
            name: format!("playlist {id}"),
            owner: Some("owner".into()),
            version: version.into(),
            public: true,
            collaborative: false,
            artwork_url: None,
        }
    }

    #[tokio::test]
    async fn upsert_playlist_is_idempotent() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "u1", Some("User One")).await.unwrap();

        let a = upsert_playlist(&pool, uid, &sample_playlist("p1", "v1"))
            .await
            .unwrap();
        let b = upsert_playlist(&pool, uid, &sample_playlist("p1", "v2"))
            .await
            .unwrap();
        assert_eq!(a, b);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM playlists")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            playlist_version(&pool, "p1").await.unwrap().as_deref(),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn analyzed_requires_synced() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "u1", None).await.unwrap();
        let pid = upsert_playlist(&pool, uid, &sample_playlist("p1", "v1"))
            .await
            .unwrap();

        // force unsynced, then try to mark analyzed
        sqlx::query("UPDATE playlists SET synced = 0, analyzed = 0 WHERE id = ?")
            .bind(pid)
            .execute(&pool)
            .await
            .unwrap();
        assert!(mark_playlist_analyzed(&pool, pid).await.is_err());

        sqlx::query("UPDATE playlists SET synced = 1 WHERE id = ?")
            .bind(pid)
            .execute(&pool)
            .await
            .unwrap();
        mark_playlist_analyzed(&pool, pid).await.unwrap();

        // the CHECK constraint rejects the regression outright
        let res = sqlx::query("UPDATE playlists SET synced = 0 WHERE id = ?")
            .bind(pid)
            .execute(&pool)
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn chain_claim_respects_predecessor() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "u1", None).await.unwrap();

        let ids = enqueue_chain(
            &pool,
            vec![
                TaskSpec::new(TaskKind::SyncTracks, uid).ref_id(1),
                TaskSpec::new(TaskKind::Analyze, uid).ref_id(1),
            ],
        )
        .await
        .unwrap();

        let first = claim_next_task(&pool).await.unwrap().unwrap();
        assert_eq!(first.id, ids[0]);

        // successor not claimable while predecessor is RUNNING
        assert!(claim_next_task(&pool).await.unwrap().is_none());

        finish_task(&pool, ids[0], TaskStatus::Success, None)
            .await
            .unwrap();
        let second = claim_next_task(&pool).await.unwrap().unwrap();
        assert_eq!(second.id, ids[1]);
    }

    #[tokio::test]
    async fn chain_aborts_after_failure() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "u1", None).await.unwrap();

        let ids = enqueue_chain(
            &pool,
            vec![
                TaskSpec::new(TaskKind::SyncTracks, uid).ref_id(1),
                TaskSpec::new(TaskKind::Analyze, uid).ref_id(1),
                TaskSpec::new(TaskKind::Compute, uid).ref_id(1),
            ],
        )
        .await
        .unwrap();

        let first = claim_next_task(&pool).await.unwrap().unwrap();
        finish_task(&pool, first.id, TaskStatus::Failure, Some("boom"))
            .await
            .unwrap();

        // nothing left to claim; the rest of the chain is aborted
        assert!(claim_next_task(&pool).await.unwrap().is_none());
        for id in &ids[1..] {
            let task = get_task(&pool, *id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Failure);
            assert!(task.error.unwrap().contains("upstream"));
        }
    }

    #[tokio::test]
    async fn gate_holds_until_group_terminal() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "u1", None).await.unwrap();

        let gate = "gate-1";
        let f1 = enqueue_task(
            &pool,
            &TaskSpec::new(TaskKind::FetchFeatures, uid).ref_id(1).group(gate),
        )
        .await
        .unwrap();
        let f2 = enqueue_task(
            &pool,
            &TaskSpec::new(TaskKind::FetchArtist, uid).ref_id(2).group(gate),
        )
        .await
        .unwrap();
        let analyze = enqueue_task(
            &pool,
            &TaskSpec::new(TaskKind::Analyze, uid).ref_id(1).gate(gate),
        )
        .await
        .unwrap();

        let t1 = claim_next_task(&pool).await.unwrap().unwrap();
        assert_eq!(t1.id, f1);
        let t2 = claim_next_task(&pool).await.unwrap().unwrap();
        assert_eq!(t2.id, f2);
        assert!(claim_next_task(&pool).await.unwrap().is_none());

        finish_task(&pool, f1, TaskStatus::Success, None).await.unwrap();
        // one member still running: gate holds
        assert!(claim_next_task(&pool).await.unwrap().is_none());

        // FAILURE is terminal too; the gate opens regardless of outcome
        finish_task(&pool, f2, TaskStatus::Failure, Some("nope"))
            .await
            .unwrap();
        let gated = claim_next_task(&pool).await.unwrap().unwrap();
        assert_eq!(gated.id, analyze);
    }

    #[tokio::test]
    async fn notification_binding_is_exclusive() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "u1", None).await.unwrap();
        let task_id = enqueue_task(&pool, &TaskSpec::new(TaskKind::Analyze, uid))
            .await
            .unwrap();

        let n = create_notification(
            &pool,
            uid,
            &TaskRef::Task(task_id),
            Some("playlist"),
            Some("p1"),
            "analyze",
        )
        .await
        .unwrap();
        assert_eq!(n.task_id, Some(task_id));
        assert!(n.group_key.is_none());

        // both bindings at once violates the table CHECK
        let res = sqlx::query(
            "INSERT INTO notifications (user_id, task_id, group_key, operation) VALUES (?, ?, ?, ?)",
        )
        .bind(uid)
        .bind(task_id)
        .bind("group-1")
        .bind("analyze")
        .execute(&pool)
        .await;
        assert!(res.is_err());

        // neither binding violates it too
        let res = sqlx::query("INSERT INTO notifications (user_id, operation) VALUES (?, ?)")
            .bind(uid)
            .bind("analyze")
            .execute(&pool)
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn acknowledgement_is_get_or_create() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "u1", None).await.unwrap();
        let task_id = enqueue_task(&pool, &TaskSpec::new(TaskKind::Analyze, uid))
            .await
            .unwrap();
        let n = create_notification(&pool, uid, &TaskRef::Task(task_id), None, None, "analyze")
            .await
            .unwrap();

        let a = acknowledge_notification(&pool, n.id, uid, Some("seen"))
            .await
            .unwrap();
        let b = acknowledge_notification(&pool, n.id, uid, Some("seen again"))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.message.as_deref(), Some("seen"));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM acknowledgements")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn analysis_scoped_by_version_and_computation_overwrites() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "u1", None).await.unwrap();
        let pid = upsert_playlist(&pool, uid, &sample_playlist("p1", "v1"))
            .await
            .unwrap();

        let a1 = get_or_create_analysis(&pool, pid, "v1").await.unwrap();
        let a1_again = get_or_create_analysis(&pool, pid, "v1").await.unwrap();
        assert_eq!(a1, a1_again);
        let a2 = get_or_create_analysis(&pool, pid, "v2").await.unwrap();
        assert_ne!(a1, a2);

        let c1 = upsert_computation(&pool, a1, pid, r#"{"n":1}"#).await.unwrap();
        let c2 = upsert_computation(&pool, a1, pid, r#"{"n":2}"#).await.unwrap();
        assert_eq!(c1, c2);
        let payload: String =
            sqlx::query_scalar("SELECT payload FROM computations WHERE id = ?")
                .bind(c1)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(payload, r#"{"n":2}"#);
    }
}
