//! Dependency-ordered sync stages.
//!
//! Each stage is a free async function over the pool and the catalog seam.
//! Stages never retry; failure isolation is per item in the track stage and
//! per chain elsewhere. Successor tasks are enqueued by the stage that
//! produces their input, so chain order falls out of the queue's
//! predecessor edges.

use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::catalog::{CatalogService, FetchSpec};
use crate::db::{self, Pool, TaskSpec};
use crate::error::{SyncError, SyncResult};
use crate::model::{SyncTask, TaskKind};

pub mod stats;

/// Entry point for a full library sync: one playlist-sync task; everything
/// downstream is enqueued by the stages themselves.
pub async fn enqueue_library_sync(pool: &Pool, user_id: i64) -> SyncResult<i64> {
    let id = db::enqueue_task(pool, &TaskSpec::new(TaskKind::SyncPlaylist, user_id))
        .await
        .map_err(SyncError::Other)?;
    Ok(id)
}

/// Stage 1: upsert playlist summaries. If every incoming playlist's remote
/// version matches the persisted one the whole batch is a no-op and the
/// stage exits without writing.
#[instrument(skip_all, fields(task_id = task.id))]
pub async fn sync_playlists(
    pool: &Pool,
    catalog: &dyn CatalogService,
    task: &SyncTask,
) -> SyncResult<Option<Value>> {
    let remote = catalog.playlists(task.user_id, &FetchSpec::all()).await?;

    let mut all_unchanged = !remote.is_empty();
    for playlist in &remote {
        let persisted = db::playlist_version(pool, &playlist.id).await?;
        if persisted.as_deref() != Some(playlist.version.as_str()) {
            all_unchanged = false;
            break;
        }
    }
    if all_unchanged {
        info!(count = remote.len(), "all playlist versions unchanged; skipping batch");
        return Ok(Some(json!({ "unchanged": true, "playlists": remote.len() })));
    }

    let group_key = Uuid::new_v4().to_string();
    let mut chains = 0usize;
    for playlist in &remote {
        let persisted = db::playlist_version(pool, &playlist.id).await?;
        if persisted.as_deref() == Some(playlist.version.as_str()) {
            continue;
        }
        let playlist_id = db::upsert_playlist(pool, task.user_id, playlist).await?;

        // Per-playlist chain, a member of this batch's group. The gate key
        // rides on the sync-tracks task so the stage can tag its fan-out,
        // and on the analyze task so it waits for that fan-out to settle.
        let gate = Uuid::new_v4().to_string();
        db::enqueue_chain(
            pool,
            vec![
                TaskSpec::new(TaskKind::SyncTracks, task.user_id)
                    .external_id(&playlist.id)
                    .ref_id(playlist_id)
                    .after(task.id)
                    .gate(&gate)
                    .group(&group_key),
                TaskSpec::new(TaskKind::Analyze, task.user_id)
                    .external_id(&playlist.id)
                    .ref_id(playlist_id)
                    .gate(&gate)
                    .group(&group_key),
                TaskSpec::new(TaskKind::Compute, task.user_id)
                    .external_id(&playlist.id)
                    .ref_id(playlist_id)
                    .group(&group_key),
            ],
        )
        .await
        .map_err(SyncError::Other)?;
        chains += 1;
    }

    Ok(Some(json!({
        "unchanged": false,
        "playlists": remote.len(),
        "chains": chains,
        "group_key": group_key,
    })))
}

/// Stage 2: per-playlist track sync. Artists and albums are upserted before
/// the track that references them; one item's failure never blocks the rest
/// of the batch.
#[instrument(skip_all, fields(task_id = task.id, playlist_id = task.ref_id))]
pub async fn sync_playlist_tracks(
    pool: &Pool,
    catalog: &dyn CatalogService,
    task: &SyncTask,
) -> SyncResult<Option<Value>> {
    let playlist_id = task
        .ref_id
        .ok_or_else(|| SyncError::Precondition("sync-tracks task without playlist id".into()))?;
    let playlist = db::get_playlist(pool, playlist_id)
        .await?
        .ok_or_else(|| SyncError::Precondition(format!("playlist {playlist_id} not persisted")))?;

    let tracks = catalog
        .playlist_tracks(task.user_id, &playlist.external_id, &FetchSpec::all())
        .await?;

    let mut synced = 0usize;
    let mut failures = 0usize;
    for item in &tracks {
        let res = async {
            let artist_id = match item.artists.first() {
                Some(a) => Some(db::upsert_artist(pool, &a.id, &a.name).await?),
                None => None,
            };
            let album_id = db::upsert_album(pool, &item.album).await?;
            let track_id = db::upsert_track(
                pool,
                &item.id,
                &item.name,
                artist_id,
                Some(album_id),
                item.duration_ms,
                item.popularity,
            )
            .await?;
            db::link_playlist_track(pool, playlist_id, track_id).await?;
            anyhow::Ok((track_id, artist_id))
        }
        .await;

        match res {
            Ok((track_id, artist_id)) => {
                synced += 1;
                // Per-track fan-out; members carry the chain's gate key as
                // their group so the analyze task waits for all of them.
                let mut fetch = TaskSpec::new(TaskKind::FetchFeatures, task.user_id)
                    .external_id(&item.id)
                    .ref_id(track_id);
                if let Some(gate) = &task.gate_key {
                    fetch = fetch.group(gate);
                }
                db::enqueue_task(pool, &fetch).await.map_err(SyncError::Other)?;

                if let (Some(artist_id), Some(artist)) = (artist_id, item.artists.first()) {
                    let mut fetch = TaskSpec::new(TaskKind::FetchArtist, task.user_id)
                        .external_id(&artist.id)
                        .ref_id(artist_id);
                    if let Some(gate) = &task.gate_key {
                        fetch = fetch.group(gate);
                    }
                    db::enqueue_task(pool, &fetch).await.map_err(SyncError::Other)?;
                }
            }
            Err(err) => {
                warn!(?err, track = %item.id, "track upsert failed; continuing batch");
                failures += 1;
            }
        }
    }

    Ok(Some(json!({
        "playlist": playlist.external_id,
        "tracks": tracks.len(),
        "synced": synced,
        "failures": failures,
    })))
}

/// Stage 3a: audio-feature enrichment for one track.
#[instrument(skip_all, fields(task_id = task.id, track_id = task.ref_id))]
pub async fn fetch_track_features(
    pool: &Pool,
    catalog: &dyn CatalogService,
    task: &SyncTask,
) -> SyncResult<Option<Value>> {
    let track_id = task
        .ref_id
        .ok_or_else(|| SyncError::Precondition("fetch-features task without track id".into()))?;
    let external_id = task
        .external_id
        .as_deref()
        .ok_or_else(|| SyncError::Precondition("fetch-features task without external id".into()))?;

    let features = catalog.track_features(task.user_id, external_id).await?;
    db::update_track_features(pool, track_id, &features)
        .await
        .map_err(SyncError::Other)?;
    Ok(Some(json!({ "track": external_id })))
}

/// Stage 3b: artist detail enrichment.
#[instrument(skip_all, fields(task_id = task.id, artist_id = task.ref_id))]
pub async fn fetch_track_artist(
    pool: &Pool,
    catalog: &dyn CatalogService,
    task: &SyncTask,
) -> SyncResult<Option<Value>> {
    let artist_id = task
        .ref_id
        .ok_or_else(|| SyncError::Precondition("fetch-artist task without artist id".into()))?;
    let external_id = task
        .external_id
        .as_deref()
        .ok_or_else(|| SyncError::Precondition("fetch-artist task without external id".into()))?;

    let artist = catalog.artist(task.user_id, external_id).await?;
    db::update_artist_detail(pool, artist_id, &artist.genres, artist.popularity)
        .await
        .map_err(SyncError::Other)?;
    Ok(Some(json!({ "artist": external_id })))
}

/// Stage 4: build the version-scoped analysis and flip the playlist's
/// analyzed flag. Rejects unsynced playlists before any write.
#[instrument(skip_all, fields(task_id = task.id, playlist_id = task.ref_id))]
pub async fn analyze_playlist(pool: &Pool, task: &SyncTask) -> SyncResult<Option<Value>> {
    let playlist_id = task
        .ref_id
        .ok_or_else(|| SyncError::Precondition("analyze task without playlist id".into()))?;
    let playlist = db::get_playlist(pool, playlist_id)
        .await?
        .ok_or_else(|| SyncError::Precondition(format!("playlist {playlist_id} not persisted")))?;
    if !playlist.synced {
        return Err(SyncError::Precondition(format!(
            "playlist {} is not synced; refusing analysis",
            playlist.external_id
        )));
    }
    let version = playlist.version.clone().ok_or_else(|| {
        SyncError::Precondition(format!("playlist {} has no version", playlist.external_id))
    })?;

    let analysis_id = db::get_or_create_analysis(pool, playlist_id, &version)
        .await
        .map_err(SyncError::Other)?;
    let track_ids = db::playlist_track_ids(pool, playlist_id).await?;
    db::attach_analysis_tracks(pool, analysis_id, &track_ids)
        .await
        .map_err(SyncError::Other)?;
    db::mark_playlist_analyzed(pool, playlist_id)
        .await
        .map_err(SyncError::Other)?;

    Ok(Some(json!({
        "analysis_id": analysis_id,
        "version": version,
        "tracks": track_ids.len(),
    })))
}

/// Stage 5: derive aggregate statistics over the analysis's tracks and
/// persist them keyed by (analysis, playlist). Re-running overwrites.
#[instrument(skip_all, fields(task_id = task.id, playlist_id = task.ref_id))]
pub async fn compute_statistics(pool: &Pool, task: &SyncTask) -> SyncResult<Option<Value>> {
    let playlist_id = task
        .ref_id
        .ok_or_else(|| SyncError::Precondition("compute task without playlist id".into()))?;
    let playlist = db::get_playlist(pool, playlist_id)
        .await?
        .ok_or_else(|| SyncError::Precondition(format!("playlist {playlist_id} not persisted")))?;
    let version = playlist.version.clone().ok_or_else(|| {
        SyncError::Precondition(format!("playlist {} has no version", playlist.external_id))
    })?;
    let analysis_id = db::get_analysis(pool, playlist_id, &version)
        .await
        .map_err(SyncError::Other)?
        .ok_or_else(|| {
            SyncError::Precondition(format!(
                "no analysis for playlist {} at version {version}",
                playlist.external_id
            ))
        })?;

    let tracks = db::analysis_track_features(pool, analysis_id)
        .await
        .map_err(SyncError::Other)?;
    let payload = stats::compute(&tracks);
    let computation_id = db::upsert_computation(pool, analysis_id, playlist_id, &payload.to_string())
        .await
        .map_err(SyncError::Other)?;

    Ok(Some(json!({
        "computation_id": computation_id,
        "analysis_id": analysis_id,
        "stats": payload,
    })))
}
