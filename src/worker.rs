//! Queue worker: claims one ready task at a time, reports lifecycle to the
//! relay, and dispatches by operation tag. Several workers may share the
//! queue; the claim itself is atomic in the repository.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::catalog::CatalogService;
use crate::db::{self, Pool};
use crate::model::{TaskKind, TaskStatus};
use crate::relay::NotificationRelay;
use crate::sync;

/// Claim and run one task. Returns false when nothing was ready.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &Pool,
    catalog: &dyn CatalogService,
    relay: &NotificationRelay,
) -> Result<bool> {
    let Some(task) = db::claim_next_task(pool).await? else {
        return Ok(false);
    };

    if let Err(err) = relay.on_start(&task).await {
        // observability must not take the pipeline down
        warn!(?err, task_id = task.id, "failed to publish start event");
    }

    let outcome = match task.kind {
        TaskKind::SyncPlaylist => sync::sync_playlists(pool, catalog, &task).await,
        TaskKind::SyncTracks => sync::sync_playlist_tracks(pool, catalog, &task).await,
        TaskKind::FetchFeatures => sync::fetch_track_features(pool, catalog, &task).await,
        TaskKind::FetchArtist => sync::fetch_track_artist(pool, catalog, &task).await,
        TaskKind::Analyze => sync::analyze_playlist(pool, &task).await,
        TaskKind::Compute => sync::compute_statistics(pool, &task).await,
    };

    let status = match outcome {
        Ok(extras) => {
            if let Some(extras) = extras {
                db::set_notification_extras(pool, task.id, &extras.to_string()).await?;
            }
            db::finish_task(pool, task.id, TaskStatus::Success, None).await?;
            info!(task_id = task.id, kind = task.kind.as_str(), "task succeeded");
            TaskStatus::Success
        }
        Err(err) => {
            let msg = err.to_string();
            db::finish_task(pool, task.id, TaskStatus::Failure, Some(&msg)).await?;
            warn!(task_id = task.id, kind = task.kind.as_str(), error = %msg, "task failed");
            TaskStatus::Failure
        }
    };

    if let Err(err) = relay.on_finish(&task, status).await {
        warn!(?err, task_id = task.id, "failed to publish completion event");
    }

    Ok(true)
}

/// Poll loop for one worker. Sleeps when the queue is idle; a claim or
/// dispatch error backs off briefly instead of crashing the worker.
pub async fn run(
    pool: Pool,
    catalog: Arc<dyn CatalogService>,
    relay: NotificationRelay,
    poll_interval: Duration,
) {
    loop {
        match process_next_task(&pool, catalog.as_ref(), &relay).await {
            Ok(processed) => {
                if !processed {
                    tokio::time::sleep(poll_interval).await;
                }
            }
            Err(err) => {
                error!(?err, "worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
