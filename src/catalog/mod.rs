//! Paginated, credential-aware client for the remote catalog API.
//!
//! Callers see per-resource fetch methods that hide pagination, the fixed
//! inter-page delay and credential expiry. Every remote call runs through
//! the same bounded refresh-retry: one refresh per logical call, after which
//! a second expiry is fatal.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::credentials::{Credential, Credentials};
use crate::error::{SyncError, SyncResult};

pub mod model;

pub use model::{
    PageResp, RemoteAlbum, RemoteArtist, RemoteArtistRef, RemoteFeatures, RemotePlaylist,
    RemoteTrack,
};

/// Marker the remote puts in a 401 body when the access token is stale.
/// Any other 401 is treated as fatal.
const EXPIRED_TOKEN_MARKER: &str = "token expired";

/// Continuation state for one list fetch. Lives only for the duration of a
/// fetch call; restart happens via `FetchSpec::resume`, never implicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCursor {
    pub offset: u32,
    pub yielded: u32,
}

impl PageCursor {
    pub fn advance(&mut self, n: u32) {
        self.offset += n;
        self.yielded += n;
    }
}

/// How much of a collection to fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchSpec {
    /// Stop after this many yielded items. Ignored when `all` is set.
    pub limit: Option<u32>,
    /// Drain every page regardless of `limit`.
    pub all: bool,
    /// Continue from a previous call's cursor.
    pub resume: Option<PageCursor>,
}

impl FetchSpec {
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    pub fn limit(n: u32) -> Self {
        Self {
            limit: Some(n),
            ..Default::default()
        }
    }
}

/// One decoded page plus whether a further page exists.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u32,
    pub more: bool,
}

/// High-level seam the orchestrator consumes; faked in tests.
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn playlists(&self, user_id: i64, spec: &FetchSpec) -> SyncResult<Vec<RemotePlaylist>>;

    async fn playlist_tracks(
        &self,
        user_id: i64,
        playlist_external_id: &str,
        spec: &FetchSpec,
    ) -> SyncResult<Vec<RemoteTrack>>;

    async fn track_features(
        &self,
        user_id: i64,
        track_external_id: &str,
    ) -> SyncResult<RemoteFeatures>;

    async fn artist(&self, user_id: i64, artist_external_id: &str) -> SyncResult<RemoteArtist>;

    /// Collection total, for client-facing progress reporting.
    async fn playlist_total(&self, user_id: i64) -> SyncResult<u32>;
}

pub struct CatalogClient<C> {
    http: Client,
    base_url: Url,
    creds: C,
    page_size: u32,
    page_delay: Duration,
}

impl<C> fmt::Debug for CatalogClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogClient")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl<C: Credentials> CatalogClient<C> {
    pub fn new(creds: C, base_url: Url, page_size: u32, page_delay: Duration) -> Self {
        let http = Client::builder()
            .user_agent("tunesync/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            creds,
            page_size,
            page_delay,
        }
    }

    /// One authenticated GET, decoded as JSON. Expiry detection happens
    /// here; the refresh retry is layered on top by `with_refresh`.
    async fn get_json<T: DeserializeOwned>(
        &self,
        cred: &Credential,
        path: &str,
        query: &[(&str, String)],
    ) -> SyncResult<T> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| SyncError::Validation(format!("invalid catalog path {path}: {e}")))?;
        debug!(%url, "catalog request");
        let res = self
            .http
            .get(url)
            .query(query)
            .header("Authorization", format!("Bearer {}", cred.access_token))
            .send()
            .await?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED {
            let body = res.text().await.unwrap_or_default();
            if body.to_ascii_lowercase().contains(EXPIRED_TOKEN_MARKER) {
                return Err(SyncError::ExpiredCredential);
            }
            warn!(status = status.as_u16(), body, "catalog rejected request");
            return Err(SyncError::RemoteApi {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body, "catalog error response");
            return Err(SyncError::RemoteApi {
                status: status.as_u16(),
                body,
            });
        }

        Ok(res.json::<T>().await?)
    }

    async fn fetch_page<T: DeserializeOwned>(
        &self,
        cred: &Credential,
        path: &str,
        offset: u32,
        limit: u32,
    ) -> SyncResult<Page<T>> {
        let resp: PageResp<T> = self
            .get_json(
                cred,
                path,
                &[("offset", offset.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        Ok(Page {
            more: resp.next.is_some(),
            total: resp.total,
            items: resp.items,
        })
    }

    /// Drain a list endpoint according to `spec`, with the refresh retry
    /// applied per page request.
    async fn fetch_list<T: DeserializeOwned>(
        &self,
        user_id: i64,
        path: &str,
        spec: &FetchSpec,
    ) -> SyncResult<(Vec<T>, PageCursor)> {
        drain_pages(spec, self.page_size, self.page_delay, |cursor, want| {
            let path = path.to_string();
            let offset = cursor.offset;
            async move {
                with_refresh(&self.creds, user_id, |cred| {
                    let path = path.clone();
                    async move { self.fetch_page(&cred, &path, offset, want).await }
                })
                .await
            }
        })
        .await
    }

    async fn fetch_detail<T: DeserializeOwned>(&self, user_id: i64, path: &str) -> SyncResult<T> {
        with_refresh(&self.creds, user_id, |cred| {
            let path = path.to_string();
            async move { self.get_json(&cred, &path, &[]).await }
        })
        .await
    }
}

#[async_trait]
impl<C: Credentials> CatalogService for CatalogClient<C> {
    async fn playlists(&self, user_id: i64, spec: &FetchSpec) -> SyncResult<Vec<RemotePlaylist>> {
        let (items, _) = self.fetch_list(user_id, "me/playlists", spec).await?;
        Ok(items)
    }

    async fn playlist_tracks(
        &self,
        user_id: i64,
        playlist_external_id: &str,
        spec: &FetchSpec,
    ) -> SyncResult<Vec<RemoteTrack>> {
        let path = format!("playlists/{playlist_external_id}/tracks");
        let (items, _) = self.fetch_list(user_id, &path, spec).await?;
        Ok(items)
    }

    async fn track_features(
        &self,
        user_id: i64,
        track_external_id: &str,
    ) -> SyncResult<RemoteFeatures> {
        self.fetch_detail(user_id, &format!("audio-features/{track_external_id}"))
            .await
    }

    async fn artist(&self, user_id: i64, artist_external_id: &str) -> SyncResult<RemoteArtist> {
        self.fetch_detail(user_id, &format!("artists/{artist_external_id}"))
            .await
    }

    async fn playlist_total(&self, user_id: i64) -> SyncResult<u32> {
        let page: Page<RemotePlaylist> = with_refresh(&self.creds, user_id, |cred| async move {
            self.fetch_page(&cred, "me/playlists", 0, 1).await
        })
        .await?;
        Ok(page.total)
    }
}

/// Credential-refresh retry state machine. Issues `op` with the current
/// credential; on expiry, refreshes once and reissues. A second expiry is
/// escalated to a fatal remote error instead of looping.
pub async fn with_refresh<C, T, F, Fut>(creds: &C, user_id: i64, mut op: F) -> SyncResult<T>
where
    C: Credentials,
    F: FnMut(Credential) -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let cred = creds.current(user_id).await?;
    match op(cred).await {
        Err(SyncError::ExpiredCredential) => {
            debug!(user_id, "access token expired; refreshing once");
            let cred = creds.refresh(user_id).await?;
            match op(cred).await {
                Err(SyncError::ExpiredCredential) => Err(SyncError::RemoteApi {
                    status: 401,
                    body: "token still expired after refresh".into(),
                }),
                other => other,
            }
        }
        other => other,
    }
}

/// Page-drain loop shared by every list endpoint. `fetch_page` receives the
/// cursor and the page size to request; the fixed inter-page delay applies
/// between page requests, never before the first.
pub async fn drain_pages<T, F, Fut>(
    spec: &FetchSpec,
    page_size: u32,
    page_delay: Duration,
    mut fetch_page: F,
) -> SyncResult<(Vec<T>, PageCursor)>
where
    F: FnMut(PageCursor, u32) -> Fut,
    Fut: Future<Output = SyncResult<Page<T>>>,
{
    let mut cursor = spec.resume.clone().unwrap_or_default();
    let mut out = Vec::new();
    let mut first = true;

    loop {
        let want = if spec.all {
            page_size
        } else if let Some(limit) = spec.limit {
            let remaining = limit.saturating_sub(cursor.yielded);
            if remaining == 0 {
                break;
            }
            remaining.min(page_size)
        } else {
            page_size
        };

        if !first && !page_delay.is_zero() {
            sleep(page_delay).await;
        }
        first = false;

        let page = fetch_page(cursor.clone(), want).await?;
        let got = page.items.len() as u32;
        out.extend(page.items);
        cursor.advance(got);

        if got == 0 || !page.more {
            break;
        }
        if !spec.all {
            if let Some(limit) = spec.limit {
                if cursor.yielded >= limit {
                    break;
                }
            }
        }
    }

    Ok((out, cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory paging over `total` numbered items.
    async fn fake_page(cursor: PageCursor, want: u32, total: u32) -> SyncResult<Page<u32>> {
        let start = cursor.offset.min(total);
        let end = (cursor.offset + want).min(total);
        Ok(Page {
            items: (start..end).collect(),
            total,
            more: end < total,
        })
    }

    #[tokio::test]
    async fn all_yields_remote_total() {
        let spec = FetchSpec::all();
        let (items, cursor) = drain_pages(&spec, 10, Duration::ZERO, |c, want| {
            fake_page(c, want, 37)
        })
        .await
        .unwrap();
        assert_eq!(items.len(), 37);
        assert_eq!(cursor.yielded, 37);
        assert_eq!(items[36], 36);
    }

    #[tokio::test]
    async fn limit_yields_min_of_limit_and_total() {
        let spec = FetchSpec::limit(25);
        let (items, _) =
            drain_pages(&spec, 10, Duration::ZERO, |c, want| fake_page(c, want, 37))
                .await
                .unwrap();
        assert_eq!(items.len(), 25);

        let spec = FetchSpec::limit(100);
        let (items, _) =
            drain_pages(&spec, 10, Duration::ZERO, |c, want| fake_page(c, want, 37))
                .await
                .unwrap();
        assert_eq!(items.len(), 37);
    }

    #[tokio::test]
    async fn resume_cursor_continues_where_left_off() {
        let spec = FetchSpec::limit(10);
        let (first, cursor) =
            drain_pages(&spec, 10, Duration::ZERO, |c, want| fake_page(c, want, 30))
                .await
                .unwrap();
        assert_eq!(first, (0..10).collect::<Vec<_>>());

        let spec = FetchSpec {
            limit: Some(20),
            all: false,
            resume: Some(cursor),
        };
        let (second, cursor) =
            drain_pages(&spec, 10, Duration::ZERO, |c, want| fake_page(c, want, 30))
                .await
                .unwrap();
        assert_eq!(second, (10..20).collect::<Vec<_>>());
        assert_eq!(cursor.yielded, 20);
    }

    #[tokio::test]
    async fn empty_collection_yields_nothing() {
        let spec = FetchSpec::all();
        let (items, cursor) =
            drain_pages(&spec, 10, Duration::ZERO, |c, want| fake_page(c, want, 0))
                .await
                .unwrap();
        assert!(items.is_empty());
        assert_eq!(cursor.yielded, 0);
    }

    #[derive(Default)]
    struct ScriptedCreds {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl Credentials for ScriptedCreds {
        async fn current(&self, _user_id: i64) -> SyncResult<Credential> {
            Ok(Credential {
                access_token: "stale".into(),
            })
        }

        async fn refresh(&self, _user_id: i64) -> SyncResult<Credential> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(Credential {
                access_token: "fresh".into(),
            })
        }
    }

    #[tokio::test]
    async fn refresh_retries_exactly_once() {
        let creds = ScriptedCreds::default();
        let attempts = RefCell::new(0u32);

        let res: SyncResult<&str> = with_refresh(&creds, 1, |cred| {
            *attempts.borrow_mut() += 1;
            async move {
                if cred.access_token == "stale" {
                    Err(SyncError::ExpiredCredential)
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(res.unwrap(), "ok");
        assert_eq!(*attempts.borrow(), 2);
        assert_eq!(creds.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_expiry_is_fatal_not_retried() {
        let creds = ScriptedCreds::default();
        let attempts = RefCell::new(0u32);

        let res: SyncResult<&str> = with_refresh(&creds, 1, |_cred| {
            *attempts.borrow_mut() += 1;
            async { Err(SyncError::ExpiredCredential) }
        })
        .await;

        match res {
            Err(SyncError::RemoteApi { status, .. }) => assert_eq!(status, 401),
            other => panic!("expected fatal remote error, got {other:?}"),
        }
        assert_eq!(*attempts.borrow(), 2);
        assert_eq!(creds.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_expiry_error_propagates_without_refresh() {
        let creds = ScriptedCreds::default();

        let res: SyncResult<&str> = with_refresh(&creds, 1, |_cred| async {
            Err(SyncError::RemoteApi {
                status: 500,
                body: "boom".into(),
            })
        })
        .await;

        assert!(matches!(
            res,
            Err(SyncError::RemoteApi { status: 500, .. })
        ));
        assert_eq!(creds.refreshes.load(Ordering::SeqCst), 0);
    }
}
