//! Serde models for the remote catalog API wire format.
//!
//! Keep these structs focused on what the fetcher actually reads; unknown
//! fields are ignored by serde.

use serde::Deserialize;

/// One page of a list endpoint. Every list endpoint reports the same
/// envelope: the page's items, the collection total at fetch time, and
/// whether a further page exists.
#[derive(Debug, Clone, Deserialize)]
pub struct PageResp<T> {
    pub items: Vec<T>,
    pub total: u32,
    pub next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePlaylist {
    pub id: String,
    pub name: String,
    pub owner: Option<String>,
    /// Remote snapshot marker; changes whenever the playlist's contents do.
    #[serde(rename = "snapshot_id")]
    pub version: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub collaborative: bool,
    pub artwork_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteArtistRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteAlbum {
    pub id: String,
    pub name: String,
    pub release_date: Option<String>,
    pub artwork_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub name: String,
    pub duration_ms: Option<i64>,
    pub popularity: Option<i64>,
    pub album: RemoteAlbum,
    pub artists: Vec<RemoteArtistRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteArtist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub genres: Vec<String>,
    pub popularity: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFeatures {
    pub id: String,
    pub danceability: Option<f64>,
    pub energy: Option<f64>,
    pub tempo: Option<f64>,
    pub valence: Option<f64>,
    pub loudness: Option<f64>,
    pub speechiness: Option<f64>,
    pub acousticness: Option<f64>,
    pub instrumentalness: Option<f64>,
    pub liveness: Option<f64>,
    pub key: Option<i64>,
    pub mode: Option<i64>,
    pub time_signature: Option<i64>,
}
