//! Aggregate statistics over an analysis's attached tracks.
//!
//! Numeric fields get mean plus min/max with the originating track id;
//! categorical fields get frequency counts. Field access goes through an
//! explicit dispatch table so adding a field is one line, checked at
//! compile time.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::db::TrackFeatureRow;

type NumericGetter = fn(&TrackFeatureRow) -> Option<f64>;
type CategoricalGetter = fn(&TrackFeatureRow) -> Option<i64>;

const NUMERIC_FIELDS: &[(&str, NumericGetter)] = &[
    ("danceability", |t| t.danceability),
    ("energy", |t| t.energy),
    ("tempo", |t| t.tempo),
    ("valence", |t| t.valence),
    ("loudness", |t| t.loudness),
    ("speechiness", |t| t.speechiness),
    ("acousticness", |t| t.acousticness),
    ("instrumentalness", |t| t.instrumentalness),
    ("liveness", |t| t.liveness),
];

const CATEGORICAL_FIELDS: &[(&str, CategoricalGetter)] = &[
    ("key_signature", |t| t.key_signature),
    ("mode", |t| t.mode),
    ("time_signature", |t| t.time_signature),
];

pub fn compute(tracks: &[TrackFeatureRow]) -> Value {
    let mut numeric = Map::new();
    for (name, getter) in NUMERIC_FIELDS {
        if let Some(stats) = numeric_field(tracks, *getter) {
            numeric.insert((*name).to_string(), stats);
        }
    }

    let mut categorical = Map::new();
    for (name, getter) in CATEGORICAL_FIELDS {
        let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
        for track in tracks {
            if let Some(v) = getter(track) {
                *counts.entry(v).or_default() += 1;
            }
        }
        let counts: Map<String, Value> = counts
            .into_iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();
        categorical.insert((*name).to_string(), Value::Object(counts));
    }

    json!({
        "track_count": tracks.len(),
        "numeric": numeric,
        "categorical": categorical,
    })
}

fn numeric_field(tracks: &[TrackFeatureRow], getter: NumericGetter) -> Option<Value> {
    let mut sum = 0.0;
    let mut count = 0u64;
    let mut min: Option<(f64, i64)> = None;
    let mut max: Option<(f64, i64)> = None;

    for track in tracks {
        let Some(v) = getter(track) else { continue };
        sum += v;
        count += 1;
        if min.map_or(true, |(m, _)| v < m) {
            min = Some((v, track.id));
        }
        if max.map_or(true, |(m, _)| v > m) {
            max = Some((v, track.id));
        }
    }

    let (min, max) = (min?, max?);
    Some(json!({
        "mean": sum / count as f64,
        "min": { "value": min.0, "track_id": min.1 },
        "max": { "value": max.0, "track_id": max.1 },
    }))
}
