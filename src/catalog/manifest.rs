//! Per-track manifest probing for declared audio quality.
//!
//! Quality is mined from two kinds of playlist lines: session data carrying
//! base64 JSON asset metadata, and stream-info lines carrying bandwidth and
//! codec attributes. Probing fans out one thread per track and merges results
//! back by index, so output order always equals input order.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, warn};
use regex::Regex;
use serde_json::{Map, Value};

use crate::catalog::{HttpRequest, HttpTransport};
use crate::error::CoreError;
use crate::jobs::CancellationToken;

/// Opaque track attribute map.
pub type TrackRecord = Map<String, Value>;

pub const TRAIT_ATMOS: &str = "atmos";
pub const TRAIT_SPATIAL: &str = "spatial";
pub const TRAIT_LOSSLESS: &str = "lossless";
pub const TRAIT_HI_RES_LOSSLESS: &str = "hi-res-lossless";

const SESSION_DATA_TAG: &str = "#EXT-X-SESSION-DATA:";
const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF:";
const ASSET_METADATA_DATA_ID: &str = "audioAssetMetadata";
const HI_RES_SAMPLE_RATE_HZ: u32 = 48_000;
const DEFAULT_MANIFEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Quality attributes declared by a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualityInfo {
    pub codec: Option<String>,
    pub bitrate: Option<u64>,
    pub avg_bitrate: Option<u64>,
    pub sample_rate_hz: Option<u32>,
    pub bit_depth: Option<u32>,
    pub channels: Option<String>,
    pub traits: BTreeSet<String>,
}

impl QualityInfo {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn has_trait(&self, name: &str) -> bool {
        self.traits.contains(name)
    }
}

fn attribute_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"([A-Z0-9\-]+)=("[^"]*"|[^,]*)"#).expect("valid attribute pattern")
    })
}

/// Splits an HLS attribute list into `(KEY, value)` pairs, unquoting values.
fn parse_attribute_list(list: &str) -> Vec<(String, String)> {
    attribute_pattern()
        .captures_iter(list)
        .map(|captures| {
            let key = captures[1].to_string();
            let value = captures[2].trim_matches('"').to_string();
            (key, value)
        })
        .collect()
}

fn attribute<'a>(attributes: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

fn normalize_codec(raw: &str) -> Option<String> {
    let first = raw.split(',').next()?.trim().to_ascii_lowercase();
    if first.is_empty() {
        return None;
    }
    let codec = if first.starts_with("mp4a") || first.starts_with("aac") {
        "AAC".to_string()
    } else if first == "ec+3" || first == "ec-3" {
        "EC-3".to_string()
    } else {
        first.to_ascii_uppercase()
    };
    Some(codec)
}

fn apply_format_id(info: &mut QualityInfo, format_id: &str) {
    let lowered = format_id.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return;
    }
    if lowered == "ec+3" || lowered.contains("atmos") {
        info.traits.insert(TRAIT_ATMOS.to_string());
    }
    if lowered == "alac" {
        info.traits.insert(TRAIT_LOSSLESS.to_string());
    }
    if lowered.contains("binaural") {
        info.traits.insert(TRAIT_SPATIAL.to_string());
    }
    if info.codec.is_none() {
        info.codec = normalize_codec(&lowered);
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn value_is_true(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => text.eq_ignore_ascii_case("yes") || text == "true",
        _ => false,
    }
}

fn apply_channels(info: &mut QualityInfo, channels: &str) {
    if channels.to_ascii_uppercase().contains("JOC") {
        info.traits.insert(TRAIT_ATMOS.to_string());
    }
    if info.channels.is_none() && !channels.trim().is_empty() {
        info.channels = Some(channels.trim().to_string());
    }
}

fn apply_asset(info: &mut QualityInfo, asset: &Map<String, Value>) {
    if let Some(format_id) = asset.get("AUDIO-FORMAT-ID").and_then(Value::as_str) {
        apply_format_id(info, format_id);
    }
    if info.sample_rate_hz.is_none() {
        info.sample_rate_hz = asset
            .get("SAMPLE-RATE")
            .and_then(value_as_u64)
            .and_then(|rate| u32::try_from(rate).ok());
    }
    if info.bit_depth.is_none() {
        info.bit_depth = asset
            .get("BIT-DEPTH")
            .and_then(value_as_u64)
            .and_then(|depth| u32::try_from(depth).ok());
    }
    if let Some(channels) = asset.get("CHANNEL-COUNT").and_then(value_as_text) {
        apply_channels(info, &channels);
    }
    if value_is_true(asset.get("IS-ATMOS")) {
        info.traits.insert(TRAIT_ATMOS.to_string());
    }
    if value_is_true(asset.get("IS-SPATIAL")) || value_is_true(asset.get("SPATIAL")) {
        info.traits.insert(TRAIT_SPATIAL.to_string());
    }
}

fn apply_session_data(info: &mut QualityInfo, attributes: &[(String, String)]) {
    let is_asset_metadata = attribute(attributes, "DATA-ID")
        .is_some_and(|data_id| data_id.contains(ASSET_METADATA_DATA_ID));
    if !is_asset_metadata {
        return;
    }
    let Some(encoded) = attribute(attributes, "VALUE") else {
        return;
    };
    let decoded = match BASE64.decode(encoded.trim()) {
        Ok(decoded) => decoded,
        Err(error) => {
            debug!("Manifest: session data is not valid base64: {}", error);
            return;
        }
    };
    let metadata: Value = match serde_json::from_slice(&decoded) {
        Ok(metadata) => metadata,
        Err(error) => {
            debug!("Manifest: session data is not valid JSON: {}", error);
            return;
        }
    };
    let assets: Vec<&Map<String, Value>> = match &metadata {
        Value::Object(map) if map.contains_key("AUDIO-FORMAT-ID") => vec![map],
        Value::Object(map) => map.values().filter_map(Value::as_object).collect(),
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    };
    for asset in assets {
        apply_asset(info, asset);
    }
}

/// Extracts declared quality attributes from manifest text.
pub fn parse_manifest(text: &str) -> QualityInfo {
    let mut info = QualityInfo::default();
    let mut stream_codec: Option<String> = None;

    for line in text.lines().map(str::trim) {
        if let Some(list) = line.strip_prefix(SESSION_DATA_TAG) {
            apply_session_data(&mut info, &parse_attribute_list(list));
            continue;
        }
        if let Some(list) = line.strip_prefix(STREAM_INF_TAG) {
            let attributes = parse_attribute_list(list);
            if let Some(bandwidth) = attribute(&attributes, "BANDWIDTH").and_then(|v| v.parse::<u64>().ok())
            {
                info.bitrate = Some(info.bitrate.map_or(bandwidth, |max: u64| max.max(bandwidth)));
            }
            if let Some(average) =
                attribute(&attributes, "AVERAGE-BANDWIDTH").and_then(|v| v.parse::<u64>().ok())
            {
                info.avg_bitrate =
                    Some(info.avg_bitrate.map_or(average, |max: u64| max.max(average)));
            }
            if stream_codec.is_none() {
                stream_codec = attribute(&attributes, "CODECS").and_then(normalize_codec);
            }
            if let Some(format_id) = attribute(&attributes, "AUDIO-FORMAT-ID") {
                apply_format_id(&mut info, format_id);
            }
            continue;
        }
        if line.starts_with('#') && line.contains('=') {
            let list = line.split_once(':').map_or(line, |(_, list)| list);
            let attributes = parse_attribute_list(list);
            if let Some(format_id) = attribute(&attributes, "AUDIO-FORMAT-ID") {
                apply_format_id(&mut info, format_id);
            }
            if let Some(channels) = attribute(&attributes, "CHANNELS") {
                apply_channels(&mut info, channels);
            }
        }
    }

    if info.codec.is_none() {
        info.codec = stream_codec;
    }
    if info.has_trait(TRAIT_ATMOS) {
        info.traits.insert(TRAIT_SPATIAL.to_string());
    }
    if info.has_trait(TRAIT_LOSSLESS)
        && info
            .sample_rate_hz
            .is_some_and(|rate| rate > HI_RES_SAMPLE_RATE_HZ)
    {
        info.traits.insert(TRAIT_HI_RES_LOSSLESS.to_string());
    }
    info
}

fn set_if_absent(track: &mut TrackRecord, key: &str, value: Option<Value>) {
    let Some(value) = value else {
        return;
    };
    let missing = track.get(key).map_or(true, Value::is_null);
    if missing {
        track.insert(key.to_string(), value);
    }
}

/// Merges quality into a track: existing non-null scalars win, traits union.
pub fn merge_quality(track: &mut TrackRecord, quality: &QualityInfo) {
    set_if_absent(track, "audioCodec", quality.codec.clone().map(Value::from));
    set_if_absent(track, "bitrate", quality.bitrate.map(Value::from));
    set_if_absent(track, "averageBitrate", quality.avg_bitrate.map(Value::from));
    set_if_absent(track, "sampleRateHz", quality.sample_rate_hz.map(Value::from));
    set_if_absent(track, "bitDepth", quality.bit_depth.map(Value::from));
    set_if_absent(track, "channels", quality.channels.clone().map(Value::from));

    let mut traits: BTreeSet<String> = track
        .get("audioTraits")
        .and_then(Value::as_array)
        .map(|existing| {
            existing
                .iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default();
    traits.extend(quality.traits.iter().cloned());
    if !traits.is_empty() {
        track.insert(
            "audioTraits".to_string(),
            Value::Array(traits.into_iter().map(Value::from).collect()),
        );
    }
}

/// Manifest URL carried by a track, if any.
pub fn manifest_url(track: &TrackRecord) -> Option<&str> {
    track
        .get("extendedAssetUrls")
        .and_then(|urls| urls.get("enhancedHls"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
}

/// Concurrent manifest prober.
pub struct ManifestAggregator {
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
}

impl ManifestAggregator {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_MANIFEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn fetch_quality(&self, url: &str) -> Result<QualityInfo, CoreError> {
        let response = self
            .transport
            .get(&HttpRequest::get(url).timeout(self.timeout))
            .map_err(CoreError::TransientNetwork)?;
        if !response.is_success() {
            return Err(CoreError::TransientNetwork(format!(
                "HTTP {} for manifest",
                response.status
            )));
        }
        Ok(parse_manifest(&response.body))
    }

    /// Probes one track; any failure degrades to empty quality.
    pub fn probe_track(&self, track: &TrackRecord) -> QualityInfo {
        let Some(url) = manifest_url(track) else {
            return QualityInfo::default();
        };
        match self.fetch_quality(url) {
            Ok(quality) => quality,
            Err(error) => {
                warn!("Manifest: probe failed for {}: {}", url, error);
                QualityInfo::default()
            }
        }
    }

    /// Probes every track concurrently and returns the tracks, in input
    /// order, with quality merged in. Only the governing job's token can
    /// abort the batch.
    pub fn probe_qualities(
        &self,
        mut tracks: Vec<TrackRecord>,
        token: &CancellationToken,
    ) -> Result<Vec<TrackRecord>, CoreError> {
        token.check()?;
        let qualities: Vec<QualityInfo> = std::thread::scope(|scope| {
            let handles: Vec<_> = tracks
                .iter()
                .map(|track| {
                    scope.spawn(move || {
                        if token.is_cancelled() {
                            QualityInfo::default()
                        } else {
                            self.probe_track(track)
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_default())
                .collect()
        });
        token.check()?;

        for (track, quality) in tracks.iter_mut().zip(qualities.iter()) {
            merge_quality(track, quality);
        }
        debug!("Manifest: probed {} tracks", tracks.len());
        Ok(tracks)
    }
}
