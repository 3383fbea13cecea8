#![forbid(unsafe_code)]

//! Query-string codec for plot configs.
//!
//! Encoding is only defined for complete plots and is deterministic: the
//! same config always yields the same string, which is what lets the
//! caller short-circuit redundant history pushes by string comparison.
//! Parsing is the opposite: every unknown or malformed parameter degrades
//! to the default empty plot field-by-field, never an error, because URLs
//! arrive from bookmarks and hand edits.

use std::sync::Arc;

use thiserror::Error;

use dp_context::Context;
use dp_plot::{ColorBy, Dimension, DimensionSlot, PlotConfig, PlotType, SliceRef, SortBy};

/// Practical cross-browser URL length ceiling. Anything longer is warned
/// about and kept out of browser history.
pub const MAX_QUERY_STRING_LEN: usize = 2000;

/// Filter slots with a query-string key of their own.
const FILTER_KEYS: [&str; 3] = ["color1", "color2", "visible"];

/// Metadata slots are prefixed so they never collide with filter slots.
const METADATA_KEY_PREFIX: &str = "m_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("plot config is incomplete and cannot be serialized")]
    IncompletePlot,
    #[error("query string length {length} exceeds the {limit} ceiling")]
    QueryStringTooLong { length: usize, limit: usize },
    #[error("failed to encode plot config: {0}")]
    Encode(String),
}

/// Serializes a complete plot config to its canonical query string.
pub fn plot_to_query_string(config: &PlotConfig) -> Result<String, QueryError> {
    if !config.is_complete() {
        return Err(QueryError::IncompletePlot);
    }

    let mut pairs: Vec<(String, String)> = Vec::new();
    pairs.push(("plot_type".to_owned(), config.plot_type.token().to_owned()));
    pairs.push(("index_type".to_owned(), config.index_type.clone()));
    for slot in [DimensionSlot::X, DimensionSlot::Y, DimensionSlot::Color] {
        if let Some(dimension) = config.dimensions.get(&slot) {
            let json = serde_json::to_string(dimension.as_ref())
                .map_err(|err| QueryError::Encode(err.to_string()))?;
            pairs.push((slot_key(slot).to_owned(), json));
        }
    }
    if let Some(color_by) = config.color_by {
        pairs.push(("color_by".to_owned(), color_by.token().to_owned()));
    }
    for (name, context) in &config.filters {
        let json = serde_json::to_string(context.as_ref())
            .map_err(|err| QueryError::Encode(err.to_string()))?;
        pairs.push((name.clone(), json));
    }
    if let Some(sort_by) = config.sort_by {
        pairs.push(("sort_by".to_owned(), sort_by.token().to_owned()));
    }
    if config.hide_points {
        pairs.push(("hide_points".to_owned(), "true".to_owned()));
    }
    if config.use_clustering {
        pairs.push(("use_clustering".to_owned(), "true".to_owned()));
    }
    for (slot, slice) in &config.metadata {
        pairs.push((
            format!("{METADATA_KEY_PREFIX}{slot}"),
            slice.slice_id.clone(),
        ));
    }

    let encoded = pairs
        .iter()
        .map(|(key, value)| format!("{key}={}", percent_encode(value)))
        .collect::<Vec<_>>()
        .join("&");

    if encoded.len() > MAX_QUERY_STRING_LEN {
        return Err(QueryError::QueryStringTooLong {
            length: encoded.len(),
            limit: MAX_QUERY_STRING_LEN,
        });
    }
    Ok(encoded)
}

/// Parses a query string back into a plot config. Unknown keys and
/// malformed values are skipped; the result is always usable.
#[must_use]
pub fn plot_from_query_string(query: &str) -> PlotConfig {
    let mut config = PlotConfig::default();
    for pair in query.trim_start_matches('?').split('&') {
        let Some((key, raw_value)) = pair.split_once('=') else {
            continue;
        };
        let Some(value) = percent_decode(raw_value) else {
            continue;
        };
        match key {
            "plot_type" => {
                if let Some(plot_type) = PlotType::from_token(&value) {
                    config.plot_type = plot_type;
                }
            }
            "index_type" => config.index_type = value,
            "x" | "y" | "color" => {
                if let (Some(slot), Ok(dimension)) =
                    (slot_from_key(key), serde_json::from_str::<Dimension>(&value))
                {
                    config.dimensions.insert(slot, Arc::new(dimension));
                }
            }
            "color_by" => config.color_by = ColorBy::from_token(&value),
            "sort_by" => config.sort_by = SortBy::from_token(&value),
            "hide_points" => config.hide_points = value == "true",
            "use_clustering" => config.use_clustering = value == "true",
            _ if FILTER_KEYS.contains(&key) => {
                if let Ok(context) = serde_json::from_str::<Context>(&value) {
                    config.filters.insert(key.to_owned(), Arc::new(context));
                }
            }
            _ => {
                if let Some(slot) = key.strip_prefix(METADATA_KEY_PREFIX) {
                    config
                        .metadata
                        .insert(slot.to_owned(), SliceRef { slice_id: value });
                }
            }
        }
    }
    config
}

const fn slot_key(slot: DimensionSlot) -> &'static str {
    match slot {
        DimensionSlot::X => "x",
        DimensionSlot::Y => "y",
        DimensionSlot::Color => "color",
    }
}

fn slot_from_key(key: &str) -> Option<DimensionSlot> {
    match key {
        "x" => Some(DimensionSlot::X),
        "y" => Some(DimensionSlot::Y),
        "color" => Some(DimensionSlot::Color),
        _ => None,
    }
}

/// Minimal percent-encoding over the RFC 3986 unreserved set.
///
/// This avoids pulling in a full `percent-encoding` crate for a single
/// use.
fn percent_encode(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                output.push(byte as char);
            }
            _ => {
                output.push('%');
                output.push_str(&format!("{byte:02X}"));
            }
        }
    }
    output
}

/// Inverse of [`percent_encode`]. Returns `None` for truncated escapes or
/// invalid UTF-8 so the caller can skip the parameter.
fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            output.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            output.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(output).ok()
}
