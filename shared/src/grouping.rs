//! Turns the flat message log into display items.
//!
//! A [`TimestampMarker`] opens the list and every stretch of silence longer
//! than [`GroupingConfig::marker_gap_ms`]. Grouping is recomputed on every log
//! change, so everything here is pure.

use chrono::format::{Item, StrftimeItems};
use chrono::{FixedOffset, TimeZone};
use serde::{Deserialize, Serialize};

use crate::model::{ChatMessage, GroupedItem, TimestampMarker};
use crate::offline_store::ConfigError;
use crate::{UnixTimeMs, MARKER_GAP_MS, SAME_SOURCE_MERGE_WINDOW_MS};

/// Short weekday plus 12-hour clock, e.g. `Mon 01:06 PM`.
pub const DEFAULT_MARKER_FORMAT: &str = "%a %I:%M %p";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingConfig {
    pub marker_gap_ms: u64,
    pub merge_window_ms: u64,
    pub marker_format: String,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            marker_gap_ms: MARKER_GAP_MS,
            merge_window_ms: SAME_SOURCE_MERGE_WINDOW_MS,
            marker_format: DEFAULT_MARKER_FORMAT.to_string(),
        }
    }
}

impl GroupingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.marker_format.is_empty() {
            return Err(ConfigError::InvalidMarkerFormat(self.marker_format.clone()));
        }
        // chrono panics while rendering a malformed format, so reject it up front.
        if StrftimeItems::new(&self.marker_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidMarkerFormat(self.marker_format.clone()));
        }
        Ok(())
    }
}

/// How a bubble sits relative to the one before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BubbleSpacing {
    /// Same sender within the merge window: drawn tight against the previous bubble.
    Stacked,
    Separated,
}

#[must_use]
pub fn group_messages(
    messages: &[ChatMessage],
    config: &GroupingConfig,
    tz: &FixedOffset,
) -> Vec<GroupedItem> {
    let mut grouped = Vec::with_capacity(messages.len() + 1);
    let mut last_time = UnixTimeMs(0);

    for (index, message) in messages.iter().enumerate() {
        let time = message.time_stamp();
        if index == 0 || time.elapsed_since(last_time) > config.marker_gap_ms {
            grouped.push(GroupedItem::Timestamp(TimestampMarker {
                value: format_marker(time, &config.marker_format, tz),
                anchor: message.id(),
            }));
        }
        grouped.push(GroupedItem::Message(message.clone()));
        last_time = time;
    }

    grouped
}

/// Renders a marker label in `tz`. Timestamps chrono cannot represent fall
/// back to the raw millisecond value.
#[must_use]
pub fn format_marker(time: UnixTimeMs, format: &str, tz: &FixedOffset) -> String {
    i64::try_from(time.as_millis())
        .ok()
        .and_then(|ms| tz.timestamp_millis_opt(ms).single())
        .map_or_else(
            || time.as_millis().to_string(),
            |at| at.format(format).to_string(),
        )
}

#[must_use]
pub fn bubble_spacing(
    previous: Option<&ChatMessage>,
    current: &ChatMessage,
    merge_window_ms: u64,
) -> BubbleSpacing {
    match previous {
        Some(prev)
            if prev.source() == current.source()
                && current.time_stamp().elapsed_since(prev.time_stamp()) <= merge_window_ms =>
        {
            BubbleSpacing::Stacked
        }
        _ => BubbleSpacing::Separated,
    }
}
