//! Session settings and the view model the shell renders.

use chrono::{FixedOffset, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::capabilities::is_emoji;
use crate::grouping::{bubble_spacing, BubbleSpacing, GroupingConfig};
use crate::model::{GroupedItem, MessageId, MessageSource};
use crate::offline_store::ConfigError;
use crate::virtualizer::VirtualizerConfig;
use crate::SCROLL_CORRECTION_DELAY;

// ============================================================================
// Configuration
// ============================================================================

/// A message written into an empty store on first start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedMessage {
    pub source: MessageSource,
    pub text: String,
}

impl SeedMessage {
    pub fn new(source: MessageSource, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub grouping: GroupingConfig,
    pub virtualizer: VirtualizerConfig,
    /// Zone the timestamp markers are rendered in.
    pub time_zone: FixedOffset,
    pub seed_messages: Vec<SeedMessage>,
    pub filter_enabled: bool,
    pub scroll_correction_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grouping: GroupingConfig::default(),
            virtualizer: VirtualizerConfig::default(),
            time_zone: *Local::now().offset(),
            seed_messages: vec![
                SeedMessage::new(MessageSource::Other, "hi there"),
                SeedMessage::new(MessageSource::You, "Hey did you go someplace today?"),
            ],
            filter_enabled: false,
            scroll_correction_delay: SCROLL_CORRECTION_DELAY,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.grouping.validate()?;
        self.virtualizer.validate()
    }
}

// ============================================================================
// View model
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Loading,
    Ready,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowContent {
    Timestamp {
        label: String,
    },
    Bubble {
        id: MessageId,
        text: String,
        source: MessageSource,
        spacing: BubbleSpacing,
        /// Rendered large, without a bubble.
        emoji_only: bool,
        inappropriate: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowView {
    pub index: usize,
    pub start: f64,
    pub size: f64,
    pub content: RowContent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatViewModel {
    pub phase: SessionPhase,
    pub is_loading: bool,
    pub is_filter_loading: bool,
    pub filter_enabled: bool,
    pub draft: String,
    pub message_count: usize,
    pub pending_sync_count: usize,
    pub total_size: f64,
    pub scroll_offset: f64,
    pub rows: Vec<RowView>,
}

impl ChatViewModel {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Row contents for `grouped[index]`; bubbles are spaced against the
/// previous message in the log, skipping any marker between.
pub(crate) fn row_content(
    grouped: &[GroupedItem],
    index: usize,
    merge_window_ms: u64,
) -> Option<RowContent> {
    let content = match grouped.get(index)? {
        GroupedItem::Timestamp(marker) => RowContent::Timestamp {
            label: marker.value.clone(),
        },
        GroupedItem::Message(message) => {
            let previous = grouped[..index]
                .iter()
                .rev()
                .find_map(GroupedItem::as_message);
            RowContent::Bubble {
                id: message.id(),
                text: message.text().to_string(),
                source: message.source(),
                spacing: bubble_spacing(previous, message, merge_window_ms),
                emoji_only: is_emoji(message.text()),
                inappropriate: message.is_inappropriate() == Some(true),
            }
        }
    };
    Some(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::group_messages;
    use crate::model::ChatMessage;
    use crate::{UnixTimeMs, SAME_SOURCE_MERGE_WINDOW_MS as SAME_WINDOW};

    fn message(id: u64, source: MessageSource, at: u64, text: &str) -> ChatMessage {
        ChatMessage::new(MessageId(id), text, source, UnixTimeMs(at), None)
    }

    #[test]
    fn default_seeds_match_first_launch() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.filter_enabled);
        assert_eq!(config.scroll_correction_delay, Duration::from_millis(100));
        assert_eq!(
            config.seed_messages,
            vec![
                SeedMessage::new(MessageSource::Other, "hi there"),
                SeedMessage::new(MessageSource::You, "Hey did you go someplace today?"),
            ]
        );
    }

    #[test]
    fn rejects_bad_marker_format() {
        let mut config = SessionConfig::default();
        config.grouping.marker_format = "%Q".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMarkerFormat(_))
        ));
    }

    #[test]
    fn rows_skip_markers_when_spacing_bubbles() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let hour = 60 * 60 * 1000;
        let log = vec![
            message(1, MessageSource::Other, 0, "hi"),
            message(2, MessageSource::Other, 5_000, "\u{1f44d}"),
            message(3, MessageSource::Other, 2 * hour, "later"),
        ];
        let grouped = group_messages(&log, &GroupingConfig::default(), &utc);
        assert_eq!(grouped.len(), 5);

        let rows: Vec<RowContent> = (0..grouped.len())
            .filter_map(|i| row_content(&grouped, i, SAME_WINDOW))
            .collect();
        assert!(matches!(rows[0], RowContent::Timestamp { .. }));
        assert!(matches!(
            rows[2],
            RowContent::Bubble {
                spacing: BubbleSpacing::Stacked,
                emoji_only: true,
                ..
            }
        ));
        assert!(matches!(rows[3], RowContent::Timestamp { .. }));
        // Same sender but far outside the merge window.
        assert!(matches!(
            rows[4],
            RowContent::Bubble {
                spacing: BubbleSpacing::Separated,
                ..
            }
        ));
        assert!(row_content(&grouped, 5, SAME_WINDOW).is_none());
    }

    #[test]
    fn view_model_serializes_rows_by_kind() {
        let view = ChatViewModel {
            phase: SessionPhase::Ready,
            is_loading: false,
            is_filter_loading: false,
            filter_enabled: false,
            draft: String::new(),
            message_count: 0,
            pending_sync_count: 0,
            total_size: 40.0,
            scroll_offset: 0.0,
            rows: vec![RowView {
                index: 0,
                start: 0.0,
                size: 40.0,
                content: RowContent::Timestamp {
                    label: "Mon 01:06 PM".into(),
                },
            }],
        };
        let json = view.to_json().unwrap();
        assert!(json.contains("\"kind\":\"timestamp\""));
        assert!(json.contains("\"phase\":\"ready\""));
    }
}
