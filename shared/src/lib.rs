// lib.rs - chat core shared between the web and native shells

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod app;
pub mod capabilities;
pub mod event;
pub mod grouping;
pub mod model;
pub mod offline_store;
pub mod outbox;
pub mod session;
pub mod virtualizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use app::{App, Model};
pub use capabilities::{
    is_emoji, Capabilities, CapabilityError, Classifier, ClassifyResult, Effect, EmojiTransform,
    FilterConfig, FilterError, Prediction, PredictionResult, ShortcodeTable, StorageError,
    StorageOutput, StorageResult,
};
pub use event::{Event, PageLifecycle, ScrollBehavior, ScrollRequest, ScrollTarget};
pub use grouping::{bubble_spacing, group_messages, BubbleSpacing, GroupingConfig};
pub use model::{ChatMessage, GroupedItem, ItemKey, MessageId, MessageSource, TimestampMarker};
pub use offline_store::{
    ConfigError, MemoryStore, MessageStore, StoreConfig, StoreError, StoredRecord,
};
#[cfg(not(target_arch = "wasm32"))]
pub use offline_store::SqliteStore;
pub use outbox::{
    FlushBatch, FlushTicket, Outbox, SyncConfig, SyncCoordinator, SyncMetricsSnapshot,
    SyncSubscription,
};
pub use session::{ChatViewModel, RowContent, RowView, SeedMessage, SessionConfig, SessionPhase};
pub use virtualizer::{Align, VirtualItem, Virtualizer, VirtualizerConfig};

/// Messages queued before a flush is forced.
pub const DEFAULT_BATCH_THRESHOLD: usize = 10;
/// Period of the background flush timer.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(2);
/// Gap after which a timestamp marker opens a new group.
pub const MARKER_GAP_MS: u64 = 60 * 60 * 1000;
/// Same-source messages closer than this are stacked together.
pub const SAME_SOURCE_MERGE_WINDOW_MS: u64 = 20_000;
pub const DEFAULT_OVERSCAN: usize = 5;
pub const MARKER_SIZE_ESTIMATE: f64 = 40.0;
pub const BUBBLE_BASE_ESTIMATE: f64 = 60.0;
pub const BUBBLE_LINE_ESTIMATE: f64 = 20.0;
pub const CHARS_PER_LINE: usize = 40;
/// Delay before the smooth scroll that corrects estimate drift.
pub const SCROLL_CORRECTION_DELAY: Duration = Duration::from_millis(100);

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

impl Default for UnixTimeMs {
    fn default() -> Self {
        Self::now()
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
