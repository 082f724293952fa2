use serde::{Deserialize, Serialize};

use crate::capabilities::{ClassifyResult, StorageResult};
use crate::outbox::FlushTicket;
use crate::virtualizer::Align;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Event {
    // --- Session ---
    /// Loads the log and starts background sync. Repeats are ignored.
    Start,
    /// Stops background sync and detaches the lifecycle triggers.
    Shutdown,

    // --- Composer ---
    DraftChanged(String),
    Submit,
    SetFilterEnabled(bool),
    ClearHistory,

    // --- Sync triggers ---
    Lifecycle(PageLifecycle),
    ForceSync,

    // --- Viewport ---
    Scrolled { offset: f64 },
    Resized { viewport: f64 },
    Measured { index: usize, size: f64 },
    ScrollToIndex { index: usize, align: Align },

    // --- Capability responses ---
    #[serde(skip)]
    Loaded(StorageResult),
    #[serde(skip)]
    Seeded(StorageResult),
    #[serde(skip)]
    Flushed {
        ticket: FlushTicket,
        result: StorageResult,
    },
    #[serde(skip)]
    Cleared(StorageResult),
    #[serde(skip)]
    Classified { text: String, result: ClassifyResult },
    #[serde(skip)]
    SyncTick { epoch: u64 },
    #[serde(skip)]
    ScrollCorrection,
}

/// Page lifecycle notifications forwarded by the shell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageLifecycle {
    Visible,
    Hidden,
    BeforeUnload,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollBehavior {
    Instant,
    Smooth,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScrollTarget {
    Index { index: usize, align: Align },
    Offset { offset: f64 },
    /// The real end of the scroll container, whatever the estimates say.
    Bottom,
}

/// Scroll the shell should perform on its viewport.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScrollRequest {
    pub target: ScrollTarget,
    pub behavior: ScrollBehavior,
}

impl ScrollRequest {
    pub fn instant(target: ScrollTarget) -> Self {
        Self {
            target,
            behavior: ScrollBehavior::Instant,
        }
    }
}
