mod emoji;
mod filter;
pub mod moderation;
pub mod storage;
pub mod timer;
pub mod viewport;

pub use self::emoji::{is_emoji, EmojiTransform, ShortcodeTable};
pub use self::filter::{
    is_flagged, prepare_for_classifier, Classifier, ClassifyResult, FilterConfig, FilterError,
    Prediction, PredictionResult, DEFAULT_THRESHOLD,
};
pub use self::moderation::{Moderation, ModerationOperation};
pub use self::storage::{Storage, StorageError, StorageOperation, StorageOutput, StorageResult};
pub use self::timer::{Timer, TimerOperation, TimerOutput};
pub use self::viewport::{Viewport, ViewportOperation};

use crux_core::render::Render;

use crate::app::App;
use crate::event::Event;
use crate::offline_store::{ConfigError, StoreError};

#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub render: Render<Event>,
    pub storage: Storage<Event>,
    pub timer: Timer<Event>,
    pub moderation: Moderation<Event>,
    pub viewport: Viewport<Event>,
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
