//! The chat screen as a Crux app.
//!
//! The shell feeds [`Event`]s in and renders [`ChatViewModel`]. Storage
//! transactions, timers, the toxicity model and viewport scrolls are effects
//! the shell carries out on the core's behalf; the core never blocks on them.

use std::time::Duration;
use tracing::{debug, error, info};

use crate::capabilities::{
    is_flagged, prepare_for_classifier, Capabilities, CapabilityError, EmojiTransform,
    FilterConfig, ShortcodeTable, StorageOutput, StorageResult,
};
use crate::event::{Event, PageLifecycle, ScrollBehavior, ScrollRequest, ScrollTarget};
use crate::grouping::group_messages;
use crate::model::{ChatMessage, GroupedItem, MessageSource};
use crate::offline_store::StoredRecord;
use crate::outbox::{FlushTicket, Outbox, SyncConfig};
use crate::session::{row_content, ChatViewModel, RowView, SessionConfig, SessionPhase};
use crate::virtualizer::{Align, VirtualItem, Virtualizer};

#[derive(Default)]
pub struct App {
    emoji: ShortcodeTable,
}

pub struct Model {
    config: SessionConfig,
    sync: SyncConfig,
    filter: FilterConfig,
    phase: SessionPhase,
    load_requested: bool,
    messages: Vec<ChatMessage>,
    grouped: Vec<GroupedItem>,
    virtualizer: Virtualizer,
    outbox: Outbox,
    draft: String,
    filter_enabled: bool,
    // Trimmed draft waiting on the toxicity model.
    classifying: Option<String>,
    background_sync: bool,
    // Bumped on every start so ticks armed by an earlier run are ignored.
    sync_epoch: u64,
    // Store clear held back until the write in flight has landed.
    clear_deferred: bool,
}

impl Default for Model {
    fn default() -> Self {
        Self::with_parts(
            SessionConfig::default(),
            SyncConfig::default(),
            FilterConfig::default(),
            Virtualizer::default(),
        )
    }
}

impl Model {
    pub fn new(
        config: SessionConfig,
        sync: SyncConfig,
        filter: FilterConfig,
    ) -> Result<Self, CapabilityError> {
        config.validate()?;
        sync.validate()?;
        filter.validate()?;
        let virtualizer = Virtualizer::new(config.virtualizer.clone())?;
        Ok(Self::with_parts(config, sync, filter, virtualizer))
    }

    fn with_parts(
        config: SessionConfig,
        sync: SyncConfig,
        filter: FilterConfig,
        virtualizer: Virtualizer,
    ) -> Self {
        Self {
            filter_enabled: config.filter_enabled,
            config,
            sync,
            filter,
            phase: SessionPhase::Loading,
            load_requested: false,
            messages: Vec::new(),
            grouped: Vec::new(),
            virtualizer,
            outbox: Outbox::default(),
            draft: String::new(),
            classifying: None,
            background_sync: false,
            sync_epoch: 0,
            clear_deferred: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn grouped_messages(&self) -> &[GroupedItem] {
        &self.grouped
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn filter_enabled(&self) -> bool {
        self.filter_enabled
    }

    /// True while a submission waits on the toxicity model.
    pub fn is_filter_loading(&self) -> bool {
        self.classifying.is_some()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn is_background_sync_active(&self) -> bool {
        self.background_sync
    }

    pub fn scroll_offset(&self) -> f64 {
        self.virtualizer.scroll_offset()
    }

    pub fn total_size(&self) -> f64 {
        self.virtualizer.total_size()
    }

    pub fn virtual_items(&self) -> Vec<VirtualItem> {
        self.virtualizer.virtual_items()
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl crux_core::App for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = ChatViewModel;
    type Capabilities = Capabilities;

    fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
        match event {
            Event::Start => Self::start(model, caps),
            Event::Shutdown => {
                if model.background_sync {
                    model.background_sync = false;
                    info!("background sync stopped");
                }
            }
            Event::Loaded(result) => self.handle_loaded(result, model, caps),
            Event::Seeded(result) => {
                if let Err(e) = result {
                    error!(error = %e, "failed to bulk add messages");
                }
            }

            Event::DraftChanged(text) => {
                model.draft = text;
                caps.render.render();
            }
            Event::Submit => self.handle_submit(model, caps),
            Event::Classified { text, result } => {
                model.classifying = None;
                self.append(model, caps, &text, Some(is_flagged(&result)));
            }
            Event::SetFilterEnabled(enabled) => {
                model.filter_enabled = enabled;
                caps.render.render();
            }
            Event::ClearHistory => Self::handle_clear(model, caps),
            Event::Cleared(result) => {
                if let Err(e) = result {
                    error!(error = %e, "failed to clear messages");
                }
            }

            Event::Lifecycle(change) => Self::handle_lifecycle(change, model, caps),
            Event::ForceSync => Self::flush(model, caps, "manual"),
            Event::SyncTick { epoch } => {
                if !model.background_sync || epoch != model.sync_epoch {
                    debug!(epoch, "stale sync tick");
                    return;
                }
                Self::flush(model, caps, "interval");
                Self::arm_sync_timer(model, caps);
            }
            Event::Flushed { ticket, result } => Self::handle_flushed(ticket, &result, model, caps),

            Event::Scrolled { offset } => {
                model.virtualizer.set_scroll_offset(offset);
                caps.render.render();
            }
            Event::Resized { viewport } => {
                model.virtualizer.set_viewport_size(viewport);
                caps.render.render();
            }
            Event::Measured { index, size } => {
                if model.virtualizer.measure_element(index, size) {
                    caps.render.render();
                }
            }
            Event::ScrollToIndex { index, align } => {
                let offset = model.virtualizer.scroll_to_index(index, align);
                caps.viewport
                    .scroll(ScrollRequest::instant(ScrollTarget::Offset { offset }));
                caps.render.render();
            }
            Event::ScrollCorrection => caps.viewport.scroll(ScrollRequest {
                target: ScrollTarget::Bottom,
                behavior: ScrollBehavior::Smooth,
            }),
        }
    }

    fn view(&self, model: &Model) -> ChatViewModel {
        let merge_window = model.config.grouping.merge_window_ms;
        let rows = model
            .virtualizer
            .virtual_items()
            .into_iter()
            .filter_map(|item| {
                row_content(&model.grouped, item.index, merge_window).map(|content| RowView {
                    index: item.index,
                    start: item.start,
                    size: item.size,
                    content,
                })
            })
            .collect();

        ChatViewModel {
            phase: model.phase,
            is_loading: model.phase == SessionPhase::Loading,
            is_filter_loading: model.is_filter_loading(),
            filter_enabled: model.filter_enabled,
            draft: model.draft.clone(),
            message_count: model.messages.len(),
            pending_sync_count: model.outbox.len(),
            total_size: model.virtualizer.total_size(),
            scroll_offset: model.virtualizer.scroll_offset(),
            rows,
        }
    }
}

impl App {
    fn start(model: &mut Model, caps: &Capabilities) {
        if model.background_sync {
            debug!("background sync already running");
        } else {
            model.background_sync = true;
            model.sync_epoch = model.sync_epoch.wrapping_add(1);
            Self::arm_sync_timer(model, caps);
            info!(interval = ?model.sync.sync_interval, "background sync started");
        }

        if !model.load_requested {
            model.load_requested = true;
            caps.storage.get_all_by_time(Event::Loaded);
            caps.render.render();
        }
    }

    fn arm_sync_timer(model: &Model, caps: &Capabilities) {
        caps.timer.notify_after(
            duration_millis(model.sync.sync_interval),
            Event::SyncTick {
                epoch: model.sync_epoch,
            },
        );
    }

    /// Any load failure leaves an empty log, which is then seeded like a
    /// first launch.
    fn handle_loaded(&self, result: StorageResult, model: &mut Model, caps: &Capabilities) {
        let restored = match result {
            Ok(StorageOutput::Records(records)) => {
                model.outbox.restore(records).map_err(|e| e.to_string())
            }
            Ok(other) => Err(format!("unexpected storage reply {other:?}")),
            Err(e) => Err(e.to_string()),
        };
        let mut messages = restored.unwrap_or_else(|e| {
            error!(error = %e, "failed to load messages");
            Vec::new()
        });

        if messages.is_empty() && !model.config.seed_messages.is_empty() {
            messages = model
                .config
                .seed_messages
                .iter()
                .map(|seed| model.outbox.create_message(seed.text.clone(), seed.source, None))
                .collect();
            let records = messages.iter().map(StoredRecord::from).collect();
            caps.storage.put_batch(records, Event::Seeded);
            info!(count = messages.len(), "seeded default messages");
        } else {
            info!(count = messages.len(), next_id = %model.outbox.peek_next_id(), "loaded messages");
        }

        model.messages = messages;
        model.phase = SessionPhase::Ready;
        Self::regroup(model, caps);
        caps.render.render();
    }

    fn handle_submit(&self, model: &mut Model, caps: &Capabilities) {
        if model.phase != SessionPhase::Ready {
            debug!("submission before messages loaded");
            return;
        }
        if model.classifying.is_some() {
            debug!("filter check in flight, submission ignored");
            return;
        }

        let text = model.draft.trim().to_string();
        if text.is_empty() {
            return;
        }

        if model.filter_enabled {
            let prepared = prepare_for_classifier(&self.emoji, &text);
            model.classifying = Some(text.clone());
            caps.moderation
                .classify(prepared, model.filter.threshold, move |result| {
                    Event::Classified { text, result }
                });
            caps.render.render();
        } else {
            self.append(model, caps, &text, None);
        }
    }

    /// The message shows up in the log at once and reaches the store with the
    /// next flush.
    fn append(&self, model: &mut Model, caps: &Capabilities, text: &str, is_inappropriate: Option<bool>) {
        let message =
            model
                .outbox
                .create_message(self.emoji.emojify(text), MessageSource::You, is_inappropriate);
        debug!(id = %message.id(), ?is_inappropriate, "message submitted");

        model.messages.push(message.clone());
        // Typing that went on during a filter check is kept.
        if model.draft.trim() == text {
            model.draft.clear();
        }
        Self::regroup(model, caps);

        let pending = model.outbox.push(message);
        if pending >= model.sync.batch_threshold {
            Self::flush(model, caps, "threshold");
        }
        caps.render.render();
    }

    fn handle_clear(model: &mut Model, caps: &Capabilities) {
        model.messages.clear();
        model.outbox.clear();
        if model.outbox.is_flushing() {
            model.clear_deferred = true;
            debug!("store clear waits for the write in flight");
        } else {
            caps.storage.clear(Event::Cleared);
        }
        Self::regroup(model, caps);
        model.virtualizer.set_scroll_offset(0.0);
        caps.render.render();
    }

    fn handle_lifecycle(change: PageLifecycle, model: &mut Model, caps: &Capabilities) {
        if !model.background_sync {
            debug!(?change, "background sync stopped, lifecycle change ignored");
            return;
        }
        match change {
            PageLifecycle::Visible => Self::flush(model, caps, "visible"),
            PageLifecycle::BeforeUnload if !model.outbox.is_empty() => {
                Self::flush(model, caps, "unload");
            }
            PageLifecycle::BeforeUnload | PageLifecycle::Hidden => {}
        }
    }

    fn flush(model: &mut Model, caps: &Capabilities, trigger: &'static str) {
        if model.outbox.is_flushing() {
            debug!(trigger, "flush already in progress");
            return;
        }
        let Some(batch) = model.outbox.begin_flush() else {
            return;
        };
        let ticket = batch.ticket;
        debug!(trigger, sent = ticket.sent(), "flush triggered");
        caps.storage
            .put_batch(batch.records, move |result| Event::Flushed { ticket, result });
    }

    fn handle_flushed(
        ticket: FlushTicket,
        result: &StorageResult,
        model: &mut Model,
        caps: &Capabilities,
    ) {
        let committed = match result {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, pending = ticket.sent(), "failed to sync messages");
                false
            }
        };
        let removed = model.outbox.finish_flush(ticket, committed);
        if committed {
            info!(sent = ticket.sent(), removed, remaining = model.outbox.len(), "flushed messages");
        }

        if model.clear_deferred {
            model.clear_deferred = false;
            caps.storage.clear(Event::Cleared);
        }
        caps.render.render();
    }

    fn regroup(model: &mut Model, caps: &Capabilities) {
        let previous = model.grouped.len();
        model.grouped = group_messages(&model.messages, &model.config.grouping, &model.config.time_zone);
        model.virtualizer.set_items(&model.grouped);

        if model.grouped.len() > previous {
            Self::scroll_to_bottom(model, caps);
        }
    }

    // Estimates may be off for rows not yet measured, so the index scroll is
    // backed by a jump to the container's real end and a late smooth pass.
    fn scroll_to_bottom(model: &mut Model, caps: &Capabilities) {
        let Some(last) = model.grouped.len().checked_sub(1) else {
            return;
        };
        model.virtualizer.scroll_to_index(last, Align::End);

        caps.viewport.scroll(ScrollRequest::instant(ScrollTarget::Index {
            index: last,
            align: Align::End,
        }));
        caps.viewport.scroll(ScrollRequest::instant(ScrollTarget::Bottom));
        caps.timer.notify_after(
            duration_millis(model.config.scroll_correction_delay),
            Event::ScrollCorrection,
        );
    }
}
