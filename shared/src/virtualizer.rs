//! Windowed layout for the grouped message list.
//!
//! Sizes start out as estimates and are replaced by real measurements as the
//! shell renders rows. Offsets are prefix sums over those sizes; only the
//! rows intersecting the viewport (plus overscan) are handed out.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::model::{GroupedItem, ItemKey};
use crate::offline_store::ConfigError;
use crate::{
    BUBBLE_BASE_ESTIMATE, BUBBLE_LINE_ESTIMATE, CHARS_PER_LINE, DEFAULT_OVERSCAN,
    MARKER_SIZE_ESTIMATE,
};

/// Where `scroll_to_index` places the target row inside the viewport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Align {
    Start,
    Center,
    End,
    /// Scroll the minimum distance needed to make the row fully visible.
    #[default]
    Auto,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VirtualizerConfig {
    /// Rows materialized beyond each edge of the viewport.
    pub overscan: usize,
    pub marker_estimate: f64,
    pub bubble_base_estimate: f64,
    pub bubble_line_estimate: f64,
    pub chars_per_line: usize,
}

impl Default for VirtualizerConfig {
    fn default() -> Self {
        Self {
            overscan: DEFAULT_OVERSCAN,
            marker_estimate: MARKER_SIZE_ESTIMATE,
            bubble_base_estimate: BUBBLE_BASE_ESTIMATE,
            bubble_line_estimate: BUBBLE_LINE_ESTIMATE,
            chars_per_line: CHARS_PER_LINE,
        }
    }
}

impl VirtualizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chars_per_line == 0 {
            return Err(ConfigError::Zero {
                field: "chars_per_line",
            });
        }
        for (field, value) in [
            ("marker_estimate", self.marker_estimate),
            ("bubble_base_estimate", self.bubble_base_estimate),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Zero { field });
            }
        }
        if !(self.bubble_line_estimate.is_finite() && self.bubble_line_estimate >= 0.0) {
            return Err(ConfigError::Zero {
                field: "bubble_line_estimate",
            });
        }
        Ok(())
    }

    /// Markers are fixed height; bubbles grow by one line estimate for every
    /// `chars_per_line` characters past the first line.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate(&self, item: &GroupedItem) -> f64 {
        match item {
            GroupedItem::Timestamp(_) => self.marker_estimate,
            GroupedItem::Message(message) => {
                let chars = message.text().chars().count();
                let extra_lines = chars.div_ceil(self.chars_per_line).saturating_sub(1);
                self.bubble_base_estimate + self.bubble_line_estimate * extra_lines as f64
            }
        }
    }
}

/// A row the shell should render, positioned in virtual content coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VirtualItem {
    pub index: usize,
    pub key: ItemKey,
    pub start: f64,
    pub size: f64,
    pub end: f64,
}

#[derive(Debug, Clone)]
pub struct Virtualizer {
    config: VirtualizerConfig,
    keys: Vec<ItemKey>,
    estimates: Vec<f64>,
    measured: HashMap<ItemKey, f64>,
    // starts[i] is the offset of row i; starts[len] is the total size.
    starts: Vec<f64>,
    scroll_offset: f64,
    viewport_size: f64,
}

impl Default for Virtualizer {
    fn default() -> Self {
        Self::with_config(VirtualizerConfig::default())
    }
}

impl Virtualizer {
    pub fn new(config: VirtualizerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    fn with_config(config: VirtualizerConfig) -> Self {
        Self {
            config,
            keys: Vec::new(),
            estimates: Vec::new(),
            measured: HashMap::new(),
            starts: vec![0.0],
            scroll_offset: 0.0,
            viewport_size: 0.0,
        }
    }

    pub fn config(&self) -> &VirtualizerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Replaces the row list. Measurements survive for rows whose key is
    /// still present, so appending messages keeps earlier rows exact.
    pub fn set_items(&mut self, items: &[GroupedItem]) {
        self.keys = items.iter().map(GroupedItem::key).collect();
        self.estimates = items.iter().map(|item| self.config.estimate(item)).collect();

        let live: HashSet<ItemKey> = self.keys.iter().copied().collect();
        self.measured.retain(|key, _| live.contains(key));

        self.rebuild_offsets();
        self.scroll_offset = self.scroll_offset.min(self.max_scroll_offset());
    }

    fn size_at(&self, index: usize) -> f64 {
        self.measured
            .get(&self.keys[index])
            .copied()
            .unwrap_or(self.estimates[index])
    }

    fn rebuild_offsets(&mut self) {
        let mut starts = Vec::with_capacity(self.keys.len() + 1);
        let mut offset = 0.0;
        starts.push(offset);
        for index in 0..self.keys.len() {
            offset += self.size_at(index);
            starts.push(offset);
        }
        self.starts = starts;
    }

    pub fn total_size(&self) -> f64 {
        self.starts.last().copied().unwrap_or(0.0)
    }

    pub fn scroll_offset(&self) -> f64 {
        self.scroll_offset
    }

    pub fn viewport_size(&self) -> f64 {
        self.viewport_size
    }

    pub fn max_scroll_offset(&self) -> f64 {
        (self.total_size() - self.viewport_size).max(0.0)
    }

    pub fn set_scroll_offset(&mut self, offset: f64) {
        if offset.is_finite() {
            self.scroll_offset = offset.clamp(0.0, self.max_scroll_offset());
        }
    }

    pub fn set_viewport_size(&mut self, size: f64) {
        if size.is_finite() {
            self.viewport_size = size.max(0.0);
            self.scroll_offset = self.scroll_offset.min(self.max_scroll_offset());
        }
    }

    // Row containing `offset`; offsets past the end map to the last row.
    fn index_at(&self, offset: f64) -> usize {
        let rows = &self.starts[..self.keys.len()];
        rows.partition_point(|&start| start <= offset)
            .saturating_sub(1)
    }

    /// Rows intersecting `[scroll_offset, scroll_offset + viewport)` widened by
    /// the overscan on both sides, in index order.
    pub fn virtual_items(&self) -> Vec<VirtualItem> {
        if self.keys.is_empty() {
            return Vec::new();
        }

        let first_visible = self.index_at(self.scroll_offset);
        let viewport_end = self.scroll_offset + self.viewport_size;
        let last_visible = self.starts[..self.keys.len()]
            .partition_point(|&start| start < viewport_end)
            .saturating_sub(1)
            .max(first_visible);

        let first = first_visible.saturating_sub(self.config.overscan);
        let last = (last_visible + self.config.overscan).min(self.keys.len() - 1);

        (first..=last)
            .map(|index| VirtualItem {
                index,
                key: self.keys[index],
                start: self.starts[index],
                size: self.starts[index + 1] - self.starts[index],
                end: self.starts[index + 1],
            })
            .collect()
    }

    /// Records the rendered size of row `index`. A correction to a row above
    /// the scroll position moves the offset with it so the visible rows stay
    /// put. Returns whether anything changed.
    pub fn measure_element(&mut self, index: usize, size: f64) -> bool {
        if index >= self.keys.len() || !size.is_finite() || size < 0.0 {
            debug!(index, size, "ignoring measurement");
            return false;
        }

        let delta = size - self.size_at(index);
        if delta.abs() < f64::EPSILON {
            return false;
        }

        let above_viewport = self.starts[index] < self.scroll_offset;
        self.measured.insert(self.keys[index], size);
        self.rebuild_offsets();

        if above_viewport {
            self.scroll_offset = (self.scroll_offset + delta).clamp(0.0, self.max_scroll_offset());
        }
        true
    }

    /// Moves the scroll position so row `index` sits per `align`, clamped to
    /// the scrollable range. Out-of-range indices target the last row.
    pub fn scroll_to_index(&mut self, index: usize, align: Align) -> f64 {
        if self.keys.is_empty() {
            self.scroll_offset = 0.0;
            return self.scroll_offset;
        }

        let index = index.min(self.keys.len() - 1);
        let start = self.starts[index];
        let end = self.starts[index + 1];

        let target = match align {
            Align::Start => start,
            Align::End => end - self.viewport_size,
            Align::Center => start + (end - start) / 2.0 - self.viewport_size / 2.0,
            Align::Auto => {
                if start < self.scroll_offset {
                    start
                } else if end > self.scroll_offset + self.viewport_size {
                    end - self.viewport_size
                } else {
                    self.scroll_offset
                }
            }
        };

        self.scroll_offset = target.clamp(0.0, self.max_scroll_offset());
        self.scroll_offset
    }

    pub fn scroll_to_end(&mut self) -> f64 {
        self.scroll_offset = self.max_scroll_offset();
        self.scroll_offset
    }
}
