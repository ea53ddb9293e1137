use std::ops::Range;
use std::sync::Arc;

use burn::data::dataset::Dataset;
use chrono::NaiveDate;

use crate::error::{PipelineError, Result};
use crate::features::FeatureTable;
use crate::records::{FeatureRecord, InstrumentId, NUM_FEATURES};

/// One model input: `L` consecutive feature rows of one instrument and the
/// target of the last row.
#[derive(Clone, Debug)]
pub struct WindowItem {
    pub instrument: InstrumentId,
    pub start_date: NaiveDate,
    /// Date of the last row; the prediction is made at the close of this day
    pub end_date: NaiveDate,
    pub features: Vec<[f32; NUM_FEATURES]>,
    pub target: f32,
}

impl WindowItem {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Fixed-length overlapping windows over one instrument's table.
///
/// The table must already be restricted to a single split and to one
/// unbroken run of valid rows; windows index into it and never copy it.
#[derive(Clone, Debug)]
pub struct SequenceDataset {
    table: Arc<FeatureTable>,
    window_len: usize,
    stride: usize,
}

impl SequenceDataset {
    pub fn new(table: Arc<FeatureTable>, window_len: usize, stride: usize) -> Result<Self> {
        if window_len == 0 || stride == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "window_len and stride must be positive, got {window_len} and {stride}"
            )));
        }
        Ok(Self::from_parts(table, window_len, stride))
    }

    /// For callers holding a validated `PipelineConfig`.
    pub(crate) fn from_parts(table: Arc<FeatureTable>, window_len: usize, stride: usize) -> Self {
        debug_assert!(window_len > 0 && stride > 0);
        Self {
            table,
            window_len,
            stride,
        }
    }

    pub fn instrument(&self) -> &InstrumentId {
        &self.table.instrument
    }

    pub fn table(&self) -> &FeatureTable {
        &self.table
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Row range covered by window `index`.
    pub fn bounds(&self, index: usize) -> Option<Range<usize>> {
        if index >= self.len() {
            return None;
        }
        let start = index * self.stride;
        Some(start..start + self.window_len)
    }

    /// Borrowed view of the rows of window `index`.
    pub fn window_rows(&self, index: usize) -> Option<&[FeatureRecord]> {
        self.bounds(index).map(|range| &self.table.rows[range])
    }

    pub fn target(&self, index: usize) -> Option<f64> {
        self.window_rows(index)
            .and_then(|rows| rows.last())
            .map(|r| r.target)
    }
}

impl Dataset<WindowItem> for SequenceDataset {
    fn get(&self, index: usize) -> Option<WindowItem> {
        let rows = self.window_rows(index)?;
        let first = rows.first()?;
        let last = rows.last()?;
        let features = rows
            .iter()
            .map(|r| {
                let mut out = [0f32; NUM_FEATURES];
                for (dst, src) in out.iter_mut().zip(r.values.iter()) {
                    *dst = *src as f32;
                }
                out
            })
            .collect();
        Some(WindowItem {
            instrument: self.table.instrument.clone(),
            start_date: first.date,
            end_date: last.date,
            features,
            target: last.target as f32,
        })
    }

    fn len(&self) -> usize {
        let rows = self.table.rows.len();
        if rows < self.window_len {
            0
        } else {
            (rows - self.window_len) / self.stride + 1
        }
    }
}
