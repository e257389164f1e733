//! Segment merge/trim engine
//!
//! Turns the two most recent segments and a record window into one clip:
//! trims the latest segment alone when it suffices, otherwise concatenates
//! both and trims the tail of the concatenation.

use super::types::{ExportError, ExportPreset, ExportRequest, MediaExporter, MergePlan, TrimRange};
use crate::config::FileLayout;
use crate::recorder::segments::SlotIndex;
use crate::utils::fs::remove_quietly;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Settled segment paths ordered chronologically for a stop on `current`.
///
/// The slot active at stop time holds the later segment.
pub fn chronological_sources(layout: &FileLayout, current: SlotIndex) -> (PathBuf, PathBuf) {
    (
        layout.recorded_segment_path(current.other()),
        layout.recorded_segment_path(current),
    )
}

pub struct MergeTrimEngine {
    exporter: Arc<dyn MediaExporter>,
    output: PathBuf,
}

impl MergeTrimEngine {
    pub fn new(exporter: Arc<dyn MediaExporter>, output: PathBuf) -> Self {
        Self { exporter, output }
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// Decide how to build the clip.
    ///
    /// `earlier` is ignored when it does not exist on disk.
    pub async fn plan(
        &self,
        earlier: Option<&Path>,
        later: &Path,
        window: Duration,
    ) -> Result<MergePlan, ExportError> {
        if !later.exists() {
            return Err(ExportError::MissingSource(later.to_path_buf()));
        }

        let later_duration = self.exporter.duration(later).await?;
        let earlier = match earlier.filter(|path| path.exists()) {
            Some(earlier) => earlier,
            None => {
                return Ok(MergePlan::TrimSingle {
                    source: later.to_path_buf(),
                    range: TrimRange::tail(later_duration, window),
                })
            }
        };

        if later_duration >= window {
            return Ok(MergePlan::TrimSingle {
                source: later.to_path_buf(),
                range: TrimRange::tail(later_duration, window),
            });
        }

        let earlier_duration = self.exporter.duration(earlier).await?;
        Ok(MergePlan::ConcatAndTrim {
            earlier: earlier.to_path_buf(),
            later: later.to_path_buf(),
            range: TrimRange::tail(earlier_duration + later_duration, window),
        })
    }

    /// Plan and export, replacing the previous clip at the output path
    pub async fn run(
        &self,
        earlier: Option<&Path>,
        later: &Path,
        window: Duration,
    ) -> Result<PathBuf, ExportError> {
        let plan = self.plan(earlier, later, window).await?;
        tracing::info!(
            sources = plan.sources().len(),
            start = plan.range().start_secs(),
            end = plan.range().end_secs(),
            "Exporting clip"
        );

        remove_quietly(&self.output);
        let request = ExportRequest {
            sources: plan.sources(),
            range: plan.range(),
            output: self.output.clone(),
            preset: ExportPreset::HighestQuality,
            optimize_for_network: true,
        };
        self.exporter.export(&request).await?;
        Ok(self.output.clone())
    }
}
