// src/request.rs - Stack injection request and processing options
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::tool::FilterChain;

/// Filtering and stacking options for one job.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProcessingOptions {
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub threshold: bool,
    /// Binarization level in percent of full brightness (0–100). Callers holding an
    /// absolute 0–255 gray level convert with [`ProcessingOptions::threshold_from_gray_level`].
    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: f64,
    /// Use the first slice for every archive slot instead of a numbered stack.
    #[serde(default)]
    pub repeat_first: bool,
    #[serde(default)]
    pub use_mask: bool,
    #[serde(default)]
    pub mask_image: Option<PathBuf>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            negate: false,
            threshold: false,
            threshold_percent: default_threshold_percent(),
            repeat_first: false,
            use_mask: false,
            mask_image: None,
        }
    }
}

fn default_threshold_percent() -> f64 {
    50.0
}

impl ProcessingOptions {
    /// Convert an absolute gray level (0–255) to the percent scale used here.
    pub fn threshold_from_gray_level(level: u8) -> f64 {
        f64::from(level) * 100.0 / 255.0
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.threshold && !(0.0..=100.0).contains(&self.threshold_percent) {
            return Err(format!("threshold {} is outside 0-100 percent", self.threshold_percent));
        }
        if self.use_mask && self.mask_image.as_ref().is_none_or(|p| p.as_os_str().is_empty()) {
            return Err("mask enabled but no mask image given".to_string());
        }
        Ok(())
    }

    /// The per-slice filter chain these options select.
    pub fn filter_chain(&self) -> FilterChain {
        FilterChain {
            negate: self.negate,
            threshold_percent: self.threshold.then_some(self.threshold_percent),
            mask: if self.use_mask { self.mask_image.clone() } else { None },
        }
    }
}

/// Everything one injection job needs. Immutable once submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct StackRequest {
    /// Sliced archive whose control files are kept.
    pub template: PathBuf,
    /// First image of the replacement stack.
    pub first_slice: PathBuf,
    /// Archive to write. Its file stem names the slice images inside.
    pub output: PathBuf,
    pub options: ProcessingOptions,
}

impl StackRequest {
    pub fn new(template: impl Into<PathBuf>, first_slice: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            first_slice: first_slice.into(),
            output: output.into(),
            options: ProcessingOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ProcessingOptions) -> Self {
        self.options = options;
        self
    }

    /// Base name for slices in the output archive.
    pub fn output_base(&self) -> String {
        self.output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
