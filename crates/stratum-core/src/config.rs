use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// User preference for the accelerator path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorMode {
    /// Use the accelerator when one is available and the stage supports it.
    #[default]
    Auto,
    /// Never use the accelerator.
    Disabled,
}

/// Per-evaluation pipeline settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub accelerator: AcceleratorMode,
    /// Pass the 4th (mask) channel through every stage for mask preview.
    pub mask_display: bool,
    /// Split tiling-capable stages into square tiles of this edge length.
    pub tile_size: Option<u32>,
    /// Worker threads for the general path. `None` uses the global rayon pool.
    pub threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            accelerator: AcceleratorMode::Auto,
            mask_display: false,
            tile_size: None,
            threads: None,
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Load from a JSON file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn accelerator_enabled(&self) -> bool {
        self.accelerator == AcceleratorMode::Auto
    }
}

#[derive(Default)]
pub struct PipelineConfigBuilder {
    accelerator: Option<AcceleratorMode>,
    mask_display: Option<bool>,
    tile_size: Option<Option<u32>>,
    threads: Option<Option<usize>>,
}

impl PipelineConfigBuilder {
    pub fn accelerator(mut self, mode: AcceleratorMode) -> Self {
        self.accelerator = Some(mode);
        self
    }

    pub fn mask_display(mut self, enable: bool) -> Self {
        self.mask_display = Some(enable);
        self
    }

    pub fn tile_size(mut self, tile: Option<u32>) -> Self {
        self.tile_size = Some(tile);
        self
    }

    pub fn threads(mut self, threads: Option<usize>) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn build(self) -> PipelineConfig {
        let default = PipelineConfig::default();
        PipelineConfig {
            accelerator: self.accelerator.unwrap_or(default.accelerator),
            mask_display: self.mask_display.unwrap_or(default.mask_display),
            tile_size: self.tile_size.unwrap_or(default.tile_size).filter(|&t| t > 0),
            threads: self.threads.unwrap_or(default.threads),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = PipelineConfig::builder()
            .accelerator(AcceleratorMode::Disabled)
            .tile_size(Some(256))
            .build();
        assert!(!cfg.accelerator_enabled());
        assert_eq!(cfg.tile_size, Some(256));
        assert!(!cfg.mask_display);
        assert_eq!(cfg.threads, None);
    }

    #[test]
    fn zero_tile_means_untiled() {
        let cfg = PipelineConfig::builder().tile_size(Some(0)).build();
        assert_eq!(cfg.tile_size, None);
    }

    #[test]
    fn json_partial_uses_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"accelerator":"disabled","mask_display":true}"#).unwrap();
        assert_eq!(cfg.accelerator, AcceleratorMode::Disabled);
        assert!(cfg.mask_display);
        assert_eq!(cfg.tile_size, None);
    }

    #[test]
    fn json_roundtrip() {
        let cfg = PipelineConfig::builder().threads(Some(2)).build();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
