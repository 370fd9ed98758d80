//! Versioned module parameters.
//!
//! Stored edits are [`ParamsBlob`]s: a schema version plus the serialized
//! field values of that version's record. Each module declares one typed
//! record per shipped version and upgrades old blobs with explicit
//! `(from, to)` migrations; nothing here reinterprets raw memory.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ModuleError, Result};

/// Declared bounds and default of one numeric parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamField {
    pub name: &'static str,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub description: &'static str,
}

impl ParamField {
    pub const fn new(name: &'static str, min: f32, max: f32, default: f32) -> Self {
        Self {
            name,
            min,
            max,
            default,
            description: "",
        }
    }

    pub const fn describe(self, description: &'static str) -> Self {
        Self {
            description,
            ..self
        }
    }

    /// Clamp into the declared bounds. NaN falls back to the default.
    pub fn clamp(&self, v: f32) -> f32 {
        if v.is_nan() {
            self.default
        } else {
            v.clamp(self.min, self.max)
        }
    }
}

/// One version of a module's parameter record.
pub trait ParamsSchema:
    Serialize + DeserializeOwned + Clone + Debug + Default + PartialEq + Send + Sync + 'static
{
    const VERSION: u32;

    fn fields() -> &'static [ParamField];

    /// Copy with every field clamped into its declared bounds.
    fn clamped(&self) -> Self;
}

/// A serialized parameter record tagged with its schema version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamsBlob {
    pub version: u32,
    pub values: serde_json::Value,
}

impl ParamsBlob {
    pub fn encode<P: ParamsSchema>(params: &P) -> Result<Self> {
        let values = serde_json::to_value(params).map_err(anyhow::Error::from)?;
        Ok(Self {
            version: P::VERSION,
            values,
        })
    }

    /// Decode as `P`, which must be the record for this blob's version.
    pub fn decode<P: ParamsSchema>(&self, op: &str) -> Result<P> {
        if self.version != P::VERSION {
            return Err(ModuleError::MalformedParams {
                op: op.to_string(),
                version: self.version,
                reason: format!("expected a version {} record", P::VERSION),
            });
        }
        P::deserialize(&self.values).map_err(|e| ModuleError::MalformedParams {
            op: op.to_string(),
            version: self.version,
            reason: e.to_string(),
        })
    }
}

/// One entry of an edit history: which module, whether it is on, and its stored params.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub op: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub params: ParamsBlob,
}

fn default_enabled() -> bool {
    true
}

impl HistoryItem {
    pub fn new(op: impl Into<String>, params: ParamsBlob) -> Self {
        Self {
            op: op.into(),
            enabled: true,
            params,
        }
    }
}

/// Bring `blob` up to `current` using a module's pairwise `migrate`.
///
/// The direct `(old, current)` pair is tried first; when the module does not
/// declare it, single-version steps are chained. Blobs newer than `current`
/// are never downgraded.
pub fn migrate_to_current<F>(
    op: &str,
    blob: &ParamsBlob,
    current: u32,
    migrate: F,
) -> Result<ParamsBlob>
where
    F: Fn(&ParamsBlob, u32) -> Result<ParamsBlob>,
{
    let unsupported = || ModuleError::UnsupportedMigration {
        op: op.to_string(),
        from: blob.version,
        to: current,
    };

    if blob.version == current {
        return Ok(blob.clone());
    }
    if blob.version == 0 || blob.version > current {
        return Err(unsupported());
    }

    match migrate(blob, current) {
        Ok(direct) => return Ok(direct),
        Err(ModuleError::UnsupportedMigration { .. }) => {}
        Err(e) => return Err(e),
    }

    let mut step = blob.clone();
    while step.version < current {
        let next = step.version + 1;
        debug!(op, from = step.version, to = next, "stepwise params migration");
        step = match migrate(&step, next) {
            Ok(upgraded) => upgraded,
            Err(ModuleError::UnsupportedMigration { .. }) => return Err(unsupported()),
            Err(e) => return Err(e),
        };
    }
    Ok(step)
}
