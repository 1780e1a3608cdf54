//! Conflict resolution strategies

use serde_json::Value;

use super::FieldMerge;
use crate::error::{KeepsakeError, Result};
use crate::types::{DeviceConflict, ResolutionStrategy};

/// The payload a strategy settled on
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    /// `None` resolves to a delete
    pub data: Option<Value>,
    pub selected_device: Option<String>,
}

/// Conflict resolver with the supported strategies
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    merger: FieldMerge,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            merger: FieldMerge::new(),
        }
    }

    /// Decide the resolved payload; does not touch any state
    pub fn resolve(
        &self,
        conflict: &DeviceConflict,
        strategy: ResolutionStrategy,
        selected_device: Option<&str>,
        manual_data: Option<Value>,
    ) -> Result<Resolution> {
        match strategy {
            ResolutionStrategy::UseDevice => {
                let device = selected_device.ok_or_else(|| {
                    KeepsakeError::InvalidInput("use_device requires a device id".to_string())
                })?;
                let version = conflict
                    .versions
                    .iter()
                    .filter(|v| v.device_id == device)
                    .max_by_key(|v| v.version)
                    .ok_or_else(|| {
                        KeepsakeError::InvalidInput(format!(
                            "Device {} has no version in conflict {}",
                            device, conflict.id
                        ))
                    })?;
                Ok(Resolution {
                    strategy,
                    data: version.data.clone(),
                    selected_device: Some(device.to_string()),
                })
            }
            ResolutionStrategy::Merge => Ok(Resolution {
                strategy,
                data: self.merger.merge(&conflict.versions),
                selected_device: None,
            }),
            ResolutionStrategy::Manual => {
                let data = manual_data.ok_or_else(|| {
                    KeepsakeError::InvalidInput("manual resolution requires data".to_string())
                })?;
                Ok(Resolution {
                    strategy,
                    data: Some(data),
                    selected_device: None,
                })
            }
        }
    }
}
