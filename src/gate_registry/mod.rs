//! GateRegistry - Gate/Station Camera Configuration
//!
//! ## Responsibilities
//!
//! - Load gate definitions (with their cameras) from a JSON file
//! - Read-only lookup by gate id
//! - Known camera hosts for the proxy allowlist
//!
//! Gates and devices are immutable for the process lifetime.

mod types;

pub use types::*;

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// On-disk shape: either a bare array or `{ "gates": [...] }`
#[derive(Deserialize)]
#[serde(untagged)]
enum GatesFile {
    List(Vec<GateConfig>),
    Wrapped { gates: Vec<GateConfig> },
}

/// GateRegistry instance
#[derive(Debug, Default)]
pub struct GateRegistry {
    gates: BTreeMap<GateId, GateConfig>,
}

impl GateRegistry {
    /// Build from an in-memory list. Later duplicates are rejected.
    pub fn from_gates(list: Vec<GateConfig>) -> Result<Self> {
        let mut gates = BTreeMap::new();
        for gate in list {
            if let Some(camera) = &gate.camera {
                if camera.ip_address.trim().is_empty() {
                    return Err(Error::Config(format!(
                        "gate {} has a camera without an address",
                        gate.gate_id
                    )));
                }
            }
            let id = gate.gate_id;
            if gates.insert(id, gate).is_some() {
                return Err(Error::Config(format!("duplicate gate id {}", id)));
            }
        }
        Ok(Self { gates })
    }

    /// Parse the JSON gates file contents
    pub fn from_json(raw: &str) -> Result<Self> {
        let parsed: GatesFile = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid gates file: {}", e)))?;
        let list = match parsed {
            GatesFile::List(list) => list,
            GatesFile::Wrapped { gates } => gates,
        };
        Self::from_gates(list)
    }

    /// Load from disk. A missing file yields an empty registry.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let registry = Self::from_json(&raw)?;
                tracing::info!(
                    path = %path.display(),
                    gates = registry.len(),
                    "Gate configuration loaded"
                );
                Ok(registry)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Gates file not found, no gates configured");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, gate_id: GateId) -> Option<&GateConfig> {
        self.gates.get(&gate_id)
    }

    /// Gate lookup that maps absence to `Error::NotFound`
    pub fn require(&self, gate_id: GateId) -> Result<&GateConfig> {
        self.get(gate_id)
            .ok_or_else(|| Error::NotFound(format!("gate {}", gate_id)))
    }

    /// Gate plus its camera, or an error naming what is missing
    pub fn require_camera(&self, gate_id: GateId) -> Result<(&GateConfig, &CameraDevice)> {
        let gate = self.require(gate_id)?;
        let camera = gate.camera.as_ref().ok_or_else(|| {
            Error::Validation(format!("gate {} has no camera configured", gate_id))
        })?;
        Ok((gate, camera))
    }

    /// All gates, ordered by id
    pub fn all(&self) -> impl Iterator<Item = &GateConfig> {
        self.gates.values()
    }

    /// Gates that have a camera and therefore get polled
    pub fn with_cameras(&self) -> impl Iterator<Item = &GateConfig> {
        self.gates.values().filter(|g| g.camera.is_some())
    }

    /// Distinct camera hosts, for seeding the proxy allowlist
    pub fn camera_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .with_cameras()
            .filter_map(|g| g.camera.as_ref().map(|c| c.ip_address.clone()))
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
