// Restart state: just enough to resume reconciliation without replaying
// fill history.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::types::{DesiredGridSpec, ProtectionState};
use crate::error::{TradingError, TradingResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub spec: DesiredGridSpec,
    pub protection_state: ProtectionState,
    pub saved_at: DateTime<Utc>,
}

/// JSON snapshot of the coordinator's durable state. Written on every
/// state-changing transition, loaded once at startup.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn save(&self, spec: &DesiredGridSpec, protection_state: ProtectionState) -> TradingResult<()> {
        let state = PersistedState {
            spec: spec.clone(),
            protection_state,
            saved_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&state)?;

        // Write-then-rename so a crash mid-write never corrupts the snapshot
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| TradingError::StateWrite(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| TradingError::StateWrite(e.to_string()))?;
        Ok(())
    }

    pub fn load(&self) -> TradingResult<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&self.path).map_err(|e| TradingError::StateRead(e.to_string()))?;
        let state: PersistedState = serde_json::from_str(&content)?;
        info!(
            "💾 Restored grid state from {} (saved {})",
            self.path.display(),
            state.saved_at
        );
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::planner::GridPlanner;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let spec = GridPlanner::new(Config::default().grid).build(100_000.0, Utc::now());
        store.save(&spec, ProtectionState::ScalpingActive).unwrap();

        let restored = store.load().unwrap().unwrap();
        assert_eq!(restored.spec, spec);
        assert_eq!(restored.protection_state, ProtectionState::ScalpingActive);
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("missing.json"));
        assert!(store.load().unwrap().is_none());
    }
}
