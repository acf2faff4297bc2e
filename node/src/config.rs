//! Node configuration: the protocol settings plus the TMS the node serves,
//! read from an optional JSON file. Missing fields take their defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use tokenflow_protocol::config::{AuditLimits, FinalityConfig, SelectorConfig, TtxConfig};
use tokenflow_protocol::ttx::TmsId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: String,
    pub channel: String,
    pub namespace: String,
    pub ttx: TtxConfig,
    pub finality: FinalityConfig,
    pub selector: SelectorConfig,
    pub audit: AuditLimits,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: "tokenflow".to_string(),
            channel: "main".to_string(),
            namespace: "tokens".to_string(),
            ttx: TtxConfig::default(),
            finality: FinalityConfig::default(),
            selector: SelectorConfig::default(),
            audit: AuditLimits::default(),
        }
    }
}

impl NodeConfig {
    /// Read `path`, or return the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn tms_id(&self) -> TmsId {
        TmsId::new(&self.network, &self.channel, &self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn no_path_means_defaults() {
        assert_eq!(NodeConfig::load(None).unwrap(), NodeConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"network": "devnet", "finality": {{"polling_interval": 50}}, "audit": {{"payment_limit": 10}}}}"#
        )
        .unwrap();

        let cfg = NodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.network, "devnet");
        assert_eq!(cfg.channel, "main");
        assert_eq!(cfg.finality.polling_interval, Duration::from_millis(50));
        assert_eq!(cfg.finality.max_timeout, FinalityConfig::default().max_timeout);
        assert_eq!(cfg.audit.payment_limit, 10);
        assert_eq!(cfg.audit.holding_limit, AuditLimits::default().holding_limit);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = NodeConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }
}
