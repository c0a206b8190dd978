//! Approver configuration. Everything is optional with defaults; a missing
//! file means defaults, an unparseable file is a startup failure.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApproverConfig {
    pub node_client_cert: NodeClientCert,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeClientCert {
    /// When true, the client-bootstrap pipeline is skipped entirely and
    /// bootstrap CSRs are never approved.
    pub disabled: bool,
}

impl ApproverConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => return Ok(Self::default()),
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.display()))
    }
}
