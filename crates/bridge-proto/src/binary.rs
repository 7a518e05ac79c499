//! Resolved CLI binary description.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Features the installed CLI advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// `--output-format` is accepted, so headless runs can emit JSON.
    pub structured_output: bool,
    /// A custom slash-command directory is configured.
    pub custom_commands: bool,
}

/// A located and probed CLI binary.
///
/// Immutable once probed; the locator re-probes only on explicit refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryInfo {
    pub path: PathBuf,
    pub version: String,
    pub capabilities: Capabilities,
}

impl BinaryInfo {
    pub fn new(path: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
            capabilities: Capabilities::default(),
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}
