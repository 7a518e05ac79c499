//! Discovery of the external CLI binary.
//!
//! Candidates are checked in a fixed order: the explicit `binary.path` (set
//! by `CODER_BRIDGE_BINARY`), configured names resolved on `PATH`, configured
//! search paths, then well-known install locations. The first candidate that exists
//! and answers `--version` within the probe timeout wins.

use bridge_core::BinaryConfig;
use bridge_proto::{BinaryInfo, BridgeError, Capabilities};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Install locations checked after `PATH` and the configured search paths.
/// A leading `~/` is expanded against the user's home directory.
pub const WELL_KNOWN_LOCATIONS: &[&str] = &[
    "~/.claude/local/claude",
    "~/.local/bin/claude",
    "~/.npm-global/bin/claude",
    "/usr/local/bin/claude",
    "/opt/homebrew/bin/claude",
];

/// Error returned when no candidate is usable.
#[derive(Debug, Clone)]
pub struct NotFoundError {
    /// Candidates that were checked, in order.
    pub checked: Vec<String>,
}

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "No usable CLI binary found.")?;
        writeln!(f)?;
        if self.checked.is_empty() {
            writeln!(f, "No candidate locations exist.")?;
        } else {
            writeln!(f, "Checked: {}", self.checked.join(", "))?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "Install the CLI or point CODER_BRIDGE_BINARY at its executable."
        )?;
        Ok(())
    }
}

impl std::error::Error for NotFoundError {}

impl From<NotFoundError> for BridgeError {
    fn from(err: NotFoundError) -> Self {
        BridgeError::NotFound {
            candidates: err.checked.len(),
        }
    }
}

/// Finds and probes the CLI, caching the result until [`refresh`](Self::refresh).
#[derive(Debug)]
pub struct BinaryLocator {
    config: BinaryConfig,
    home: Option<PathBuf>,
    workdir: Option<PathBuf>,
    include_well_known: bool,
    cached: RwLock<Option<BinaryInfo>>,
}

impl BinaryLocator {
    pub fn new(config: BinaryConfig) -> Self {
        Self {
            config,
            home: dirs::home_dir(),
            workdir: std::env::current_dir().ok(),
            include_well_known: true,
            cached: RwLock::new(None),
        }
    }

    /// Overrides the home directory used for `~/` expansion and the
    /// custom-command check.
    #[must_use]
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    /// Overrides the directory checked for project-level custom commands.
    #[must_use]
    pub fn with_workdir(mut self, workdir: Option<PathBuf>) -> Self {
        self.workdir = workdir;
        self
    }

    /// Restricts the search to `PATH` and the configured search paths.
    #[must_use]
    pub fn without_well_known(mut self) -> Self {
        self.include_well_known = false;
        self
    }

    /// Every existing, executable candidate in probe order, without duplicates.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        let mut push = |path: PathBuf| {
            if is_executable(&path) && !out.contains(&path) {
                out.push(path);
            }
        };

        if let Some(path) = self.config.path.as_deref().and_then(|raw| self.expand(raw)) {
            push(path);
        }

        for name in &self.config.names {
            if let Some(path) = resolve_on_path(name) {
                push(path);
            }
        }

        for raw in &self.config.search_paths {
            if let Some(path) = self.expand(raw) {
                push(path);
            }
        }

        if self.include_well_known {
            for raw in WELL_KNOWN_LOCATIONS {
                if let Some(path) = self.expand(raw) {
                    push(path);
                }
            }
        }

        out
    }

    /// Returns the cached binary, probing candidates on first use.
    pub async fn locate(&self) -> Result<BinaryInfo, NotFoundError> {
        if let Some(info) = self.cached.read().await.as_ref() {
            debug!(path = %info.path.display(), "Using cached binary");
            return Ok(info.clone());
        }

        let mut cached = self.cached.write().await;
        // Another caller may have probed while we waited for the lock
        if let Some(info) = cached.as_ref() {
            return Ok(info.clone());
        }

        let info = self.probe_candidates().await?;
        *cached = Some(info.clone());
        Ok(info)
    }

    /// Drops the cached result and probes again.
    pub async fn refresh(&self) -> Result<BinaryInfo, NotFoundError> {
        self.cached.write().await.take();
        self.locate().await
    }

    /// The cached result, if a probe already succeeded.
    pub async fn cached(&self) -> Option<BinaryInfo> {
        self.cached.read().await.clone()
    }

    async fn probe_candidates(&self) -> Result<BinaryInfo, NotFoundError> {
        let candidates = self.candidates();
        let timeout = self.config.probe_timeout();
        debug!(count = candidates.len(), "Probing CLI candidates");

        let mut checked = Vec::new();
        for path in candidates {
            checked.push(path.display().to_string());

            let Some(version) = probe_version(&path, timeout).await else {
                debug!(path = %path.display(), "Candidate failed version probe");
                continue;
            };

            let capabilities = Capabilities {
                structured_output: probe_structured_output(&path, timeout).await,
                custom_commands: self.has_custom_commands(),
            };

            info!(
                path = %path.display(),
                version = %version,
                structured_output = capabilities.structured_output,
                custom_commands = capabilities.custom_commands,
                "Located CLI binary"
            );
            return Ok(BinaryInfo::new(path, version).with_capabilities(capabilities));
        }

        debug!(checked = ?checked, "No usable CLI binary");
        Err(NotFoundError { checked })
    }

    fn expand(&self, raw: &str) -> Option<PathBuf> {
        match raw.strip_prefix("~/") {
            Some(rest) => self.home.as_ref().map(|home| home.join(rest)),
            None => Some(PathBuf::from(raw)),
        }
    }

    fn has_custom_commands(&self) -> bool {
        [self.workdir.as_ref(), self.home.as_ref()]
            .into_iter()
            .flatten()
            .any(|dir| dir.join(".claude").join("commands").is_dir())
    }
}

/// Resolves a bare name against `PATH`. Names containing a separator are
/// taken as paths.
fn resolve_on_path(name: &str) -> Option<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        return Some(PathBuf::from(name));
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Runs `<path> <arg>` and returns stdout if it exits 0 within `timeout`.
async fn run_probe(path: &Path, arg: &str, timeout: Duration) -> Option<String> {
    let output = Command::new(path)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => {
            debug!(path = %path.display(), arg, code = ?output.status.code(), "Probe exited non-zero");
            None
        }
        Ok(Err(e)) => {
            debug!(path = %path.display(), arg, error = %e, "Probe failed to spawn");
            None
        }
        Err(_) => {
            debug!(path = %path.display(), arg, "Probe timed out");
            None
        }
    }
}

async fn probe_version(path: &Path, timeout: Duration) -> Option<String> {
    let stdout = run_probe(path, "--version", timeout).await?;
    let version = stdout.lines().next().unwrap_or_default().trim();
    Some(if version.is_empty() {
        "unknown".to_string()
    } else {
        version.to_string()
    })
}

async fn probe_structured_output(path: &Path, timeout: Duration) -> bool {
    run_probe(path, "--help", timeout)
        .await
        .is_some_and(|help| help.contains("--output-format"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn locator_for(paths: Vec<String>, home: &Path) -> BinaryLocator {
        let config = BinaryConfig {
            path: None,
            names: Vec::new(),
            search_paths: paths,
            probe_timeout_ms: 5000,
            extra_args: Vec::new(),
        };
        BinaryLocator::new(config)
            .with_home(Some(home.to_path_buf()))
            .with_workdir(None)
            .without_well_known()
    }

    #[tokio::test]
    async fn test_first_working_candidate_wins() {
        let dir = TempDir::new().unwrap();
        let broken = write_script(dir.path(), "broken", "exit 3");
        let good = write_script(
            dir.path(),
            "good",
            r#"case "$1" in
  --version) echo "1.0.42 (Claude Code)" ;;
  --help) echo "  --output-format <format>  Output format" ;;
esac"#,
        );

        let locator = locator_for(
            vec![
                broken.display().to_string(),
                good.display().to_string(),
            ],
            dir.path(),
        );

        let info = locator.locate().await.unwrap();
        assert_eq!(info.path, good);
        assert_eq!(info.version, "1.0.42 (Claude Code)");
        assert!(info.capabilities.structured_output);
        assert!(!info.capabilities.custom_commands);
    }

    #[tokio::test]
    async fn test_not_found_lists_checked_candidates() {
        let dir = TempDir::new().unwrap();
        let broken = write_script(dir.path(), "broken", "exit 1");
        let missing = dir.path().join("missing");

        let locator = locator_for(
            vec![
                missing.display().to_string(),
                broken.display().to_string(),
            ],
            dir.path(),
        );

        let err = locator.locate().await.unwrap_err();
        assert_eq!(err.checked, vec![broken.display().to_string()]);
        assert!(err.to_string().contains("No usable CLI binary"));

        let bridge_err: BridgeError = err.into();
        assert_eq!(bridge_err.kind_name(), "not_found");
        assert!(!bridge_err.payload().message.contains("broken"));
    }

    #[tokio::test]
    async fn test_custom_commands_detected_from_home() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".claude").join("commands")).unwrap();
        let bin = write_script(dir.path(), "cli", r#"[ "$1" = "--version" ] && echo "2.0.0""#);

        let locator = locator_for(vec![bin.display().to_string()], dir.path());
        let info = locator.locate().await.unwrap();
        assert!(info.capabilities.custom_commands);
        assert!(!info.capabilities.structured_output);
    }

    #[tokio::test]
    async fn test_result_cached_until_refresh() {
        let dir = TempDir::new().unwrap();
        let bin = write_script(dir.path(), "cli", r#"[ "$1" = "--version" ] && echo "1.0.0""#);
        let locator = locator_for(vec![bin.display().to_string()], dir.path());

        assert_eq!(locator.locate().await.unwrap().version, "1.0.0");

        write_script(dir.path(), "cli", r#"[ "$1" = "--version" ] && echo "1.1.0""#);
        assert_eq!(locator.locate().await.unwrap().version, "1.0.0");
        assert_eq!(locator.refresh().await.unwrap().version, "1.1.0");
    }

    #[tokio::test]
    async fn test_explicit_path_probed_before_path_names() {
        let dir = TempDir::new().unwrap();
        let on_path = write_script(dir.path(), "claude", r#"[ "$1" = "--version" ] && echo "1.0.0""#);
        let explicit = write_script(dir.path(), "pinned", r#"[ "$1" = "--version" ] && echo "2.0.0""#);

        let config = BinaryConfig {
            path: Some("~/pinned".to_string()),
            names: vec![on_path.display().to_string()],
            ..BinaryConfig::default()
        };
        let locator = BinaryLocator::new(config)
            .with_home(Some(dir.path().to_path_buf()))
            .with_workdir(None)
            .without_well_known();

        assert_eq!(locator.candidates(), vec![explicit.clone(), on_path]);
        let info = locator.locate().await.unwrap();
        assert_eq!(info.path, explicit);
        assert_eq!(info.version, "2.0.0");
    }

    #[test]
    fn test_tilde_expansion_and_dedup() {
        let dir = TempDir::new().unwrap();
        let bin = write_script(dir.path(), "cli", "exit 0");
        let locator = locator_for(
            vec![
                "~/cli".to_string(),
                bin.display().to_string(),
            ],
            dir.path(),
        );
        assert_eq!(locator.candidates(), vec![bin]);
    }

    #[test]
    fn test_non_executable_file_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, "not a program").unwrap();
        let locator = locator_for(vec![path.display().to_string()], dir.path());
        assert!(locator.candidates().is_empty());
    }
}
