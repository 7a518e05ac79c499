//! Command-line construction for the located CLI.

use bridge_proto::BinaryInfo;
use std::path::PathBuf;

/// Output format requested from a headless invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Plain text.
    #[default]
    Text,
    /// One JSON object per line (`--output-format json`).
    Json,
}

/// A program plus its arguments, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CliInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Builds invocations for one probed binary.
#[derive(Debug, Clone)]
pub struct CliBackend {
    binary: BinaryInfo,
    extra_args: Vec<String>,
}

impl CliBackend {
    pub fn new(binary: BinaryInfo, extra_args: Vec<String>) -> Self {
        Self { binary, extra_args }
    }

    pub fn binary(&self) -> &BinaryInfo {
        &self.binary
    }

    /// Structured output unless the binary lacks it or the caller asked
    /// for text.
    pub fn output_format(&self, wants_text: bool) -> OutputFormat {
        if self.binary.capabilities.structured_output && !wants_text {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }

    /// `<binary> [extra_args] -p <command> [--output-format json]`
    pub fn headless(&self, command: &str, format: OutputFormat) -> CliInvocation {
        let mut args = self.extra_args.clone();
        args.push("-p".to_string());
        args.push(command.to_string());
        if format == OutputFormat::Json {
            args.push("--output-format".to_string());
            args.push("json".to_string());
        }

        tracing::debug!(
            program = %self.binary.path.display(),
            args_count = args.len(),
            command_len = command.len(),
            structured = format == OutputFormat::Json,
            "Built headless invocation"
        );
        tracing::trace!(command = %command, "Full command text");

        CliInvocation {
            program: self.binary.path.clone(),
            args,
        }
    }

    /// The interactive program: no prompt flag, commands arrive on the PTY.
    pub fn interactive(&self) -> CliInvocation {
        CliInvocation {
            program: self.binary.path.clone(),
            args: self.extra_args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_proto::Capabilities;

    fn backend(structured: bool) -> CliBackend {
        let info = BinaryInfo::new("/usr/local/bin/claude", "1.0.0").with_capabilities(Capabilities {
            structured_output: structured,
            custom_commands: false,
        });
        CliBackend::new(info, vec!["--dangerously-skip-permissions".to_string()])
    }

    #[test]
    fn test_headless_structured() {
        let backend = backend(true);
        let format = backend.output_format(false);
        assert_eq!(format, OutputFormat::Json);

        let inv = backend.headless("status", format);
        assert_eq!(inv.program, PathBuf::from("/usr/local/bin/claude"));
        assert_eq!(
            inv.args,
            vec![
                "--dangerously-skip-permissions",
                "-p",
                "status",
                "--output-format",
                "json"
            ]
        );
    }

    #[test]
    fn test_headless_text_when_unsupported_or_requested() {
        assert_eq!(backend(false).output_format(false), OutputFormat::Text);
        assert_eq!(backend(true).output_format(true), OutputFormat::Text);

        let inv = backend(false).headless("status", OutputFormat::Text);
        assert_eq!(inv.args, vec!["--dangerously-skip-permissions", "-p", "status"]);
    }

    #[test]
    fn test_interactive_has_no_prompt_flag() {
        let inv = backend(true).interactive();
        assert_eq!(inv.args, vec!["--dangerously-skip-permissions"]);
    }
}
