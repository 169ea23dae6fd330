//! Package-runner command construction
//!
//! Translates `(ecosystem, parsed package, extra args)` into a concrete
//! program + argv. The runner binaries are located with an explicit `PATH`
//! walk; a missing runner surfaces as `RUNTIME_NOT_AVAILABLE` before any
//! spawn is attempted.

use std::path::PathBuf;
use tracing::debug;

use crate::error::{Error, Result};
use crate::resolver::Ecosystem;
use crate::validate::ParsedPackage;

/// Node package runner binary
pub const NODE_RUNNER: &str = "npx";
/// Python package runner binary
pub const PYTHON_RUNNER: &str = "pipx";

/// A fully resolved command ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Absolute path of the runner binary
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Walk `PATH` for the ecosystem's package runner.
pub fn locate_runtime(ecosystem: Ecosystem) -> Result<PathBuf> {
    let command = runner_name(ecosystem);
    which::which(command).map_err(|_| Error::RuntimeNotAvailable {
        command: command.to_string(),
        ecosystem,
    })
}

pub fn runner_name(ecosystem: Ecosystem) -> &'static str {
    match ecosystem {
        Ecosystem::Node => NODE_RUNNER,
        Ecosystem::Python => PYTHON_RUNNER,
    }
}

/// Build the spawn command for a package.
///
/// Node: `npx --yes <name>[@version] [extra args…]`
/// Python: `pipx run <name>[==version] [extra args…]`
pub fn build_command(
    ecosystem: Ecosystem,
    parsed: &ParsedPackage,
    extra_args: &[String],
) -> Result<CommandSpec> {
    let program = locate_runtime(ecosystem)?;
    let mut args = runner_args(ecosystem, parsed);
    args.extend(extra_args.iter().cloned());

    debug!(program = %program.display(), ?args, "built runner command");
    Ok(CommandSpec { program, args })
}

/// Runner argv without the extra arguments; pure so it unit-tests without
/// any runner on `PATH`.
pub fn runner_args(ecosystem: Ecosystem, parsed: &ParsedPackage) -> Vec<String> {
    match ecosystem {
        Ecosystem::Node => {
            let token = if parsed.is_pinned() {
                format!("{}@{}", parsed.full_name, parsed.version)
            } else {
                parsed.full_name.clone()
            };
            vec!["--yes".to_string(), token]
        },
        Ecosystem::Python => {
            let token = if parsed.is_pinned() {
                format!("{}=={}", parsed.full_name, parsed.version)
            } else {
                parsed.full_name.clone()
            };
            vec!["run".to_string(), token]
        },
    }
}
