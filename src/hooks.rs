// src/hooks.rs

//! Package instruction scripts
//!
//! A package archive may carry an `instructions.sh` next to its payload. It
//! is unpacked to `<package>/.nest/instructions.sh` and may define any of the
//! shell functions `before_install`, `after_install`, `before_remove` and
//! `after_remove`. The executor calls them around moving the package
//! directory in or out of the installed root; a missing script or function
//! is not an error.
//!
//! Hooks run through `sh` with the installed root as working directory and
//! these variables set:
//!
//! - `NEST_PACKAGE`: the package ID, `name#version`
//! - `NEST_PACKAGE_DIR`: the directory holding the package files right now
//! - `NEST_INSTALLED`: the installed root

use crate::error::{Error, Result};
use crate::packages::PackageId;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Name of the script inside a package archive
pub const INSTRUCTIONS_NAME: &str = "instructions.sh";

/// Where the script is kept, relative to the package directory
pub const INSTRUCTIONS_PATH: &str = ".nest/instructions.sh";

/// Sources the script, then calls the hook function if it defines one
const HOOK_SHIM: &str = r#". "$1" || exit 1
if command -v "$2" >/dev/null 2>&1; then "$2"; fi"#;

/// The points in a package's lifetime a script can act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Payload unpacked, not yet in the installed root
    BeforeInstall,
    /// Package directory in place
    AfterInstall,
    /// Package directory still in place
    BeforeRemove,
    /// Package directory moved out of the installed root
    AfterRemove,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::BeforeInstall => "before_install",
            Hook::AfterInstall => "after_install",
            Hook::BeforeRemove => "before_remove",
            Hook::AfterRemove => "after_remove",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The script of the package whose files are in `package_dir`
pub fn instructions_path(package_dir: &Path) -> PathBuf {
    package_dir.join(INSTRUCTIONS_PATH)
}

/// Run `hook` of `package` if its script defines it
pub fn run(hook: Hook, package: &PackageId, package_dir: &Path, installed: &Path) -> Result<()> {
    let script = instructions_path(package_dir);
    if !script.is_file() {
        return Ok(());
    }

    debug!("Running {} of {}", hook, package);
    let output = Command::new("sh")
        .arg("-c")
        .arg(HOOK_SHIM)
        .arg("nest-hook")
        .arg(&script)
        .arg(hook.as_str())
        .current_dir(installed)
        .env("NEST_PACKAGE", package.to_string())
        .env("NEST_PACKAGE_DIR", package_dir)
        .env("NEST_INSTALLED", installed)
        .output()
        .map_err(|e| Error::HookFailed {
            package: package.clone(),
            hook: hook.to_string(),
            reason: format!("failed to start sh: {}", e),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        info!("[{} {}] {}", package, hook, line);
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::HookFailed {
            package: package.clone(),
            hook: hook.to_string(),
            reason: match output.status.code() {
                Some(code) => format!("exited with status {}: {}", code, stderr.trim()),
                None => format!("killed by a signal: {}", stderr.trim()),
            },
        });
    }
    Ok(())
}
