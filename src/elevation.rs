//! Privilege elevation for ufw invocations
//!
//! ufw refuses to run without root. The agent is normally started as root by
//! the service manager, in which case commands run directly. When it is not,
//! commands are wrapped in an elevation helper.
//!
//! # Elevation Strategy
//!
//! - **auto** (default): run directly as root, otherwise prefix with `sudo`
//! - **none**: always run directly (containers, tests, capabilities set up elsewhere)
//! - **sudo** / **run0**: always use that helper
//!
//! # Environment Variables
//!
//! - `FWSYNC_ELEVATION_METHOD`: overrides `firewall.elevation` from the config file.
//!
//! # Security
//!
//! - Only the configured ufw binary is ever elevated
//! - Commands are constructed without shell interpolation
//! - Helper binaries are checked for availability before use

use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use tokio::process::Command;

/// Environment override for the elevation method.
pub const ELEVATION_ENV: &str = "FWSYNC_ELEVATION_METHOD";

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `FWSYNC_ELEVATION_METHOD`
    #[error("invalid FWSYNC_ELEVATION_METHOD '{0}'. Valid options: auto, none, sudo, run0")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How ufw commands obtain root privileges
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ElevationMethod {
    #[default]
    Auto,
    None,
    Sudo,
    Run0,
}

impl ElevationMethod {
    /// Resolves the configured method, letting `FWSYNC_ELEVATION_METHOD` win.
    pub fn resolve(configured: Self) -> Result<Self, ElevationError> {
        match std::env::var(ELEVATION_ENV) {
            Ok(value) if !value.trim().is_empty() => value
                .trim()
                .parse()
                .map_err(|_| ElevationError::InvalidMethod(value)),
            _ => Ok(configured),
        }
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrapped(helper: &str, program: &Path, args: &[&str]) -> Result<Command, ElevationError> {
    if !binary_exists(helper) {
        return Err(ElevationError::MethodNotAvailable(helper.into()));
    }
    let mut cmd = Command::new(helper);
    cmd.arg(program).args(args);
    Ok(cmd)
}

fn direct(program: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Builds a ufw command with the requested elevation.
///
/// Arguments are passed to the program as-is; callers validate rule fields
/// before they reach this point (see [`crate::validators`]).
pub fn create_elevated_command(
    method: ElevationMethod,
    program: &Path,
    args: &[&str],
) -> Result<Command, ElevationError> {
    let mut cmd = match method {
        ElevationMethod::None => direct(program, args),
        ElevationMethod::Sudo => wrapped("sudo", program, args)?,
        ElevationMethod::Run0 => wrapped("run0", program, args)?,
        ElevationMethod::Auto => {
            if nix::unistd::getuid().is_root() {
                direct(program, args)
            } else {
                if !binary_exists("sudo") {
                    return Err(ElevationError::MethodNotAvailable("sudo".into()));
                }
                // -n: fail instead of hanging on a password prompt
                let mut cmd = Command::new("sudo");
                cmd.arg("-n").arg(program).args(args);
                cmd
            }
        }
    };
    cmd.stdin(std::process::Stdio::null());
    Ok(cmd)
}

/// Renders a command line for logs.
pub fn describe(program: &Path, args: &[&str]) -> String {
    std::iter::once(program.as_os_str())
        .chain(args.iter().map(OsStr::new))
        .map(|s| s.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
