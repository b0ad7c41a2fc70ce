/// Startup verification of the ufw installation
///
/// Runs once before the loop starts so that a missing or broken ufw is
/// reported as a configuration problem instead of as a failure every cycle.
use crate::core::rule::CaseFolding;
use crate::core::ufw::{PacketFilter, UfwFilter};
use std::path::Path;
use tracing::{info, warn};

/// Result of a verification operation
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub success: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Creates a successful verification result
    pub fn success() -> Self {
        Self {
            success: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Creates a failed verification result with errors
    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            warnings: Vec::new(),
            errors,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Checks that `path` is an executable regular file.
pub fn check_binary(path: &Path) -> Result<(), String> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| format!("ufw binary {} not usable: {e}", path.display()))?;
    if !metadata.is_file() {
        return Err(format!("ufw binary {} is not a file", path.display()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(format!("ufw binary {} is not executable", path.display()));
        }
    }

    Ok(())
}

/// Verifies that ufw is installed, runs, and produces a parseable status.
///
/// A missing or failing binary is an error. An inactive firewall is only a
/// warning: rules can still be managed, they just have no effect until ufw is
/// enabled.
pub async fn verify_ufw(filter: &UfwFilter) -> VerifyResult {
    if let Err(e) = check_binary(filter.binary()) {
        return VerifyResult::failure(vec![e]);
    }

    let version = match filter.version().await {
        Ok(version) => version,
        Err(e) => return VerifyResult::failure(vec![format!("`ufw version` failed: {e}")]),
    };
    info!(version = %version, "found ufw");

    match filter.list_rules(CaseFolding::Insensitive).await {
        Ok(rules) if rules.is_empty() => {
            warn!("ufw lists no owned allow rules (it may be inactive)");
            VerifyResult::success().with_warning("ufw lists no owned allow rules")
        }
        Ok(rules) => {
            info!(owned = rules.len(), "ufw status parsed");
            VerifyResult::success()
        }
        Err(e) => VerifyResult::failure(vec![format!("`ufw status` failed: {e}")]),
    }
}
