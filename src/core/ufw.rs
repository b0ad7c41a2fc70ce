//! ufw adapter
//!
//! The engine talks to the packet filter only through [`PacketFilter`]. The
//! production implementation, [`UfwFilter`], shells out to the ufw binary
//! (optionally through an elevation helper) and parses `ufw status` output.
//!
//! # Owned rules
//!
//! Only IPv4 allow rules matching the status grammar below are owned by the
//! agent. Everything else (deny/reject rules, `(v6)` twins, outbound and
//! forward rules, application profiles, interface-bound rules) is left alone
//! and never appears in the current [`RuleSet`].
//!
//! ```text
//! Status: active
//!
//! To                         Action      From
//! --                         ------      ----
//! 22/tcp                     ALLOW       Anywhere
//! 6000:6007/udp              ALLOW IN    10.0.0.0/8        # media
//! 53                         ALLOW       192.168.1.1
//! Anywhere                   ALLOW       203.0.113.7
//! 22/tcp (v6)                ALLOW       Anywhere (v6)
//! ```

use crate::core::error::{Error, Result};
use crate::core::rule::{ANY, CanonicalRule, CaseFolding, RuleSet, UNRESTRICTED, normalize};
use crate::elevation::{ElevationMethod, create_elevated_command, describe};
use regex::Regex;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Boxed future returned by the dyn-compatible filter and source traits
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a single add or remove actually did to the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// The rule table changed
    Changed,
    /// ufw reported the rule as already present (add) or already gone (remove)
    Unchanged,
}

/// The narrow interface the engine needs from a packet filter
pub trait PacketFilter: Send + Sync {
    /// Probes the filter and returns the owned allow rules.
    fn list_rules<'a>(&'a self, folding: CaseFolding) -> BoxFuture<'a, Result<RuleSet>>;

    fn add_rule<'a>(&'a self, rule: &'a CanonicalRule) -> BoxFuture<'a, Result<Mutation>>;

    fn remove_rule<'a>(&'a self, rule: &'a CanonicalRule) -> BoxFuture<'a, Result<Mutation>>;

    /// Makes pending changes effective (`ufw reload`).
    fn commit<'a>(&'a self) -> BoxFuture<'a, Result<()>>;
}

/// Owned-rule line grammar. The To column is a port, a port range or list,
/// or `Anywhere`, each optionally with a protocol.
static STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<to>(?:Anywhere|[0-9][0-9:,]*)(?:/[a-z0-9]+)?)\s+ALLOW(?:\s+IN)?\s+(?P<from>\S+)(?:\s+#.*)?$",
    )
    .expect("status line grammar is a valid regex")
});

/// Parses `ufw status` output into the set of owned rules.
///
/// # Errors
///
/// Returns [`Error::Parse`] when the output carries no `Status:` line, which
/// means ufw printed something other than a rule listing.
pub fn parse_status(output: &str, folding: CaseFolding) -> Result<RuleSet> {
    let status = output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("Status:"))
        .map(str::trim)
        .ok_or_else(|| Error::parse("ufw status", "no `Status:` line in probe output", output))?;

    if status.eq_ignore_ascii_case("inactive") {
        warn!("ufw is inactive; treating the owned rule set as empty");
        return Ok(RuleSet::empty(folding));
    }

    let rules = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.contains("(v6)"))
        .filter_map(|line| STATUS_LINE.captures(line))
        .map(|caps| {
            let (port, protocol) = split_to_column(&caps["to"]);
            normalize(&caps["from"], protocol, port)
        });

    Ok(RuleSet::from_rules(rules, folding))
}

/// Splits the To column into `(port, protocol)`; missing parts become empty
/// and are defaulted by the normalizer.
fn split_to_column(to: &str) -> (&str, &str) {
    let (port, protocol) = to.split_once('/').unwrap_or((to, ""));
    if port == UNRESTRICTED {
        ("", protocol)
    } else {
        (port, protocol)
    }
}

/// ufw only understands the lower-case keyword.
fn source_arg(rule: &CanonicalRule) -> &str {
    if rule.is_any_source() {
        ANY
    } else {
        rule.from.as_str()
    }
}

/// Arguments for `ufw allow`.
pub fn add_args(rule: &CanonicalRule) -> Vec<&str> {
    let mut args = vec!["allow"];
    if !rule.is_any_protocol() {
        args.extend(["proto", rule.protocol.as_str()]);
    }
    args.extend(["from", source_arg(rule), "to", ANY]);
    if !rule.is_any_port() {
        args.extend(["port", rule.port.as_str()]);
    }
    args
}

/// Arguments for `ufw delete allow`.
pub fn remove_args(rule: &CanonicalRule) -> Vec<&str> {
    let mut args = vec!["delete", "allow", "from", source_arg(rule), "to", ANY];
    if !rule.is_any_port() {
        args.extend(["port", rule.port.as_str()]);
    }
    if !rule.is_any_protocol() {
        args.extend(["proto", rule.protocol.as_str()]);
    }
    args
}

/// Whether ufw would resolve both rules to the same table entry.
pub fn same_table_entry(a: &CanonicalRule, b: &CanonicalRule) -> bool {
    let a = normalize(&a.from, &a.protocol, &a.port);
    let b = normalize(&b.from, &b.protocol, &b.port);
    remove_args(&a) == remove_args(&b)
}

/// Cleans ufw error output into one message per line.
pub fn parse_ufw_errors(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.trim_start_matches("ERROR: ")
                .trim_start_matches("WARN: ")
                .to_string()
        })
        .collect()
}

/// [`PacketFilter`] backed by the ufw command-line tool
#[derive(Debug, Clone)]
pub struct UfwFilter {
    binary: PathBuf,
    elevation: ElevationMethod,
}

impl UfwFilter {
    pub fn new(binary: impl Into<PathBuf>, elevation: ElevationMethod) -> Self {
        Self {
            binary: binary.into(),
            elevation,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs ufw and returns its stdout.
    ///
    /// Read-only invocations are killed if the caller stops waiting (shutdown
    /// during a probe). Mutating invocations always run to completion.
    async fn run(&self, args: &[&str], read_only: bool) -> Result<String> {
        let command = describe(&self.binary, args);
        debug!(command = %command, "running ufw");

        let output = create_elevated_command(self.elevation, &self.binary, args)?
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(read_only)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: command.clone(),
                message: format!("failed to spawn: {e}"),
                exit_code: None,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut errors = parse_ufw_errors(&stderr);
        if errors.is_empty() {
            errors = parse_ufw_errors(&stdout);
        }
        Err(Error::Command {
            command,
            message: errors.join("; "),
            exit_code: output.status.code(),
        })
    }

    /// Runs `ufw version`, used as a startup smoke test.
    pub async fn version(&self) -> Result<String> {
        let out = self.run(&["version"], true).await?;
        Ok(out.lines().next().unwrap_or_default().trim().to_string())
    }
}

impl PacketFilter for UfwFilter {
    fn list_rules<'a>(&'a self, folding: CaseFolding) -> BoxFuture<'a, Result<RuleSet>> {
        Box::pin(async move {
            let output = self.run(&["status"], true).await?;
            parse_status(&output, folding)
        })
    }

    fn add_rule<'a>(&'a self, rule: &'a CanonicalRule) -> BoxFuture<'a, Result<Mutation>> {
        Box::pin(async move {
            let output = self.run(&add_args(rule), false).await?;
            if output.contains("Skipping adding existing rule") {
                Ok(Mutation::Unchanged)
            } else {
                Ok(Mutation::Changed)
            }
        })
    }

    fn remove_rule<'a>(&'a self, rule: &'a CanonicalRule) -> BoxFuture<'a, Result<Mutation>> {
        Box::pin(async move {
            let output = self.run(&remove_args(rule), false).await?;
            if output.contains("Could not delete non-existent rule") {
                Ok(Mutation::Unchanged)
            } else {
                Ok(Mutation::Changed)
            }
        })
    }

    fn commit<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.run(&["reload"], false).await?;
            Ok(())
        })
    }
}
