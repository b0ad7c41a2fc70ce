use thiserror::Error;

/// Maximum number of bytes of a raw payload kept in error messages.
pub const EXCERPT_LEN: usize = 256;

/// Core error types for fwsync
#[derive(Debug, Error)]
pub enum Error {
    /// The desired-state source was unreachable or answered with a non-success status
    #[error("fetch error from {endpoint}: {message}")]
    Fetch {
        endpoint: String,
        message: String,
        status: Option<u16>,
    },

    /// A desired-state document or probe output could not be parsed
    #[error("parse error in {origin}: {message} (payload: {excerpt:?})")]
    Parse {
        origin: &'static str,
        message: String,
        excerpt: String,
    },

    /// A single ufw invocation exited non-zero
    #[error("ufw command `{command}` failed: {message}")]
    Command {
        command: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// The reload at the end of a cycle failed; already applied mutations stay in place
    #[error("commit failed after {applied} applied change(s): {source}")]
    Commit {
        applied: usize,
        #[source]
        source: Box<Error>,
    },

    /// Shutdown was requested while the operation was in flight
    #[error("operation cancelled by shutdown request")]
    Cancelled,

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Privilege escalation failed
    #[error("elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Internal logic error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds a parse error keeping at most [`EXCERPT_LEN`] bytes of the payload.
    pub fn parse(origin: &'static str, message: impl Into<String>, payload: &str) -> Self {
        Self::Parse {
            origin,
            message: message.into(),
            excerpt: excerpt(payload),
        }
    }

    /// Whether the error aborted the cycle before any rule was touched.
    pub fn is_pre_apply(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. } | Self::Parse { .. } | Self::Cancelled
        )
    }
}

/// Truncates a payload on a character boundary for logging.
pub fn excerpt(payload: &str) -> String {
    let trimmed = payload.trim();
    if trimmed.len() <= EXCERPT_LEN {
        return trimmed.to_string();
    }
    let end = trimmed
        .char_indices()
        .map(|(idx, _)| idx)
        .take_while(|&idx| idx <= EXCERPT_LEN)
        .last()
        .unwrap_or(0);
    format!("{}...", &trimmed[..end])
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of ufw error patterns and their translations
pub struct UfwErrorPattern;

impl UfwErrorPattern {
    /// Matches ufw output against known patterns and returns an operator-facing hint.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("you need to be root") || lower.contains("permission denied") {
            return ErrorTranslation::new("ufw requires root privileges")
                .with_suggestion("Run the agent as root, or set firewall.elevation to sudo")
                .with_suggestion("If using sudo, allow passwordless execution of the ufw binary");
        }

        if lower.contains("sudo:") && lower.contains("password") {
            return ErrorTranslation::new("sudo asked for a password")
                .with_suggestion("Add a NOPASSWD sudoers entry for the ufw binary")
                .with_suggestion("Or run the agent as root with firewall.elevation: none");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("ufw is not installed or not found at the configured path")
                .with_suggestion("Install ufw: apt install ufw")
                .with_suggestion("Or point firewall.ufw_binary at the correct path");
        }

        if lower.contains("could not delete non-existent rule") {
            return ErrorTranslation::new("Rule was already gone when the delete ran")
                .with_suggestion("Another process may have edited the firewall during the cycle");
        }

        if lower.contains("skipping adding existing rule") {
            return ErrorTranslation::new("Rule already present in ufw")
                .with_suggestion("The status probe and the firewall disagree; check for (v6)-only rules");
        }

        if lower.contains("bad port") || lower.contains("invalid port") {
            return ErrorTranslation::new("Invalid port or port range")
                .with_suggestion("Ports must be between 1 and 65535")
                .with_suggestion("Ranges use a colon and need a protocol: 6000:6007/tcp");
        }

        if lower.contains("bad source address") || lower.contains("invalid address") {
            return ErrorTranslation::new("Invalid source address")
                .with_suggestion("Use an address or CIDR: 203.0.113.7 or 203.0.113.0/24");
        }

        if lower.contains("invalid syntax") || lower.contains("wrong number of arguments") {
            return ErrorTranslation::new("ufw rejected the rule syntax")
                .with_suggestion("Check the protocol and port combination sent by the control plane");
        }

        if lower.contains("lock") && lower.contains("xtables") {
            return ErrorTranslation::new("Firewall tables are locked by another process")
                .with_suggestion("The next cycle will retry automatically");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check `ufw status verbose` on the host")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
