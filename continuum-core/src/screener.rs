//! Static pre-execution screening of task scripts.
//!
//! Screening runs after a task is claimed and before anything touches the
//! sandbox, so a flagged script never consumes container resources. The
//! check is intentionally conservative: it must never fail, and anything it
//! cannot positively flag is treated as benign.

/// Classifies a script before execution.
///
/// Implementations must be pure and infallible; `true` means the script is
/// refused and its task moves to the `malicious` terminal state.
pub trait CodeScreener: Send + Sync + 'static {
    fn analyze(&self, script: &str) -> bool;
}

/// Deny-list screener matching literal substrings.
///
/// The default rule set flags obvious probes at the host and its metadata
/// surface. Operators with stricter policies construct one via [`new`] with
/// their own rules.
///
/// [`new`]: PatternScreener::new
#[derive(Debug, Clone)]
pub struct PatternScreener {
    rules: Vec<String>,
}

impl PatternScreener {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rules: rules.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_default_rules() -> Self {
        Self::new([
            "/var/run/docker.sock",
            "host.docker.internal",
            "gateway.docker.internal",
            "169.254.169.254",
            "/proc/1/root",
        ])
    }
}

impl Default for PatternScreener {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

impl CodeScreener for PatternScreener {
    fn analyze(&self, script: &str) -> bool {
        self.rules.iter().any(|rule| script.contains(rule))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
