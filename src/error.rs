//! Fatal error taxonomy
//!
//! Only conditions that block the run before any mutation live here.
//! Non-blocking conditions (a patch target that is absent, a reinstall that
//! fails, mixed channels left behind) are warnings carried in the run
//! summary and never become errors.

use thiserror::Error;

/// A condition that stops the run before any filesystem mutation.
#[derive(Debug, Error)]
pub enum Fatal {
    /// The version oracle could not classify the host at all.
    #[error("could not determine the installed release: {reason}")]
    Probe { reason: String },

    /// The probed generation is outside the supported migration pair.
    #[error("installed release {major}.{minor} is neither the supported source nor target")]
    Unsupported { major: u32, minor: u32 },

    /// Pre-flight validation reported blocking findings.
    #[error("pre-flight validation reported {count} blocking finding(s)")]
    Preflight { count: usize },

    /// The pre-flight checker itself could not run (missing tool).
    #[error("pre-flight validation could not run: {reason}")]
    PreflightUnavailable { reason: String },
}

impl Fatal {
    /// Process exit code for this condition.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Probe { .. } => 1,
            Self::Unsupported { .. } => 2,
            Self::Preflight { .. } | Self::PreflightUnavailable { .. } => 3,
        }
    }

    /// Operator-facing remediation text.
    pub fn remediation(&self) -> String {
        match self {
            Self::Probe { .. } => {
                "Ensure this host runs the expected platform and the version tool is installed."
                    .to_string()
            }
            Self::Unsupported { major, .. } => format!(
                "This tool only migrates one major release step; release {major} needs a different upgrade path."
            ),
            Self::Preflight { .. } => {
                "Resolve every FAIL reported by the pre-flight checker, then re-run.".to_string()
            }
            Self::PreflightUnavailable { .. } => {
                "Install the platform's upgrade checklist tool, then re-run.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_and_nonzero() {
        let errs = [
            Fatal::Probe { reason: "x".into() },
            Fatal::Unsupported { major: 7, minor: 4 },
            Fatal::Preflight { count: 2 },
        ];
        let codes: Vec<i32> = errs.iter().map(Fatal::exit_code).collect();
        assert!(codes.iter().all(|c| *c != 0));
        let mut unique = codes.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn test_unsupported_names_the_release() {
        let msg = Fatal::Unsupported { major: 7, minor: 4 }.to_string();
        assert!(msg.contains("7.4"));
    }
}
