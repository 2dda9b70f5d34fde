//! Fault classification for step failures.
//!
//! The default posture is conservative: an unrecognized failure aborts
//! the run. Known-benign conditions are carved out by substring match
//! against the stringified error. The seed list comes from observed tool
//! output and is expected to grow as the external tools evolve; it is
//! runtime-extensible rather than exhaustive.

use crate::errors::ProvisionError;

/// Outcome of classifying a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Abort the entire run with a non-zero process exit.
    Fatal,
    /// Log a warning and advance to the next step. The failed step's
    /// postconditions are not guaranteed to hold for later steps.
    NonFatal,
}

/// A step failure handed from the pipeline driver to the operator log.
#[derive(Debug)]
pub struct FailureRecord {
    pub step: String,
    pub message: String,
    pub classification: Classification,
}

impl FailureRecord {
    pub fn new(step: &str, error: &ProvisionError, classification: Classification) -> Self {
        Self {
            step: step.to_string(),
            message: error.to_string(),
            classification,
        }
    }
}

/// Matches failures against a list of known-benign message fragments.
pub struct FaultClassifier {
    benign_patterns: Vec<String>,
}

impl Default for FaultClassifier {
    fn default() -> Self {
        Self {
            benign_patterns: vec![
                // Secret store reports this on a re-run of its init stage.
                "already initialized".into(),
                // Transient service lookup failure during store bootstrap.
                "Could not find the requested service".into(),
                // Known harmless partial state from the stage runner.
                "command terminated with exit code 2".into(),
            ],
        }
    }
}

impl FaultClassifier {
    pub fn new(benign_patterns: Vec<String>) -> Self {
        Self { benign_patterns }
    }

    /// Register an additional benign condition.
    pub fn push_pattern(&mut self, pattern: impl Into<String>) {
        self.benign_patterns.push(pattern.into());
    }

    /// Any benign-pattern match is NonFatal; everything else is Fatal.
    pub fn classify(&self, error: &ProvisionError) -> Classification {
        let message = error.to_string();
        if self.benign_patterns.iter().any(|p| message.contains(p)) {
            Classification::NonFatal
        } else {
            Classification::Fatal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit_error(stderr: &str) -> ProvisionError {
        ProvisionError::NonZeroExit {
            code: Some(1),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn known_benign_message_is_non_fatal() {
        let classifier = FaultClassifier::default();
        let err = exit_error("Vault is already initialized");
        assert_eq!(classifier.classify(&err), Classification::NonFatal);
    }

    #[test]
    fn unknown_message_is_fatal() {
        let classifier = FaultClassifier::default();
        let err = exit_error("disk exploded");
        assert_eq!(classifier.classify(&err), Classification::Fatal);
    }

    #[test]
    fn patterns_are_extensible_at_runtime() {
        let mut classifier = FaultClassifier::default();
        let err = exit_error("interface wg0 already exists");
        assert_eq!(classifier.classify(&err), Classification::Fatal);

        classifier.push_pattern("already exists");
        assert_eq!(classifier.classify(&err), Classification::NonFatal);
    }
}
