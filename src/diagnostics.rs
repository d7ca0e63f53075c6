//! Accumulating error/warning sink shared by every build phase.
//!
//! The first error recorded makes the run fatal: the builder checks
//! [`Diagnostics::has_error`] between phases and turns the remaining phases
//! into no-ops. Warnings are unbounded and surface after the build through
//! `CacheBuilder::warnings`. Per-input sub-sinks accumulate independently
//! (each input file and each parallel adjuster task gets its own) and are
//! merged into the top-level sink after the owning phase finishes.

use crate::errors::BuildError;

#[derive(Debug, Default)]
pub struct Diagnostics {
    prefix: String,
    verbose: bool,
    error: Option<BuildError>,
    warnings: Vec<String>,
}

impl Diagnostics {
    pub fn new(prefix: impl Into<String>, verbose: bool) -> Self {
        Diagnostics {
            prefix: prefix.into(),
            verbose,
            error: None,
            warnings: Vec::new(),
        }
    }

    /// Record a fatal error. Only the first one sticks; later errors from
    /// already-running work are dropped.
    pub fn error(&mut self, err: BuildError) {
        if self.error.is_none() {
            log::error!("{}{}", self.prefix, err);
            self.error = Some(err);
        }
    }

    pub fn warning(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        log::warn!("{}{}", self.prefix, msg);
        self.warnings.push(msg);
    }

    /// Chatter that is only interesting when the caller asked for it.
    pub fn verbose(&self, msg: impl AsRef<str>) {
        if self.verbose {
            log::debug!("{}{}", self.prefix, msg.as_ref());
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_ref(&self) -> Option<&BuildError> {
        self.error.as_ref()
    }

    /// Empty string on success, the first recorded error otherwise.
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(err) => err.to_string(),
            None => String::new(),
        }
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Fold a sub-sink into this one: warnings are appended, and the
    /// sub-sink's error (if any) becomes this sink's error unless one is
    /// already recorded.
    pub fn merge(&mut self, other: Diagnostics) {
        self.warnings.extend(other.warnings);
        if let Some(err) = other.error {
            self.error(err);
        }
    }
}
