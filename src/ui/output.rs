//! ui::output
//!
//! Output mode selection and plain command messages.
//!
//! # Design
//!
//! Operation progress goes through a [`View`]; this module picks which
//! view a command gets and prints errors that happen before an operation
//! starts.

use std::fmt::Display;
use std::sync::Arc;

use super::human::HumanView;
use super::json::JsonView;
use super::view::View;

/// Output verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Quiet mode - minimal output
    Quiet,
    /// Normal mode - standard output
    Normal,
    /// Debug mode - verbose output
    Debug,
}

impl Verbosity {
    /// Create verbosity from flags.
    pub fn from_flags(quiet: bool, debug: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if debug {
            Verbosity::Debug
        } else {
            Verbosity::Normal
        }
    }
}

/// Build the view for a command.
pub fn make_view(json: bool, verbosity: Verbosity) -> Arc<dyn View> {
    if json {
        Arc::new(JsonView::new())
    } else {
        Arc::new(HumanView::new(verbosity))
    }
}

/// Print an error message (always shown).
pub fn error(message: impl Display) {
    eprintln!("error: {}", message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_wins_over_debug() {
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Debug);
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
    }
}
