use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Expected per-page failure states. Each one ends processing of the page it
/// was raised for; the batch always moves on to the next title.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("malformed template markup on {title} at byte {offset}: {detail}")]
    ParseFailure {
        title: String,
        offset: usize,
        detail: String,
    },
    #[error("page does not exist: {0}")]
    NotFound(String),
    #[error("page is a redirect: {0}")]
    RedirectPage(String),
    #[error("page is protected against edits: {0}")]
    LockedPage(String),
}

impl PageError {
    pub fn parse_failure(offset: usize, detail: impl Into<String>) -> Self {
        Self::ParseFailure {
            title: String::new(),
            offset,
            detail: detail.into(),
        }
    }

    /// Attach the page title to a parse failure raised by a title-agnostic scanner.
    pub fn for_title(self, page_title: &str) -> Self {
        match self {
            Self::ParseFailure { offset, detail, .. } => Self::ParseFailure {
                title: page_title.to_string(),
                offset,
                detail,
            },
            other => other,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::ParseFailure { .. } => "parse_failure",
            Self::NotFound(_) => "not_found",
            Self::RedirectPage(_) => "redirect",
            Self::LockedPage(_) => "locked",
        }
    }
}

/// A mismatch the engine detected but will not resolve on its own.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReconciliationWarning {
    pub title: String,
    pub check: String,
    pub message: String,
}

impl ReconciliationWarning {
    pub fn new(title: &str, check: &str, message: impl Into<String>) -> Self {
        Self {
            title: title.to_string(),
            check: check.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ReconciliationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.check, self.title, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::{PageError, ReconciliationWarning};

    #[test]
    fn parse_failure_picks_up_title() {
        let error = PageError::parse_failure(12, "unclosed `{{`").for_title("Iron Pipe");
        assert_eq!(
            error.to_string(),
            "malformed template markup on Iron Pipe at byte 12: unclosed `{{`"
        );
        assert_eq!(error.reason(), "parse_failure");
    }

    #[test]
    fn page_errors_survive_anyhow_round_trip() {
        let wrapped = anyhow::Error::new(PageError::LockedPage("Main Page".to_string()));
        let recovered = wrapped.downcast_ref::<PageError>().expect("page error");
        assert_eq!(recovered.reason(), "locked");
    }

    #[test]
    fn warning_display_names_check() {
        let warning = ReconciliationWarning::new("Vinnie", "lieutenant_rank", "rank 3 vs 4");
        assert_eq!(warning.to_string(), "[lieutenant_rank] Vinnie: rank 3 vs 4");
    }
}
