//! Failure taxonomy shared by every relaykit module.
//!
//! A [`Failure`] is an immutable description of something that went wrong. It carries
//! enough information for three different consumers:
//!
//! - the presentation layer, which looks at [`FailureHints::USER_FRIENDLY`] to decide whether
//!   the message can be shown verbatim;
//! - diagnostics, which route by [`Failure::module_code`] and [`Failure::error_code`];
//! - callers that need the numeric [`Failure::detail`], e.g. an HTTP status when
//!   [`FailureHints::DATA_IS_HTTP_CODE`] is set.
use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
};

use serde::{Deserialize, Serialize};

pub const CORE_MODULE_CODE: i64 = 100;
pub const NETWORK_MODULE_CODE: i64 = 300;

/// Bitset of hints attached to a [`Failure`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureHints(u32);

impl FailureHints {
    pub const NO_HINT: FailureHints = FailureHints(0);
    pub const USER_FRIENDLY: FailureHints = FailureHints(1);
    pub const DATA_IS_HTTP_CODE: FailureHints = FailureHints(1 << 1);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: FailureHints) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for FailureHints {
    type Output = FailureHints;

    fn bitor(self, rhs: Self) -> Self::Output {
        FailureHints(self.0 | rhs.0)
    }
}

impl BitOrAssign for FailureHints {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureLevel {
    Warning,
    #[default]
    Error,
    Critical,
}

/// Kinds of failures produced by the relaykit crates.
///
/// The numeric value is what ends up in [`Failure::error_code`]; service specific
/// processors are free to use other codes in their own module.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i64)]
pub enum ErrorKind {
    ServerError = 1,
    ServiceUnavailable = 2,
    InvalidReply = 3,
    InvalidUrl = 4,
    SslError = 5,
    Cancelled = 6,
}

impl ErrorKind {
    pub const fn code(self) -> i64 {
        self as i64
    }

    pub const fn from_code(code: i64) -> Option<ErrorKind> {
        match code {
            1 => Some(ErrorKind::ServerError),
            2 => Some(ErrorKind::ServiceUnavailable),
            3 => Some(ErrorKind::InvalidReply),
            4 => Some(ErrorKind::InvalidUrl),
            5 => Some(ErrorKind::SslError),
            6 => Some(ErrorKind::Cancelled),
            _ => None,
        }
    }

    /// Module the kind is reported under.
    pub const fn module_code(self) -> i64 {
        match self {
            ErrorKind::Cancelled => CORE_MODULE_CODE,
            _ => NETWORK_MODULE_CODE,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ServerError => "server error",
            ErrorKind::ServiceUnavailable => "service unavailable",
            ErrorKind::InvalidReply => "invalid reply",
            ErrorKind::InvalidUrl => "invalid url",
            ErrorKind::SslError => "ssl error",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct Failure {
    pub message: String,
    pub module_code: i64,
    pub error_code: i64,
    pub hints: FailureHints,
    pub detail: Option<i64>,
    pub level: FailureLevel,
}

impl Failure {
    pub fn new(message: impl Into<String>, module_code: i64, error_code: i64) -> Self {
        Failure {
            message: message.into(),
            module_code,
            error_code,
            hints: FailureHints::NO_HINT,
            detail: None,
            level: FailureLevel::Error,
        }
    }

    /// Failure of one of the well-known [`ErrorKind`]s, reported under the kind's module.
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(message, kind.module_code(), kind.code())
    }

    pub fn cancelled() -> Self {
        Self::of_kind(ErrorKind::Cancelled, "Cancelled")
    }

    #[must_use]
    pub fn with_hints(mut self, hints: FailureHints) -> Self {
        self.hints = hints;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: i64) -> Self {
        self.detail = Some(detail);
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: FailureLevel) -> Self {
        self.level = level;
        self
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_code(self.error_code)
            .filter(|kind| kind.module_code() == self.module_code)
    }

    pub fn is_user_friendly(&self) -> bool {
        self.hints.contains(FailureHints::USER_FRIENDLY)
    }

    /// HTTP status carried in [`Failure::detail`], if the hints say it is one.
    pub fn http_status(&self) -> Option<i64> {
        if self.hints.contains(FailureHints::DATA_IS_HTTP_CODE) {
            self.detail
        } else {
            None
        }
    }

    /// Message suitable for display: the failure's own text when it is user friendly,
    /// the given generic text otherwise.
    pub fn display_message<'a>(&'a self, generic: &'a str) -> &'a str {
        if self.is_user_friendly() {
            &self.message
        } else {
            generic
        }
    }
}
