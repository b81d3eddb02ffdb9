use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::types::GameId;

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("malformed record: {detail}")]
    MalformedRecord { detail: String },
    #[error("unknown field `{field}` in {record} record")]
    UnknownField { record: &'static str, field: String },
    #[error("field `{field}` differs between turns: expected {expected}, found {found}")]
    InvariantViolation {
        field: String,
        expected: String,
        found: String,
    },
    #[error("unknown action type `{0}`")]
    UnknownActionType(String),
    #[error("action at position {expected} declares index {found}")]
    OutOfOrderAction { expected: usize, found: i64 },
    #[error("missing referenced entity: {0}")]
    MissingReferencedEntity(String),
    #[error("corrupted container: {0}")]
    CorruptedContainer(String),
    #[error("{action} undone without a matching setup")]
    UndoWithoutSetup { action: &'static str },
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("JSON error")]
    Json(#[from] serde_json::Error),
}

/// Where parsing (or folding) stopped. Every field is filled in by the layer
/// that knows it, innermost first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParseLocation {
    pub match_id: Option<GameId>,
    pub turn: Option<usize>,
    pub action: Option<usize>,
}

impl ParseLocation {
    pub fn is_empty(&self) -> bool {
        self.match_id.is_none() && self.turn.is_none() && self.action.is_none()
    }
}

impl fmt::Display for ParseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if let Some(id) = self.match_id {
            parts.push(format!("match {id}"));
        }
        if let Some(turn) = self.turn {
            parts.push(format!("turn {turn}"));
        }
        if let Some(action) = self.action {
            parts.push(format!("action {action}"));
        }
        write!(f, "{}", parts.join(", "))
    }
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub location: ParseLocation,
}

impl Error {
    pub fn malformed(detail: impl Into<String>) -> Self {
        ErrorKind::MalformedRecord {
            detail: detail.into(),
        }
        .into()
    }

    pub fn missing(what: impl Into<String>) -> Self {
        ErrorKind::MissingReferencedEntity(what.into()).into()
    }

    pub fn corrupted(detail: impl Into<String>) -> Self {
        ErrorKind::CorruptedContainer(detail.into()).into()
    }

    pub fn invariant(
        field: impl Into<String>,
        expected: impl fmt::Debug,
        found: impl fmt::Debug,
    ) -> Self {
        ErrorKind::InvariantViolation {
            field: field.into(),
            expected: format!("{expected:?}"),
            found: format!("{found:?}"),
        }
        .into()
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn with_match(mut self, match_id: GameId) -> Self {
        self.location.match_id.get_or_insert(match_id);
        self
    }

    pub fn with_turn(mut self, turn: usize) -> Self {
        self.location.turn.get_or_insert(turn);
        self
    }

    pub fn with_action(mut self, action: usize) -> Self {
        self.location.action.get_or_insert(action);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.location.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} ({})", self.kind, self.location)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(e) => Some(e),
            ErrorKind::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            location: ParseLocation::default(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::Io(e).into()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        ErrorKind::Json(e).into()
    }
}

fn preview(input: &str) -> &str {
    let end = input
        .char_indices()
        .nth(24)
        .map(|(idx, _)| idx)
        .unwrap_or(input.len());
    &input[..end]
}

impl<'a> nom::error::ParseError<&'a str> for Error {
    fn from_error_kind(input: &'a str, kind: nom::error::ErrorKind) -> Self {
        if input.is_empty() {
            return Error::malformed(format!("{kind:?}: unexpected end of input"));
        }
        Error::malformed(format!("{kind:?} at {:?}", preview(input)))
    }

    fn append(_input: &'a str, _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

impl<'a, E: fmt::Display> nom::error::FromExternalError<&'a str, E> for Error {
    fn from_external_error(input: &'a str, _kind: nom::error::ErrorKind, e: E) -> Self {
        Error::malformed(format!("{e} at {:?}", preview(input)))
    }
}

pub type IResult<'a, T> = nom::IResult<&'a str, T, Error>;

pub type Result<T> = std::result::Result<T, Error>;
