//! Error taxonomy.
//!
//! Every fallible entry point returns [`Error`]. The variant tells the caller
//! which stage failed: grammar source parsing, JSON syntax, JSON Schema
//! synthesis, structural-tag synthesis, or deserialization of a stored
//! artifact (version vs. payload shape).

use thiserror::Error;

/// Errors produced by grammar construction, compilation and deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed EBNF or regex source.
    #[error("{0}")]
    Parse(String),
    /// The input is not syntactically valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// The JSON is valid but the schema cannot be turned into a grammar.
    #[error("invalid JSON schema: {0}")]
    InvalidJsonSchema(String),
    /// The JSON is valid but does not describe a structural tag.
    #[error("invalid structural tag: {0}")]
    InvalidStructuralTag(String),
    /// A serialized artifact was produced by an incompatible format version.
    #[error("deserialize version error: expected {expected}, found {found}")]
    DeserializeVersion { expected: String, found: String },
    /// A serialized artifact has the right version but a corrupt payload.
    #[error("deserialize format error: {0}")]
    DeserializeFormat(String),
    /// Precondition failures such as an empty grammar list.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Fieldless discriminant of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    InvalidJson,
    InvalidJsonSchema,
    InvalidStructuralTag,
    DeserializeVersion,
    DeserializeFormat,
    Runtime,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Parse(_) => ErrorKind::Parse,
            Error::InvalidJson(_) => ErrorKind::InvalidJson,
            Error::InvalidJsonSchema(_) => ErrorKind::InvalidJsonSchema,
            Error::InvalidStructuralTag(_) => ErrorKind::InvalidStructuralTag,
            Error::DeserializeVersion { .. } => ErrorKind::DeserializeVersion,
            Error::DeserializeFormat(_) => ErrorKind::DeserializeFormat,
            Error::Runtime(_) => ErrorKind::Runtime,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Early-return with an error of the given kind, `anyhow::bail!` style.
///
/// ```ignore
/// bail!(Parse, "unexpected character at position {}", pos);
/// ```
macro_rules! bail {
    ($kind:ident, $($arg:tt)*) => {
        return Err($crate::error::Error::$kind(format!($($arg)*)))
    };
}

/// Build an error of the given kind without returning.
macro_rules! err {
    ($kind:ident, $($arg:tt)*) => {
        $crate::error::Error::$kind(format!($($arg)*))
    };
}

pub(crate) use bail;
pub(crate) use err;

#[cfg(test)]
mod tests {
    use super::*;

    fn fails_with_parse() -> Result<()> {
        bail!(Parse, "bad token at {}", 3);
    }

    #[test]
    fn test_bail_macro_kind() {
        let e = fails_with_parse().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Parse);
        assert_eq!(e.to_string(), "bad token at 3");
    }

    #[test]
    fn test_version_error_message() {
        let e = Error::DeserializeVersion {
            expected: "v1".into(),
            found: "v0".into(),
        };
        assert_eq!(e.kind(), ErrorKind::DeserializeVersion);
        assert!(e.to_string().contains("expected v1"));
    }
}
