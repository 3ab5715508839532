use thiserror::Error;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SpanOutOfBounds,
    AnnotationIndexOutOfRange,
    SurrogateSplit,
    MalformedScheduledTag,
    ConfigParseError,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::SpanOutOfBounds => "E2101",
            Self::AnnotationIndexOutOfRange => "E2102",
            Self::SurrogateSplit => "E2103",
            Self::MalformedScheduledTag => "E2201",
            Self::ConfigParseError => "E1002",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::SpanOutOfBounds => "Annotation span outside message text",
            Self::AnnotationIndexOutOfRange => "Annotation index out of range",
            Self::SurrogateSplit => "Offset splits a UTF-16 surrogate pair",
            Self::MalformedScheduledTag => "Scheduled tag has unparseable date/time",
            Self::ConfigParseError => "Config file parse error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::SpanOutOfBounds | Self::AnnotationIndexOutOfRange => {
                Some("The gateway sent annotations inconsistent with the message body.")
            }
            Self::SurrogateSplit => {
                Some("Re-fetch the message; offsets must land on UTF-16 unit boundaries.")
            }
            Self::MalformedScheduledTag => {
                Some("Use `#s YYYY-M-D H:M`; the malformed suffix was left as plain text.")
            }
            Self::ConfigParseError => Some("Fix syntax in the channel config TOML and retry."),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

/// Structural errors raised by the entity algebra and tag codec.
///
/// These indicate inconsistent input (annotations referring outside the
/// body), never ordinary ticket content. Malformed tag *content* is handled
/// in-band per the grammar rules and only logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("annotation span {offset}+{length} exceeds text of {text_units} UTF-16 units")]
    SpanOutOfBounds {
        offset: usize,
        length: usize,
        text_units: usize,
    },
    #[error("annotation index {index} out of range for {count} annotations")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("offset {offset} splits a surrogate pair")]
    SurrogateSplit { offset: usize },
}

impl CodecError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::SpanOutOfBounds { .. } => ErrorCode::SpanOutOfBounds,
            Self::IndexOutOfRange { .. } => ErrorCode::AnnotationIndexOutOfRange,
            Self::SurrogateSplit { .. } => ErrorCode::SurrogateSplit,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}
