//! API translation between the Anthropic Messages and `OpenAI` Chat Completions formats.
//!
//! The core of the facade: converts requests, responses, streaming events and errors
//! between the two API formats. All translation functions are pure (no I/O); anything
//! they had to drop or degrade is reported as a [`Diagnostic`] next to the output.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod anthropic_types;
pub mod errors;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod schema;
pub mod streaming;
pub mod tokens;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A request parameter with no downstream equivalent.
    DroppedParameter,
    /// A content block that cannot be expressed where it appeared.
    DroppedContent,
    UnknownFinishReason,
    MalformedToolArguments,
    /// An upstream tool index was reused for a different call.
    IndexReuse,
    /// A stream fragment that could not be applied.
    IgnoredFragment,
}

impl DiagnosticKind {
    /// Whether this diagnostic degraded part of the output rather than just trimming input.
    pub fn is_translation_error(self) -> bool {
        matches!(
            self,
            DiagnosticKind::MalformedToolArguments | DiagnosticKind::IndexReuse
        )
    }
}

/// A non-fatal event recorded while translating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn dropped_parameter(name: &str) -> Self {
        Self::new(
            DiagnosticKind::DroppedParameter,
            format!("parameter '{name}' has no downstream equivalent and was dropped"),
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Translation output together with whatever had to be dropped on the way.
#[derive(Debug, Clone)]
pub struct Translated<T> {
    pub value: T,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> Translated<T> {
    pub fn new(value: T, diagnostics: Vec<Diagnostic>) -> Self {
        Self { value, diagnostics }
    }
}
