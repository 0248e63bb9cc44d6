//! Request-level checks over raw inputs, before candidates are built.
//!
//! Absent inputs (an optional form field left empty) always pass.

use crate::candidate::{content_type_matches, size_within};
use crate::RawUpload;

/// Accepts inputs whose content type contains every configured entry
#[derive(Debug, Clone, Default)]
pub struct FileTypes {
    mime_types: Vec<String>,
}

impl FileTypes {
    pub fn new<I, S>(mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mime_types: mime_types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_valid<R: RawUpload>(&self, input: Option<&R>) -> bool {
        input.map_or(true, |raw| {
            content_type_matches(raw.content_type(), self.mime_types.as_slice())
        })
    }

    pub fn are_valid<'a, R, I>(&self, inputs: I) -> bool
    where
        R: RawUpload + 'a,
        I: IntoIterator<Item = Option<&'a R>>,
    {
        inputs.into_iter().all(|input| self.is_valid(input))
    }
}

/// Accepts inputs declaring at most `max_bytes`
#[derive(Debug, Clone, Copy)]
pub struct FileSize {
    max_bytes: u64,
}

impl FileSize {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn is_valid<R: RawUpload>(&self, input: Option<&R>) -> bool {
        input.map_or(true, |raw| size_within(raw.content_length(), self.max_bytes))
    }

    pub fn are_valid<'a, R, I>(&self, inputs: I) -> bool
    where
        R: RawUpload + 'a,
        I: IntoIterator<Item = Option<&'a R>>,
    {
        inputs.into_iter().all(|input| self.is_valid(input))
    }
}
