// Copyright 2025 The kmesh Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Minimal error carrier shared across the stats crates.
//!
//! Failure in this subsystem is always recoverable, so the error type is a
//! plain message-plus-cause chain rather than a typed taxonomy. Crates that
//! need structured variants (e.g. configuration validation) define their own
//! `thiserror` enums and convert into [`Error`] at the boundary.

use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};

pub type Result<T> = std::result::Result<T, Error>;

pub struct Error {
    message: String,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn with_cause<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error { message: message.into(), cause: Some(Box::new(cause)) }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {cause}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error { message, cause: None }
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error { message: message.to_owned(), cause: None }
    }
}

/// Attaches a human-readable context message to any fallible result whose
/// error converts into a boxed standard error.
pub trait Context<T> {
    fn context(self, message: &'static str) -> Result<T>;
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    fn context(self, message: &'static str) -> Result<T> {
        self.map_err(|e| Error::with_cause(message, e))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| Error::with_cause(f(), e))
    }
}

impl<T> Context<T> for Option<T> {
    fn context(self, message: &'static str) -> Result<T> {
        self.ok_or_else(|| Error::from(message))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| Error::from(f()))
    }
}
