//! Rewrite and veto points around every intercepted call.

use crate::canonical::CallIdentity;
use crate::errors::{CallError, InterposerError};
use crate::store::Mode;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Caller-supplied transforms applied by the engine.
///
/// Every method defaults to the identity. Parameter hooks run before hashing,
/// `_pre` on the recording path and `_post` on the playback path, so a
/// rewrite must be applied on both for hashes to line up.
pub trait Hooks: Send + Sync {
    fn cleanup_parameters_pre(&self, call: CallIdentity) -> CallIdentity {
        call
    }

    fn cleanup_parameters_post(&self, call: CallIdentity) -> CallIdentity {
        call
    }

    /// Rewrite a live result before it is stored.
    fn cleanup_result_pre(&self, _call: &CallIdentity, result: Value) -> Value {
        result
    }

    /// Rewrite a stored result before it is returned.
    fn cleanup_result_post(&self, result: Value) -> Value {
        result
    }

    fn cleanup_exception_pre(&self, error: CallError) -> CallError {
        error
    }

    fn cleanup_exception_post(&self, error: CallError) -> CallError {
        error
    }

    /// Refuse a call before it runs, live or played back.
    fn clear_for_execution(&self, _call: &CallIdentity) -> Result<(), InterposerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}

/// Keeps secrets out of recordings.
///
/// While recording, [`Redactions::redact`] hands the secret back unchanged
/// and remembers it; every remembered secret is then replaced by a mask of
/// `^` of the same length in recorded parameters, results, and exception
/// messages. During playback `redact` returns that mask directly, so the
/// code under test hashes the same parameters it did when recording.
#[derive(Debug)]
pub struct Redactions {
    mode: Mode,
    secrets: Mutex<BTreeSet<String>>,
}

impl Redactions {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            secrets: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn redact(&self, secret: &str) -> String {
        match self.mode {
            Mode::Playback => mask(secret),
            Mode::Recording => {
                if !secret.is_empty() {
                    if let Ok(mut secrets) = self.secrets.lock() {
                        secrets.insert(secret.to_string());
                    }
                }
                secret.to_string()
            }
        }
    }

    fn scrub(&self, text: String) -> String {
        let Ok(secrets) = self.secrets.lock() else {
            return text;
        };
        // Longest first so a secret containing another is masked whole.
        let mut ordered = secrets.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|secret| std::cmp::Reverse(secret.len()));
        ordered
            .into_iter()
            .fold(text, |text, secret| text.replace(secret.as_str(), &mask(secret)))
    }

    fn scrub_value(&self, value: Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.scrub(text)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|item| self.scrub_value(item)).collect())
            }
            Value::Object(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, self.scrub_value(value)))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl Hooks for Redactions {
    fn cleanup_parameters_pre(&self, call: CallIdentity) -> CallIdentity {
        call.map_strings(&|text| self.scrub(text))
    }

    fn cleanup_result_pre(&self, _call: &CallIdentity, result: Value) -> Value {
        self.scrub_value(result)
    }

    fn cleanup_exception_pre(&self, error: CallError) -> CallError {
        CallError {
            kind: error.kind,
            message: self.scrub(error.message),
            detail: self.scrub_value(error.detail),
        }
    }
}

fn mask(secret: &str) -> String {
    "^".repeat(secret.chars().count())
}
