//! Evaluation contexts: the capabilities expressions may draw on beyond the
//! item itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use regex::Regex;

use crate::errors::Result;
use crate::value::Value;

use super::like::like_to_regex;

/// Capabilities available to expression evaluation.
///
/// Implemented by the execution context; [`SimpleContext`] provides a
/// self-contained implementation for constant folding and tests.
pub trait EvalContext {
    /// Statement-stable wall clock. All `NOW()`-style functions within one
    /// request observe the same instant.
    fn now(&self) -> SystemTime;

    /// Remaining request timeout, when one is set.
    fn timeout(&self) -> Option<Duration>;

    /// Positional placeholder value (1-based).
    fn positional_param(&self, i: usize) -> Option<Value>;

    /// Named placeholder value.
    fn named_param(&self, name: &str) -> Option<Value>;

    /// Compiled matcher for a LIKE pattern. Implementations cache per
    /// pattern for the life of the request.
    fn like_regex(&self, pattern: &str) -> Result<Arc<Regex>>;

    /// Stashes a per-request scratch value.
    fn store_value(&self, key: &str, value: Value);

    /// Reads back a stashed scratch value.
    fn retrieve_value(&self, key: &str) -> Option<Value>;

    /// Discards a stashed scratch value.
    fn release_value(&self, key: &str);
}

/// Free-standing context with no parameters and a private regex cache.
pub struct SimpleContext {
    now: SystemTime,
    positional: Vec<Value>,
    named: HashMap<String, Value>,
    regexes: Mutex<HashMap<String, Arc<Regex>>>,
    scratch: Mutex<HashMap<String, Value>>,
}

impl Default for SimpleContext {
    fn default() -> Self {
        Self {
            now: SystemTime::now(),
            positional: Vec::new(),
            named: HashMap::new(),
            regexes: Mutex::new(HashMap::new()),
            scratch: Mutex::new(HashMap::new()),
        }
    }
}

impl SimpleContext {
    /// Context carrying the given placeholder values.
    pub fn with_params(positional: Vec<Value>, named: HashMap<String, Value>) -> Self {
        Self {
            positional,
            named,
            ..Self::default()
        }
    }
}

impl EvalContext for SimpleContext {
    fn now(&self) -> SystemTime {
        self.now
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn positional_param(&self, i: usize) -> Option<Value> {
        i.checked_sub(1).and_then(|i| self.positional.get(i)).cloned()
    }

    fn named_param(&self, name: &str) -> Option<Value> {
        self.named.get(name).cloned()
    }

    fn like_regex(&self, pattern: &str) -> Result<Arc<Regex>> {
        let mut cache = self.regexes.lock();
        if let Some(re) = cache.get(pattern) {
            return Ok(Arc::clone(re));
        }
        let re = Arc::new(like_to_regex(pattern)?);
        cache.insert(pattern.to_owned(), Arc::clone(&re));
        Ok(re)
    }

    fn store_value(&self, key: &str, value: Value) {
        self.scratch.lock().insert(key.to_owned(), value);
    }

    fn retrieve_value(&self, key: &str) -> Option<Value> {
        self.scratch.lock().get(key).cloned()
    }

    fn release_value(&self, key: &str) {
        self.scratch.lock().remove(key);
    }
}
