//! Traversal helpers for open-ended JSON payloads
//!
//! Paths are dot-separated; numeric segments index into arrays, so
//! `"questions.0.id"` reads the id of the first question.

use serde_json::Value;

use crate::error::{E2eError, E2eResult};

pub trait JsonExt {
    /// Value at `path`, if every segment resolves.
    fn at(&self, path: &str) -> Option<&Value>;

    fn str_at(&self, path: &str) -> Option<&str> {
        self.at(path).and_then(Value::as_str)
    }

    fn i64_at(&self, path: &str) -> Option<i64> {
        self.at(path).and_then(Value::as_i64)
    }

    fn bool_at(&self, path: &str) -> Option<bool> {
        self.at(path).and_then(Value::as_bool)
    }

    fn array_at(&self, path: &str) -> Option<&Vec<Value>> {
        self.at(path).and_then(Value::as_array)
    }

    /// String at `path`, or an assertion error naming the path.
    fn require_str(&self, path: &str) -> E2eResult<&str> {
        self.str_at(path)
            .ok_or_else(|| E2eError::assertion(format!("expected string at `{}`", path)))
    }

    fn require_bool(&self, path: &str) -> E2eResult<bool> {
        self.bool_at(path)
            .ok_or_else(|| E2eError::assertion(format!("expected bool at `{}`", path)))
    }

    fn require_array(&self, path: &str) -> E2eResult<&Vec<Value>> {
        self.array_at(path)
            .ok_or_else(|| E2eError::assertion(format!("expected array at `{}`", path)))
    }
}

impl JsonExt for Value {
    fn at(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

/// True when any object in `items` has `"id": id`.
pub fn contains_id(items: &[Value], id: &str) -> bool {
    items.iter().any(|item| item.str_at("id") == Some(id))
}
