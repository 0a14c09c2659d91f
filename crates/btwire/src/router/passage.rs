//! Passage builders for routes that carry worker replies.

use std::sync::Arc;

use super::Passage;
use crate::bridge::protocol::{Reply, key};

/// Admits replies carrying at least one of `keys`.
pub fn allowed_keys(keys: &[&str]) -> Passage<Reply> {
    let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    Arc::new(move |reply: &Reply| keys.iter().any(|k| reply.has(k)))
}

/// Admits replies carrying none of `keys`.
pub fn denied_keys(keys: &[&str]) -> Passage<Reply> {
    let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    Arc::new(move |reply: &Reply| !keys.iter().any(|k| reply.has(k)))
}

/// Admits replies whose string field `key` equals `value`.
pub fn key_equals(key: &str, value: &str) -> Passage<Reply> {
    let key = key.to_string();
    let value = value.to_string();
    Arc::new(move |reply: &Reply| reply.str(&key) == Some(value.as_str()))
}

/// Admits error reports whose `source` contains `marker`.
pub fn source_contains(marker: &str) -> Passage<Reply> {
    let marker = marker.to_string();
    Arc::new(move |reply: &Reply| {
        reply
            .str(key::SOURCE)
            .is_some_and(|source| source.contains(&marker))
    })
}

/// Admits only what every passage admits.
pub fn all_of(passages: Vec<Passage<Reply>>) -> Passage<Reply> {
    Arc::new(move |reply: &Reply| passages.iter().all(|p| p(reply)))
}
