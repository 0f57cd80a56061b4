//! Subselect router: a SQL predicate templated with event values and run by an external
//! executor.

use std::collections::BTreeMap;

use async_trait::async_trait;
use pg_escape::quote_literal;

use crate::error::SyncResult;
use crate::types::{ChannelId, NodeId};

/// Runs rendered subselect predicates against the catalog database.
#[async_trait]
pub trait SubselectExecutor: Send + Sync {
    /// Returns the ids of the nodes selected by `predicate`.
    async fn select_node_ids(
        &self,
        channel_id: &ChannelId,
        predicate: &str,
    ) -> SyncResult<Vec<NodeId>>;
}

/// Subselect predicate with `:NAME` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubselectTemplate {
    predicate: String,
}

impl SubselectTemplate {
    pub fn new(predicate: impl Into<String>) -> Self {
        Self {
            predicate: predicate.into(),
        }
    }

    pub fn predicate(&self) -> &str {
        &self.predicate
    }

    /// Replaces each placeholder with the quoted value bound to its upper-cased name.
    ///
    /// Unbound placeholders and `NULL` values render as `null`. Quoted strings and `::`
    /// casts are left untouched.
    pub fn render(&self, bindings: &BTreeMap<String, Option<String>>) -> String {
        let predicate = self.predicate.as_str();
        let bytes = predicate.as_bytes();
        let mut rendered = String::with_capacity(predicate.len());
        let mut in_quote = false;
        let mut copied_until = 0;
        let mut index = 0;

        while index < bytes.len() {
            let byte = bytes[index];
            if byte == b'\'' {
                in_quote = !in_quote;
                index += 1;
                continue;
            }
            if in_quote || byte != b':' {
                index += 1;
                continue;
            }
            if bytes.get(index + 1) == Some(&b':') {
                index += 2;
                continue;
            }

            let name_start = index + 1;
            let mut name_end = name_start;
            while name_end < bytes.len()
                && (bytes[name_end].is_ascii_alphanumeric() || bytes[name_end] == b'_')
            {
                name_end += 1;
            }
            if name_end == name_start {
                index += 1;
                continue;
            }

            rendered.push_str(&predicate[copied_until..index]);
            let name = predicate[name_start..name_end].to_ascii_uppercase();
            match bindings.get(&name).and_then(Option::as_deref) {
                Some(value) => rendered.push_str(&quote_literal(value)),
                None => rendered.push_str("null"),
            }
            copied_until = name_end;
            index = name_end;
        }
        rendered.push_str(&predicate[copied_until..]);

        rendered
    }
}
