//! Built-in history summary analysis
//!
//! Aggregates the extracted model of one source into per-author, per-item
//! and whole-source count records. Deliberately simple: it exercises the
//! result store end to end and gives `run` something useful to produce out
//! of the box.

use anyhow::Result;
use serde_json::json;
use tracing::debug;

use super::{Analysis, SourceContext};
use crate::store::ElementKind;

pub(crate) const NAME: &str = "commit-stats";

/// Counts events, items, authors, actions and churn for a source.
pub struct CommitStats;

impl Analysis for CommitStats {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run_on(&self, ctx: &mut SourceContext) -> Result<()> {
        let source = ctx.source_id();

        let events = ctx.events()?;
        let merges = events.iter().filter(|e| e.is_merge()).count();
        let first_timestamp = events.iter().map(|e| e.timestamp).min();
        let last_timestamp = events.iter().map(|e| e.timestamp).max();

        let store = ctx.store();
        let authors = store.authors_for_source(source)?;
        for author in &authors {
            store.put_result(
                NAME,
                ElementKind::Author,
                author.id.0,
                &json!({
                    "name": author.name,
                    "email": author.email,
                    "events": author.events.len(),
                }),
            )?;
        }

        let items = store.items_for_source(source)?;
        for item in &items {
            store.put_result(
                NAME,
                ElementKind::Item,
                item.id.0,
                &json!({
                    "path": item.native_id,
                    "actions": item.actions.len(),
                }),
            )?;
        }

        let actions = store.actions_for_source(source)?;
        let lines_added: u64 = actions.iter().filter_map(|a| a.lines_added()).sum();
        let lines_deleted: u64 = actions.iter().filter_map(|a| a.lines_deleted()).sum();

        store.put_result(
            NAME,
            ElementKind::Source,
            source.0,
            &json!({
                "events": events.len(),
                "merges": merges,
                "items": items.len(),
                "authors": authors.len(),
                "actions": actions.len(),
                "lines_added": lines_added,
                "lines_deleted": lines_deleted,
                "first_timestamp": first_timestamp,
                "last_timestamp": last_timestamp,
            }),
        )?;

        debug!(
            source = source.0,
            events = events.len(),
            actions = actions.len(),
            "commit stats recorded"
        );
        Ok(())
    }
}
