use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::Statement;
use crate::context::LoadContext;
use crate::outcome::{codes, OutcomeType};

/// Reusable statements declared under `xsdl:Library`, keyed by `uid`.
#[derive(Debug, Clone, Default)]
pub struct Library {
    statements: Arc<DashMap<String, Arc<Statement>>>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the children of the library element under the parser. Leaves
    /// the parser on the library's end tag.
    pub fn load(&self, context: &mut LoadContext) -> OutcomeType {
        let mark = context.outcomes().mark();
        let factory = context.factory().clone();
        while context.next() {
            if context.at_end_tag(None) {
                break;
            }
            if !context.at_start_tag(None) {
                continue;
            }
            let Some(statement) = factory.create(context, None) else {
                continue;
            };
            let Some(uid) = statement.uid().map(str::to_string) else {
                context.outcomes_mut().warning(
                    codes::STRUCTURE,
                    format!("library statement '{}' without a uid ignored", statement.tag()),
                );
                continue;
            };
            match self.statements.entry(uid) {
                dashmap::mapref::entry::Entry::Occupied(entry) => {
                    let uid = entry.key().clone();
                    drop(entry);
                    context.outcomes_mut().warning(
                        codes::DUPLICATE,
                        format!("duplicate library uid '{}' ignored", uid),
                    );
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    debug!(uid = %entry.key(), tag = statement.tag(), "library statement loaded");
                    entry.insert(Arc::new(statement));
                }
            }
        }
        context.outcomes().outcome_since(mark)
    }

    pub fn query_statement(&self, uid: &str) -> Option<Arc<Statement>> {
        self.statements.get(uid).map(|s| Arc::clone(s.value()))
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.statements.iter().map(|e| e.key().clone()).collect();
        uids.sort();
        uids
    }
}
