//! In-process catalogue.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::{PersistenceError, PersistentStore, UpdateContext};

type Table = HashMap<String, Value>;
type Tables = HashMap<String, Table>;

/// Catalogue kept in memory. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalogue {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryCatalogue {
    /// Empty catalogue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert outside any transaction (fixtures, imports).
    pub fn seed(&self, table: &str, key: &str, entity: Value) {
        self.tables
            .write()
            .entry(table.to_owned())
            .or_default()
            .insert(key.to_owned(), entity);
    }

    /// Number of committed rows in `table`.
    #[must_use]
    pub fn count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, HashMap::len)
    }
}

impl PersistentStore for InMemoryCatalogue {
    fn find(&self, table: &str, key: &str) -> Option<Value> {
        self.tables.read().get(table)?.get(key).cloned()
    }

    fn find_where(&self, table: &str, predicate: &dyn Fn(&Value) -> bool) -> Vec<(String, Value)> {
        self.tables.read().get(table).map_or_else(Vec::new, |rows| {
            rows.iter()
                .filter(|(_, v)| predicate(v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    fn open_update_context(&self) -> Box<dyn UpdateContext> {
        Box::new(InMemoryUpdateContext {
            tables: Arc::clone(&self.tables),
            staged: Vec::new(),
            closed: false,
        })
    }
}

#[derive(Debug)]
enum Staged {
    Insert { table: String, key: String, entity: Value },
    Update { table: String, key: String, entity: Value },
    Delete { table: String, key: String },
}

impl Staged {
    fn target(&self) -> (&str, &str) {
        match self {
            Self::Insert { table, key, .. }
            | Self::Update { table, key, .. }
            | Self::Delete { table, key } => (table, key),
        }
    }
}

struct InMemoryUpdateContext {
    tables: Arc<RwLock<Tables>>,
    staged: Vec<Staged>,
    closed: bool,
}

impl InMemoryUpdateContext {
    fn ensure_open(&self) -> Result<(), PersistenceError> {
        if self.closed {
            return Err(PersistenceError::Closed);
        }
        Ok(())
    }
}

impl UpdateContext for InMemoryUpdateContext {
    fn find(&self, table: &str, key: &str) -> Option<Value> {
        let latest = self.staged.iter().rev().find(|op| op.target() == (table, key));
        match latest {
            Some(Staged::Insert { entity, .. } | Staged::Update { entity, .. }) => Some(entity.clone()),
            Some(Staged::Delete { .. }) => None,
            None => self.tables.read().get(table)?.get(key).cloned(),
        }
    }

    fn insert(&mut self, table: &str, key: &str, entity: Value) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        if self.find(table, key).is_some() {
            return Err(PersistenceError::Duplicate {
                table: table.into(),
                key: key.into(),
            });
        }
        self.staged.push(Staged::Insert {
            table: table.into(),
            key: key.into(),
            entity,
        });
        Ok(())
    }

    fn update(&mut self, table: &str, key: &str, entity: Value) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        if self.find(table, key).is_none() {
            return Err(PersistenceError::Missing {
                table: table.into(),
                key: key.into(),
            });
        }
        self.staged.push(Staged::Update {
            table: table.into(),
            key: key.into(),
            entity,
        });
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &str) -> Result<bool, PersistenceError> {
        self.ensure_open()?;
        let existed = self.find(table, key).is_some();
        if existed {
            self.staged.push(Staged::Delete {
                table: table.into(),
                key: key.into(),
            });
        }
        Ok(existed)
    }

    fn commit(&mut self) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        self.closed = true;
        let staged = std::mem::take(&mut self.staged);
        let mut tables = self.tables.write();

        // Validate against the committed state before touching anything.
        let mut view: HashMap<(&str, &str), bool> = HashMap::new();
        for op in &staged {
            let (table, key) = op.target();
            let present = *view
                .entry((table, key))
                .or_insert_with(|| tables.get(table).is_some_and(|t| t.contains_key(key)));
            match op {
                Staged::Insert { .. } if present => {
                    return Err(PersistenceError::Duplicate {
                        table: table.into(),
                        key: key.into(),
                    })
                }
                Staged::Update { .. } if !present => {
                    return Err(PersistenceError::Missing {
                        table: table.into(),
                        key: key.into(),
                    })
                }
                _ => {}
            }
            view.insert((table, key), !matches!(op, Staged::Delete { .. }));
        }

        let writes = staged.len();
        for op in staged {
            match op {
                Staged::Insert { table, key, entity } | Staged::Update { table, key, entity } => {
                    tables.entry(table).or_default().insert(key, entity);
                }
                Staged::Delete { table, key } => {
                    if let Some(rows) = tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }
        debug!(writes, "catalogue transaction committed");
        Ok(())
    }

    fn rollback(&mut self) {
        self.closed = true;
        self.staged.clear();
    }
}
