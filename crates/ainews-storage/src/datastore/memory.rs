use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{Datastore, DatastoreError, Filter, Row, RowId};

/// Child rows removed when the parent row they point at is deleted.
#[derive(Debug, Clone)]
struct Cascade {
    parent: String,
    child: String,
    column: String,
}

/// In-process datastore that enforces the constraints it is told about:
/// unique keys (single or composite), required columns, columns fixed at
/// first insert, and delete cascades. Backs tests and dry runs; ids are
/// generated uuids.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    unique: HashMap<String, Vec<Vec<String>>>,
    required: HashMap<String, Vec<String>>,
    immutable: HashMap<String, Vec<String>>,
    cascades: Vec<Cascade>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `columns` a unique key of `table`. Rows with a null in any
    /// key column never clash, as in SQL.
    pub fn with_unique(mut self, table: &str, columns: &[&str]) -> Self {
        self.unique
            .entry(table.to_string())
            .or_default()
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Declares `columns` NOT NULL without a default.
    pub fn with_required(mut self, table: &str, columns: &[&str]) -> Self {
        self.required
            .entry(table.to_string())
            .or_default()
            .extend(columns.iter().map(|c| c.to_string()));
        self
    }

    /// Updates leave `columns` at the value they were first stored with.
    pub fn with_immutable(mut self, table: &str, columns: &[&str]) -> Self {
        self.immutable
            .entry(table.to_string())
            .or_default()
            .extend(columns.iter().map(|c| c.to_string()));
        self
    }

    /// Deleting a `parent` row deletes `child` rows whose `column` holds its id.
    pub fn with_cascade(mut self, parent: &str, child: &str, column: &str) -> Self {
        self.cascades.push(Cascade {
            parent: parent.to_string(),
            child: child.to_string(),
            column: column.to_string(),
        });
        self
    }

    /// Snapshot of every row in `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().get(table).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Row>>> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_required(&self, table: &str, row: &Row) -> Result<(), DatastoreError> {
        let Some(columns) = self.required.get(table) else {
            return Ok(());
        };
        match columns
            .iter()
            .find(|c| row.get(c.as_str()).map_or(true, JsonValue::is_null))
        {
            Some(column) => Err(DatastoreError::InvalidRow {
                table: table.to_string(),
                reason: format!("null value in required column {column}"),
            }),
            None => Ok(()),
        }
    }

    fn check_unique(
        &self,
        table: &str,
        rows: &[Row],
        candidate: &Row,
        skip_id: Option<&RowId>,
    ) -> Result<(), DatastoreError> {
        let Some(keys) = self.unique.get(table) else {
            return Ok(());
        };
        for key in keys {
            let values: Option<Vec<&JsonValue>> = key
                .iter()
                .map(|c| candidate.get(c).filter(|v| !v.is_null()))
                .collect();
            let Some(values) = values else {
                continue;
            };
            let clash = rows.iter().any(|existing| {
                key.iter()
                    .zip(&values)
                    .all(|(column, value)| existing.get(column) == Some(*value))
                    && skip_id.map_or(true, |id| RowId::from_row(existing).as_ref() != Some(id))
            });
            if clash {
                return Err(DatastoreError::Conflict {
                    table: table.to_string(),
                    column: key.join(","),
                });
            }
        }
        Ok(())
    }

    fn insert_locked(
        &self,
        tables: &mut HashMap<String, Vec<Row>>,
        table: &str,
        mut row: Row,
    ) -> Result<Row, DatastoreError> {
        self.check_required(table, &row)?;
        let rows = tables.entry(table.to_string()).or_default();
        self.check_unique(table, rows, &row, None)?;
        if RowId::from_row(&row).is_none() {
            row.insert("id".to_string(), JsonValue::from(Uuid::new_v4().to_string()));
        }
        rows.push(row.clone());
        Ok(row)
    }

    /// Merges `patch` over `existing` and validates the result.
    fn merged(
        &self,
        table: &str,
        rows: &[Row],
        existing: &Row,
        patch: Row,
    ) -> Result<Row, DatastoreError> {
        let fixed = self.immutable.get(table);
        let mut merged = existing.clone();
        for (key, value) in patch {
            let keep = key == "id"
                || (fixed.is_some_and(|f| f.contains(&key)) && existing.contains_key(&key));
            if !keep {
                merged.insert(key, value);
            }
        }
        self.check_required(table, &merged)?;
        self.check_unique(table, rows, &merged, RowId::from_row(&merged).as_ref())?;
        Ok(merged)
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, DatastoreError> {
        let matched = self
            .lock()
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        Ok(filter.window(matched))
    }

    async fn count(&self, table: &str, filter: &Filter) -> Result<usize, DatastoreError> {
        Ok(self
            .lock()
            .get(table)
            .map_or(0, |rows| rows.iter().filter(|r| filter.matches(r)).count()))
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, DatastoreError> {
        let mut tables = self.lock();
        self.insert_locked(&mut tables, table, row)
    }

    async fn upsert(
        &self,
        table: &str,
        row: Row,
        conflict_key: &str,
    ) -> Result<Row, DatastoreError> {
        let key = row
            .get(conflict_key)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| DatastoreError::InvalidRow {
                table: table.to_string(),
                reason: format!("missing conflict key {conflict_key}"),
            })?;
        // the proposed row is checked before the conflict is resolved
        self.check_required(table, &row)?;

        let mut tables = self.lock();
        let rows = tables.entry(table.to_string()).or_default();
        let Some(index) = rows.iter().position(|r| r.get(conflict_key) == Some(&key)) else {
            return self.insert_locked(&mut tables, table, row);
        };

        let merged = self.merged(table, rows, &rows[index], row)?;
        rows[index] = merged.clone();
        Ok(merged)
    }

    async fn update(&self, table: &str, id: &RowId, patch: Row) -> Result<(), DatastoreError> {
        let mut tables = self.lock();
        let rows = tables.entry(table.to_string()).or_default();
        if let Some(index) = rows
            .iter()
            .position(|r| RowId::from_row(r).as_ref() == Some(id))
        {
            let merged = self.merged(table, rows, &rows[index], patch)?;
            rows[index] = merged;
        }
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, DatastoreError> {
        let mut tables = self.lock();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let (removed, kept): (Vec<Row>, Vec<Row>) =
            rows.drain(..).partition(|r| filter.matches(r));
        *rows = kept;

        let removed_ids: Vec<JsonValue> = removed
            .iter()
            .filter_map(|r| r.get("id").cloned())
            .collect();
        for cascade in self.cascades.iter().filter(|c| c.parent == table) {
            if let Some(children) = tables.get_mut(&cascade.child) {
                children.retain(|child| {
                    child
                        .get(&cascade.column)
                        .map_or(true, |fk| !removed_ids.contains(fk))
                });
            }
        }
        Ok(removed.len())
    }
}
