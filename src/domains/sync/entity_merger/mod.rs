use crate::domains::sync::types::{AffectedTables, ChangeOperation, ChangeRecord};
use crate::errors::{DomainError, DomainResult, SyncError};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::query::Query;
use sqlx::{Column, Row, Sqlite, SqlitePool, Transaction, TypeInfo, ValueRef};

pub mod descriptors;

pub use descriptors::{descriptor_for, descriptors, EntityDescriptor};

/// Applies a snapshot store or a single change record into the MAIN store.
///
/// Writes go straight to the pool, never through the entity repositories,
/// so no write hooks fire and nothing merged here is journaled back.
pub struct StoreMerger {
    main: SqlitePool,
}

impl StoreMerger {
    pub fn new(main: SqlitePool) -> Self {
        Self { main }
    }

    /// Merge every replicated entity from a snapshot store, in the fixed
    /// entity order. The schema-compatibility precondition is checked for
    /// all entities before any row is written.
    pub async fn merge_snapshot(&self, source: &SqlitePool) -> DomainResult<AffectedTables> {
        for descriptor in descriptors() {
            self.check_schema_compatibility(source, descriptor).await?;
        }

        let mut affected = AffectedTables::default();
        for descriptor in descriptors() {
            let rows = read_all_rows(source, descriptor.table).await?;
            if rows.is_empty() {
                continue;
            }
            let target_columns = table_columns(&self.main, descriptor.table).await?;

            let mut tx = self.main.begin().await.map_err(apply_err)?;
            for image in &rows {
                upsert_row(&mut tx, descriptor, &target_columns, image).await?;
                affected.record(descriptor.table, &identity_of(descriptor, image)?);
            }
            tx.commit().await.map_err(apply_err)?;
        }
        Ok(affected)
    }

    /// Apply one change record inside a single MAIN-store transaction.
    pub async fn apply_change(&self, record: &ChangeRecord) -> DomainResult<AffectedTables> {
        let descriptor = descriptor_for(&record.table_name).ok_or_else(|| {
            DomainError::Sync(SyncError::CorruptBlob(format!(
                "change references unknown table: {}",
                record.table_name
            )))
        })?;

        let mut tx = self.main.begin().await.map_err(apply_err)?;
        match record.operation {
            ChangeOperation::Save => {
                let image = record.new_data.as_object().ok_or_else(|| {
                    DomainError::Sync(SyncError::CorruptBlob(
                        "change post-image is not a JSON object".to_string(),
                    ))
                })?;
                let target_columns = table_columns(&self.main, descriptor.table).await?;
                upsert_row(&mut tx, descriptor, &target_columns, image).await?;
            }
            ChangeOperation::Delete => {
                // The change is itself a tombstone; delete hard.
                let sql = format!(
                    "DELETE FROM {} WHERE {} = ?",
                    descriptor.table, descriptor.identity_column
                );
                sqlx::query(&sql)
                    .bind(&record.row_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(apply_err)?;
            }
        }
        tx.commit().await.map_err(apply_err)?;

        let mut affected = AffectedTables::default();
        affected.record(descriptor.table, &record.row_id);
        Ok(affected)
    }

    /// Both tables must exist and every source column must appear in the
    /// target with the same declared type.
    async fn check_schema_compatibility(
        &self,
        source: &SqlitePool,
        descriptor: &EntityDescriptor,
    ) -> DomainResult<()> {
        let incompatible = |reason: String| {
            DomainError::Sync(SyncError::SchemaIncompatible {
                table: descriptor.table.to_string(),
                reason,
            })
        };

        let source_columns = table_columns(source, descriptor.table).await?;
        if source_columns.is_empty() {
            return Err(incompatible("table missing in source store".to_string()));
        }
        let target_columns = table_columns(&self.main, descriptor.table).await?;
        if target_columns.is_empty() {
            return Err(incompatible("table missing in target store".to_string()));
        }

        for (name, declared_type) in &source_columns {
            match target_columns.iter().find(|(n, _)| n == name) {
                None => {
                    return Err(incompatible(format!("column {} missing in target", name)));
                }
                Some((_, target_type)) if !target_type.eq_ignore_ascii_case(declared_type) => {
                    return Err(incompatible(format!(
                        "column {} type mismatch: {} vs {}",
                        name, declared_type, target_type
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn apply_err(e: sqlx::Error) -> DomainError {
    DomainError::Sync(SyncError::Apply(e.to_string()))
}

/// Column (name, declared type) pairs, in table order. Empty when the
/// table does not exist. Table names only ever come from the descriptor
/// table, so interpolation is safe.
async fn table_columns(pool: &SqlitePool, table: &str) -> DomainResult<Vec<(String, String)>> {
    let sql = format!("PRAGMA table_info({})", table);
    let rows = sqlx::query(&sql).fetch_all(pool).await.map_err(apply_err)?;
    rows.iter()
        .map(|row| {
            let name: String = row.try_get("name").map_err(apply_err)?;
            let declared_type: String = row.try_get("type").map_err(apply_err)?;
            Ok((name, declared_type))
        })
        .collect()
}

/// Read every row of a table as a column-name -> JSON-value image.
async fn read_all_rows(pool: &SqlitePool, table: &str) -> DomainResult<Vec<Map<String, Value>>> {
    let sql = format!("SELECT * FROM {}", table);
    let rows = sqlx::query(&sql).fetch_all(pool).await.map_err(apply_err)?;
    rows.iter().map(row_to_image).collect()
}

fn row_to_image(row: &SqliteRow) -> DomainResult<Map<String, Value>> {
    let mut image = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i).map_err(apply_err)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(i).map_err(apply_err)?),
                "REAL" => Value::from(row.try_get::<f64, _>(i).map_err(apply_err)?),
                "BLOB" => {
                    return Err(DomainError::Internal(format!(
                        "unsupported BLOB column: {}",
                        column.name()
                    )))
                }
                _ => Value::from(row.try_get::<String, _>(i).map_err(apply_err)?),
            }
        };
        image.insert(column.name().to_string(), value);
    }
    Ok(image)
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: Option<&Value>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        None | Some(Value::Null) => query.bind(None::<String>),
        Some(Value::Bool(b)) => query.bind(*b as i64),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or(0.0)),
        },
        Some(Value::String(s)) => query.bind(s.clone()),
        // Arrays and objects are stored as their JSON text.
        Some(other) => query.bind(other.to_string()),
    }
}

fn identity_of(descriptor: &EntityDescriptor, image: &Map<String, Value>) -> DomainResult<String> {
    match image.get(descriptor.identity_column) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Ok(other.to_string()),
        None => Err(DomainError::Sync(SyncError::CorruptBlob(format!(
            "row image missing identity column {}.{}",
            descriptor.table, descriptor.identity_column
        )))),
    }
}

/// Upsert one row image, honoring the entity's merge rules.
async fn upsert_row(
    tx: &mut Transaction<'_, Sqlite>,
    descriptor: &EntityDescriptor,
    target_columns: &[(String, String)],
    image: &Map<String, Value>,
) -> DomainResult<()> {
    if descriptor.singleton {
        return merge_singleton(tx, descriptor, target_columns, image).await;
    }

    // Usable columns, in target-table order: present in the image, not
    // deliberately omitted. Unknown image fields are dropped.
    let columns: Vec<&str> = target_columns
        .iter()
        .map(|(name, _)| name.as_str())
        .filter(|name| image.contains_key(*name) && !descriptor.omit_columns.contains(name))
        .collect();

    for conflict in descriptor.conflict_columns {
        if !columns.contains(conflict) {
            return Err(DomainError::Sync(SyncError::CorruptBlob(format!(
                "row image missing conflict column {}.{}",
                descriptor.table, conflict
            ))));
        }
    }

    // Updatable set excludes the primary key, the conflict columns, and
    // the creation timestamp.
    let updatable: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|name| {
            *name != descriptor.pk_column
                && *name != "created_at"
                && !descriptor.conflict_columns.contains(name)
        })
        .collect();

    let update_clause = if updatable.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let assignments: Vec<String> = updatable
            .iter()
            .map(|name| format!("{} = excluded.{}", name, name))
            .collect();
        format!("DO UPDATE SET {}", assignments.join(", "))
    };

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        descriptor.table,
        columns.join(", "),
        placeholders,
        descriptor.conflict_columns.join(", "),
        update_clause
    );

    let mut query = sqlx::query(&sql);
    for column in &columns {
        query = bind_value(query, image.get(*column));
    }
    query.execute(&mut **tx).await.map_err(apply_err)?;
    Ok(())
}

/// Config strategy: replace the single existing row, creating it if none.
/// An existing row takes a partial update of the image's non-zero fields.
async fn merge_singleton(
    tx: &mut Transaction<'_, Sqlite>,
    descriptor: &EntityDescriptor,
    target_columns: &[(String, String)],
    image: &Map<String, Value>,
) -> DomainResult<()> {
    let select = format!(
        "SELECT {} FROM {} LIMIT 1",
        descriptor.pk_column, descriptor.table
    );
    let existing: Option<(i64,)> = sqlx::query_as(&select)
        .fetch_optional(&mut **tx)
        .await
        .map_err(apply_err)?;

    match existing {
        None => {
            let columns: Vec<&str> = target_columns
                .iter()
                .map(|(name, _)| name.as_str())
                .filter(|name| image.contains_key(*name))
                .collect();
            if columns.is_empty() {
                return Err(DomainError::Sync(SyncError::CorruptBlob(format!(
                    "empty row image for {}",
                    descriptor.table
                ))));
            }
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                descriptor.table,
                columns.join(", "),
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for column in &columns {
                query = bind_value(query, image.get(*column));
            }
            query.execute(&mut **tx).await.map_err(apply_err)?;
        }
        Some((pk,)) => {
            let updatable: Vec<&str> = target_columns
                .iter()
                .map(|(name, _)| name.as_str())
                .filter(|name| {
                    *name != descriptor.pk_column
                        && *name != "created_at"
                        && image.get(*name).is_some_and(|v| !is_zero(v))
                })
                .collect();
            if updatable.is_empty() {
                return Ok(());
            }
            let assignments: Vec<String> =
                updatable.iter().map(|name| format!("{} = ?", name)).collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?",
                descriptor.table,
                assignments.join(", "),
                descriptor.pk_column
            );
            let mut query = sqlx::query(&sql);
            for column in &updatable {
                query = bind_value(query, image.get(*column));
            }
            query = query.bind(pk);
            query.execute(&mut **tx).await.map_err(apply_err)?;
        }
    }
    Ok(())
}

/// Partial-update filter for the singleton strategy: zero values never
/// overwrite existing fields.
fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_i64() == Some(0) || n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_util::open_test_stores;
    use crate::domains::sync::types::sync_epoch;
    use serde_json::json;

    fn save_record(table: &str, row_id: &str, new_data: Value) -> ChangeRecord {
        ChangeRecord {
            change_id: crate::domains::sync::types::change_id(
                table,
                row_id,
                ChangeOperation::Save,
            ),
            table_name: table.to_string(),
            row_id: row_id.to_string(),
            operation: ChangeOperation::Save,
            new_data,
            created_at: sync_epoch(),
            updated_at: sync_epoch(),
        }
    }

    fn page_image(id: &str, title: &str) -> Value {
        json!({
            "id": id,
            "title": title,
            "html_content": "<p>body</p>",
            "blocks": null,
            "is_folder": 0,
            "expanded": 0,
            "sort_order": 1,
            "parent_id": null,
            "created_at": "2026-03-01T10:00:00+00:00",
            "updated_at": "2026-03-01T10:00:00+00:00",
            "deleted_at": null,
        })
    }

    #[tokio::test]
    async fn save_change_inserts_then_updates_by_primary_key() {
        let stores = open_test_stores().await;
        let merger = StoreMerger::new(stores.main.clone());

        let affected = merger
            .apply_change(&save_record("pages", "p1", page_image("p1", "first")))
            .await
            .unwrap();
        assert_eq!(affected.rows("pages"), ["p1"]);

        merger
            .apply_change(&save_record("pages", "p1", page_image("p1", "second")))
            .await
            .unwrap();

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT id, title FROM pages")
            .fetch_all(&stores.main)
            .await
            .unwrap();
        assert_eq!(rows, vec![("p1".to_string(), "second".to_string())]);
    }

    #[tokio::test]
    async fn upsert_preserves_creation_timestamp() {
        let stores = open_test_stores().await;
        let merger = StoreMerger::new(stores.main.clone());

        let mut first = page_image("p1", "first");
        first["created_at"] = json!("2026-01-01T00:00:00+00:00");
        merger
            .apply_change(&save_record("pages", "p1", first))
            .await
            .unwrap();

        let mut second = page_image("p1", "second");
        second["created_at"] = json!("2026-02-02T00:00:00+00:00");
        merger
            .apply_change(&save_record("pages", "p1", second))
            .await
            .unwrap();

        let (created_at,): (String,) =
            sqlx::query_as("SELECT created_at FROM pages WHERE id = 'p1'")
                .fetch_one(&stores.main)
                .await
                .unwrap();
        assert_eq!(created_at, "2026-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn delete_change_removes_the_row_outright() {
        let stores = open_test_stores().await;
        let merger = StoreMerger::new(stores.main.clone());

        merger
            .apply_change(&save_record("pages", "p1", page_image("p1", "doomed")))
            .await
            .unwrap();

        let record = ChangeRecord {
            change_id: "pages-p1-DELETE".into(),
            table_name: "pages".into(),
            row_id: "p1".into(),
            operation: ChangeOperation::Delete,
            new_data: json!({"id": "p1"}),
            created_at: sync_epoch(),
            updated_at: sync_epoch(),
        };
        let affected = merger.apply_change(&record).await.unwrap();
        assert_eq!(affected.rows("pages"), ["p1"]);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pages")
            .fetch_one(&stores.main)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn cache_upserts_by_key_and_keeps_the_local_id() {
        let stores = open_test_stores().await;
        let merger = StoreMerger::new(stores.main.clone());

        sqlx::query(
            "INSERT INTO caches (key, value, created_at, updated_at) VALUES ('recent', '{\"value\":1}', '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')",
        )
        .execute(&stores.main)
        .await
        .unwrap();

        // A remote image carries the other device's autoincrement id; it
        // must not clobber ours.
        let image = json!({
            "id": 99,
            "key": "recent",
            "value": "{\"value\":2}",
            "created_at": "2026-01-02T00:00:00+00:00",
            "updated_at": "2026-01-02T00:00:00+00:00",
            "deleted_at": null,
        });
        merger
            .apply_change(&save_record("caches", "recent", image))
            .await
            .unwrap();

        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, key, value FROM caches")
                .fetch_all(&stores.main)
                .await
                .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, 1);
        assert_eq!(rows[0].2, "{\"value\":2}");
    }

    #[tokio::test]
    async fn config_singleton_creates_then_partially_updates() {
        let stores = open_test_stores().await;
        let merger = StoreMerger::new(stores.main.clone());

        let image = json!({
            "id": 1,
            "notion_api_key": "secret-1",
            "openai_api_key": null,
            "transcriber_source": "openai",
            "whisper_model_name": "base",
            "use_gpu": 1,
            "created_at": "2026-01-01T00:00:00+00:00",
            "updated_at": "2026-01-01T00:00:00+00:00",
            "deleted_at": null,
        });
        merger
            .apply_change(&save_record("config", "1", image))
            .await
            .unwrap();

        // Second image with nulls must not erase existing values.
        let partial = json!({
            "id": 1,
            "notion_api_key": null,
            "openai_api_key": null,
            "transcriber_source": "local",
            "whisper_model_name": null,
            "use_gpu": 0,
            "created_at": "2026-01-03T00:00:00+00:00",
            "updated_at": "2026-01-03T00:00:00+00:00",
            "deleted_at": null,
        });
        merger
            .apply_change(&save_record("config", "1", partial))
            .await
            .unwrap();

        let row: (i64, Option<String>, String, Option<String>) = sqlx::query_as(
            "SELECT id, notion_api_key, transcriber_source, whisper_model_name FROM config",
        )
        .fetch_one(&stores.main)
        .await
        .unwrap();
        assert_eq!(row.0, 1);
        assert_eq!(row.1.as_deref(), Some("secret-1"));
        assert_eq!(row.2, "local");
        assert_eq!(row.3.as_deref(), Some("base"));
    }

    #[tokio::test]
    async fn unknown_table_is_a_corrupt_blob() {
        let stores = open_test_stores().await;
        let merger = StoreMerger::new(stores.main.clone());

        let err = merger
            .apply_change(&save_record("devices", "d1", json!({"id": "d1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Sync(SyncError::CorruptBlob(_))));
    }

    #[tokio::test]
    async fn snapshot_merge_copies_every_entity_in_order() {
        let a = open_test_stores().await;
        let b = open_test_stores().await;
        let merger_a = StoreMerger::new(a.main.clone());

        merger_a
            .apply_change(&save_record("pages", "p1", page_image("p1", "from-a")))
            .await
            .unwrap();
        merger_a
            .apply_change(&save_record(
                "caches",
                "recent",
                json!({
                    "key": "recent",
                    "value": "{\"value\":[1,2]}",
                    "created_at": "2026-01-01T00:00:00+00:00",
                    "updated_at": "2026-01-01T00:00:00+00:00",
                    "deleted_at": null,
                }),
            ))
            .await
            .unwrap();

        let merger_b = StoreMerger::new(b.main.clone());
        let affected = merger_b.merge_snapshot(&a.main).await.unwrap();
        assert_eq!(affected.rows("pages"), ["p1"]);
        assert_eq!(affected.rows("caches"), ["recent"]);

        let (title,): (String,) = sqlx::query_as("SELECT title FROM pages WHERE id = 'p1'")
            .fetch_one(&b.main)
            .await
            .unwrap();
        assert_eq!(title, "from-a");
    }

    #[tokio::test]
    async fn snapshot_merge_fails_on_column_type_mismatch() {
        let a = open_test_stores().await;
        let b = open_test_stores().await;

        // Simulate a source store from a newer app version.
        sqlx::query("ALTER TABLE pages ADD COLUMN word_count INTEGER")
            .execute(&a.main)
            .await
            .unwrap();

        let merger_b = StoreMerger::new(b.main.clone());
        let err = merger_b.merge_snapshot(&a.main).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::Sync(SyncError::SchemaIncompatible { .. })
        ));
    }
}
