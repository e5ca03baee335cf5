/// Merge rules for one replicated entity. Populated at startup instead of
/// inspecting row types at runtime; the merger drives everything off this
/// table.
#[derive(Debug, Clone, Copy)]
pub struct EntityDescriptor {
    pub table: &'static str,
    /// Column carrying the row's logical identity: the ChangeID row-id and
    /// the delete key. The primary key for pages and config; the unique
    /// `key` for caches, whose autoincrement ids differ across devices.
    pub identity_column: &'static str,
    pub pk_column: &'static str,
    pub conflict_columns: &'static [&'static str],
    /// Columns never written during a merge (caches omit `id` so the local
    /// autoincrement stays authoritative).
    pub omit_columns: &'static [&'static str],
    /// Singleton-row replacement strategy (config).
    pub singleton: bool,
}

const CONFIG: EntityDescriptor = EntityDescriptor {
    table: "config",
    identity_column: "id",
    pk_column: "id",
    conflict_columns: &["id"],
    omit_columns: &[],
    singleton: true,
};

const PAGES: EntityDescriptor = EntityDescriptor {
    table: "pages",
    identity_column: "id",
    pk_column: "id",
    conflict_columns: &["id"],
    omit_columns: &[],
    singleton: false,
};

const CACHES: EntityDescriptor = EntityDescriptor {
    table: "caches",
    identity_column: "key",
    pk_column: "id",
    conflict_columns: &["key"],
    omit_columns: &["id"],
    singleton: false,
};

/// All replicated entities in the fixed snapshot-merge order.
pub fn descriptors() -> &'static [EntityDescriptor] {
    &[CONFIG, PAGES, CACHES]
}

pub fn descriptor_for(table: &str) -> Option<&'static EntityDescriptor> {
    descriptors().iter().find(|d| d.table == table)
}
