//! Database schema definitions for the reference store.
//!
//! Timestamps are stored as microseconds since the epoch so that ordering
//! survives sub-second precision. JSON columns hold serde-serialized domain
//! values whose internal structure the store does not query.

pub const CREATE_REFERENCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS "references" (
    id TEXT PRIMARY KEY NOT NULL,
    visibility TEXT NOT NULL DEFAULT 'public',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// Identifier uniqueness is per reference on (type, value), plus the scheme
/// for "other" identifiers; the scheme column is '' for well-known types so
/// the unique index bites (SQLite treats NULLs as distinct). Distinct
/// references may legitimately share an identifier value while the
/// deduplication pipeline heals them into one tree.
pub const CREATE_EXTERNAL_IDENTIFIERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS external_identifiers (
    id TEXT PRIMARY KEY NOT NULL,
    reference_id TEXT NOT NULL REFERENCES "references"(id),
    identifier_type TEXT NOT NULL,
    identifier_value TEXT NOT NULL,
    other_identifier_name TEXT NOT NULL DEFAULT '',
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

pub const CREATE_EXTERNAL_IDENTIFIERS_UNIQUE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_external_identifiers_unique
ON external_identifiers(reference_id, identifier_type, identifier_value, other_identifier_name)
"#;

pub const CREATE_EXTERNAL_IDENTIFIERS_REFERENCE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_external_identifiers_reference
ON external_identifiers(reference_id)
"#;

pub const CREATE_ENHANCEMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS enhancements (
    id TEXT PRIMARY KEY NOT NULL,
    reference_id TEXT NOT NULL REFERENCES "references"(id),
    source TEXT NOT NULL,
    visibility TEXT NOT NULL DEFAULT 'public',
    robot_version TEXT,
    derived_from TEXT,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

pub const CREATE_ENHANCEMENTS_REFERENCE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_enhancements_reference
ON enhancements(reference_id)
"#;

/// Decisions deliberately carry no foreign key on reference_id: an exact
/// duplicate's decision survives while the reference itself is never
/// persisted.
pub const CREATE_DUPLICATE_DECISIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS reference_duplicate_decisions (
    id TEXT PRIMARY KEY NOT NULL,
    reference_id TEXT NOT NULL,
    duplicate_determination TEXT NOT NULL,
    fingerprint TEXT,
    candidate_canonical_ids TEXT NOT NULL DEFAULT '[]',
    canonical_reference_id TEXT,
    active_decision INTEGER NOT NULL DEFAULT 0,
    detail TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// At most one active decision per reference.
pub const CREATE_DUPLICATE_DECISIONS_ACTIVE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_duplicate_decisions_one_active
ON reference_duplicate_decisions(reference_id)
WHERE active_decision = 1
"#;

pub const CREATE_DUPLICATE_DECISIONS_CANONICAL_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_duplicate_decisions_canonical
ON reference_duplicate_decisions(canonical_reference_id)
"#;

pub const CREATE_IMPORT_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS import_records (
    id TEXT PRIMARY KEY NOT NULL,
    processor_name TEXT NOT NULL,
    processor_version TEXT NOT NULL,
    source_name TEXT NOT NULL,
    search_string TEXT,
    notes TEXT,
    expected_reference_count INTEGER NOT NULL DEFAULT -1,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

pub const CREATE_IMPORT_BATCHES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS import_batches (
    id TEXT PRIMARY KEY NOT NULL,
    import_record_id TEXT NOT NULL REFERENCES import_records(id),
    storage_url TEXT NOT NULL,
    callback_url TEXT,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(import_record_id, storage_url)
)
"#;

pub const CREATE_IMPORT_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS import_results (
    id TEXT PRIMARY KEY NOT NULL,
    import_batch_id TEXT NOT NULL REFERENCES import_batches(id),
    status TEXT NOT NULL,
    reference_id TEXT,
    failure_details TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

pub const CREATE_IMPORT_RESULTS_BATCH_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_import_results_batch
ON import_results(import_batch_id)
"#;

pub const CREATE_ROBOTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS robots (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL UNIQUE,
    base_url TEXT NOT NULL,
    description TEXT NOT NULL,
    owner TEXT NOT NULL,
    client_secret TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

pub const CREATE_ROBOT_AUTOMATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS robot_automations (
    id TEXT PRIMARY KEY NOT NULL,
    robot_id TEXT NOT NULL REFERENCES robots(id),
    query TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(robot_id, query)
)
"#;

pub const CREATE_ENHANCEMENT_REQUESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS enhancement_requests (
    id TEXT PRIMARY KEY NOT NULL,
    robot_id TEXT NOT NULL REFERENCES robots(id),
    reference_ids TEXT NOT NULL,
    request_status TEXT NOT NULL,
    source TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

pub const CREATE_PENDING_ENHANCEMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pending_enhancements (
    id TEXT PRIMARY KEY NOT NULL,
    reference_id TEXT NOT NULL,
    robot_id TEXT NOT NULL REFERENCES robots(id),
    enhancement_request_id TEXT REFERENCES enhancement_requests(id),
    robot_enhancement_batch_id TEXT REFERENCES robot_enhancement_batches(id),
    source TEXT,
    status TEXT NOT NULL,
    expires_at INTEGER,
    retry_of TEXT REFERENCES pending_enhancements(id),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

pub const CREATE_PENDING_ENHANCEMENTS_POLL_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pending_enhancements_poll
ON pending_enhancements(robot_id, status, robot_enhancement_batch_id, created_at)
"#;

pub const CREATE_PENDING_ENHANCEMENTS_EXPIRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pending_enhancements_expiry
ON pending_enhancements(status, expires_at)
"#;

pub const CREATE_ROBOT_ENHANCEMENT_BATCHES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS robot_enhancement_batches (
    id TEXT PRIMARY KEY NOT NULL,
    robot_id TEXT NOT NULL REFERENCES robots(id),
    reference_data_file TEXT,
    result_file TEXT,
    validation_result_file TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// Every statement, in dependency order.
pub const ALL_STATEMENTS: &[&str] = &[
    CREATE_REFERENCES_TABLE,
    CREATE_EXTERNAL_IDENTIFIERS_TABLE,
    CREATE_EXTERNAL_IDENTIFIERS_UNIQUE_INDEX,
    CREATE_EXTERNAL_IDENTIFIERS_REFERENCE_INDEX,
    CREATE_ENHANCEMENTS_TABLE,
    CREATE_ENHANCEMENTS_REFERENCE_INDEX,
    CREATE_DUPLICATE_DECISIONS_TABLE,
    CREATE_DUPLICATE_DECISIONS_ACTIVE_INDEX,
    CREATE_DUPLICATE_DECISIONS_CANONICAL_INDEX,
    CREATE_IMPORT_RECORDS_TABLE,
    CREATE_IMPORT_BATCHES_TABLE,
    CREATE_IMPORT_RESULTS_TABLE,
    CREATE_IMPORT_RESULTS_BATCH_INDEX,
    CREATE_ROBOTS_TABLE,
    CREATE_ROBOT_AUTOMATIONS_TABLE,
    CREATE_ENHANCEMENT_REQUESTS_TABLE,
    CREATE_PENDING_ENHANCEMENTS_TABLE,
    CREATE_PENDING_ENHANCEMENTS_POLL_INDEX,
    CREATE_PENDING_ENHANCEMENTS_EXPIRY_INDEX,
    CREATE_ROBOT_ENHANCEMENT_BATCHES_TABLE,
];
