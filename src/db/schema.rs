//! Database schema definitions

/// Live table serving reads
pub const LIVE_TABLE: &str = "logs";
/// Write-optimized table absorbing a full reload
pub const STAGING_TABLE: &str = "logs_staging";
/// Previous live table, one generation only
pub const BACKUP_TABLE: &str = "logs_backup";
/// Daily rollup grouped by username, status and day
pub const ROLLUP_TABLE: &str = "logs_daily_rollup";

/// Column layout shared by the live, staging and backup tables.
pub fn create_logs_table(name: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {name} (
            id INTEGER PRIMARY KEY,
            time BIGINT NOT NULL,
            ip TEXT,
            username TEXT,
            url TEXT,
            status_code INTEGER,
            domain TEXT,
            response_time_ms INTEGER,
            response_size_bytes BIGINT,
            action TEXT
        )
        "#
    )
}

pub const CREATE_STATUSES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS log_statuses (
    status_code INTEGER PRIMARY KEY,
    created_at BIGINT NOT NULL
)
"#;

pub const CREATE_ACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS log_actions (
    action TEXT PRIMARY KEY,
    created_at BIGINT NOT NULL
)
"#;

pub const CREATE_AGGREGATED_STATS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS aggregated_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    period_start BIGINT,             -- NULL + NULL with is_default = 1 means all data
    period_end BIGINT,
    total_requests BIGINT NOT NULL DEFAULT 0,
    error_requests BIGINT NOT NULL DEFAULT 0,
    unique_ips BIGINT NOT NULL DEFAULT 0,
    avg_response_time REAL NOT NULL DEFAULT 0,
    total_traffic_mb REAL NOT NULL DEFAULT 0,
    status_distribution TEXT,        -- JSON: {"2xx": 10, "3xx": 0, ...}
    hourly_distribution TEXT,        -- JSON: [24 counts]
    top_urls TEXT,                   -- JSON: [{"url": .., "count": ..}]
    top_users TEXT,                  -- JSON: [{"username": .., "count": ..}]
    is_default BOOLEAN NOT NULL DEFAULT 0,
    created_at BIGINT NOT NULL
)
"#;

pub const CREATE_INDEX_STATS_PERIOD: &str =
    "CREATE INDEX IF NOT EXISTS idx_aggregated_stats_period ON aggregated_stats(period_start, period_end)";

pub const CREATE_INDEX_STATS_DEFAULT: &str =
    "CREATE INDEX IF NOT EXISTS idx_aggregated_stats_default ON aggregated_stats(is_default, created_at DESC)";

pub const CREATE_PRECALCULATED_TOPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS precalculated_tops (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,              -- 'urls' or 'users'
    limit_count INTEGER NOT NULL,
    data TEXT NOT NULL,              -- JSON list of entries
    calculated_at BIGINT NOT NULL,
    UNIQUE(type, limit_count)
)
"#;

/// An index the live table should carry.
pub struct IndexDef {
    pub name: &'static str,
    pub sql: &'static str,
}

// === LIVE TABLE INDEXES ===
// Names are schema-wide in SQLite, so the backup table must not keep them.

pub const LIVE_INDEXES: &[IndexDef] = &[
    IndexDef {
        name: "idx_logs_time",
        sql: "CREATE INDEX idx_logs_time ON logs(time)",
    },
    IndexDef {
        name: "idx_logs_ip",
        sql: "CREATE INDEX idx_logs_ip ON logs(ip)",
    },
    IndexDef {
        name: "idx_logs_username",
        sql: "CREATE INDEX idx_logs_username ON logs(username)",
    },
    IndexDef {
        name: "idx_logs_status",
        sql: "CREATE INDEX idx_logs_status ON logs(status_code)",
    },
    IndexDef {
        name: "idx_logs_domain",
        sql: "CREATE INDEX idx_logs_domain ON logs(domain)",
    },
    // LIKE 'prefix%' can only use an index with the same collation as LIKE
    IndexDef {
        name: "idx_logs_url_prefix",
        sql: "CREATE INDEX idx_logs_url_prefix ON logs(url COLLATE NOCASE)",
    },
    IndexDef {
        name: "idx_logs_slow_responses",
        sql: "CREATE INDEX idx_logs_slow_responses ON logs(response_time_ms, time) WHERE response_time_ms > 1000",
    },
    IndexDef {
        name: "idx_logs_large_responses",
        sql: "CREATE INDEX idx_logs_large_responses ON logs(response_size_bytes, url) WHERE response_size_bytes > 1048576",
    },
    IndexDef {
        name: "idx_logs_error_status",
        sql: "CREATE INDEX idx_logs_error_status ON logs(status_code, time) WHERE status_code >= 400",
    },
    IndexDef {
        name: "idx_logs_action",
        sql: "CREATE INDEX idx_logs_action ON logs(action)",
    },
];

// === DAILY ROLLUP ===

pub const CREATE_ROLLUP_TABLE: &str = r#"
CREATE TABLE logs_daily_rollup AS
SELECT
    username,
    status_code,
    date(time / 1000, 'unixepoch') AS day,
    COUNT(*) AS request_count,
    CAST(TOTAL(response_size_bytes) AS INTEGER) AS total_bytes
FROM logs
GROUP BY username, status_code, day
"#;

pub const CREATE_INDEX_ROLLUP: &str =
    "CREATE INDEX IF NOT EXISTS idx_rollup_day_user ON logs_daily_rollup(day, username, status_code)";

pub const CLEAR_ROLLUP: &str = "DELETE FROM logs_daily_rollup";

pub const REFRESH_ROLLUP: &str = r#"
INSERT INTO logs_daily_rollup (username, status_code, day, request_count, total_bytes)
SELECT
    username,
    status_code,
    date(time / 1000, 'unixepoch') AS day,
    COUNT(*),
    CAST(TOTAL(response_size_bytes) AS INTEGER)
FROM logs
GROUP BY username, status_code, day
"#;
