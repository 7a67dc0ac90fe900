//! Embedded DDL, applied idempotently at driver construction. The SQLite
//! dialect stores timestamps as integer milliseconds and JSON as text; the
//! PostgreSQL dialect uses TIMESTAMPTZ and JSONB.

pub(crate) const SQLITE_SCHEMA: &[&str] = &[
    r##"CREATE TABLE IF NOT EXISTS queue_jobs (
        id TEXT PRIMARY KEY,
        queue TEXT NOT NULL,
        idempotency_key TEXT,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER,
        attempts_made INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        backoff TEXT NOT NULL,
        scheduled_for INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        started_at INTEGER,
        ended_at INTEGER,
        locked_by TEXT,
        locked_at INTEGER,
        expires_at INTEGER,
        last_error TEXT,
        stages TEXT,
        current_stage TEXT,
        overall_progress INTEGER,
        metadata TEXT,
        artifacts TEXT
    )"##,
    r##"CREATE UNIQUE INDEX IF NOT EXISTS queue_jobs_queue_key
        ON queue_jobs (queue, idempotency_key)
        WHERE idempotency_key IS NOT NULL"##,
    r##"CREATE INDEX IF NOT EXISTS queue_jobs_claim
        ON queue_jobs (queue, status, scheduled_for, priority, created_at)"##,
    r##"CREATE TABLE IF NOT EXISTS queue_schedules (
        key TEXT PRIMARY KEY,
        queue TEXT NOT NULL,
        cron TEXT,
        interval_ms INTEGER,
        run_at INTEGER,
        payload TEXT NOT NULL,
        "limit" INTEGER,
        end_date INTEGER,
        run_count INTEGER NOT NULL DEFAULT 0,
        next_run_at INTEGER,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )"##,
    r##"CREATE INDEX IF NOT EXISTS queue_schedules_due
        ON queue_schedules (enabled, next_run_at)"##,
];

pub(crate) const POSTGRES_SCHEMA: &[&str] = &[
    r##"CREATE TABLE IF NOT EXISTS queue_jobs (
        id TEXT PRIMARY KEY,
        queue TEXT NOT NULL,
        idempotency_key TEXT,
        payload JSONB NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER,
        attempts_made INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        backoff JSONB NOT NULL,
        scheduled_for TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        ended_at TIMESTAMPTZ,
        locked_by TEXT,
        locked_at TIMESTAMPTZ,
        expires_at TIMESTAMPTZ,
        last_error JSONB,
        stages JSONB,
        current_stage TEXT,
        overall_progress INTEGER,
        metadata JSONB,
        artifacts JSONB
    )"##,
    r##"CREATE UNIQUE INDEX IF NOT EXISTS queue_jobs_queue_key
        ON queue_jobs (queue, idempotency_key)
        WHERE idempotency_key IS NOT NULL"##,
    r##"CREATE INDEX IF NOT EXISTS queue_jobs_claim
        ON queue_jobs (queue, status, scheduled_for, priority, created_at)"##,
    r##"CREATE TABLE IF NOT EXISTS queue_schedules (
        key TEXT PRIMARY KEY,
        queue TEXT NOT NULL,
        cron TEXT,
        interval_ms BIGINT,
        run_at TIMESTAMPTZ,
        payload JSONB NOT NULL,
        "limit" INTEGER,
        end_date TIMESTAMPTZ,
        run_count INTEGER NOT NULL DEFAULT 0,
        next_run_at TIMESTAMPTZ,
        enabled BOOLEAN NOT NULL DEFAULT true,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )"##,
    r##"CREATE INDEX IF NOT EXISTS queue_schedules_due
        ON queue_schedules (enabled, next_run_at)"##,
];
