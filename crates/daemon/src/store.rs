//! SQLite-backed state store.
//!
//! Owns all persistence: tracked files, conversion groups, and the metadata
//! table carrying the schema version and this instance's identity. All
//! writes are transactional; `pick_due` flips a lease inside one immediate
//! transaction so concurrent planners can never claim the same row, and an
//! expired lease is reclaimable after a crash.

use crate::machine::Decision;
use crate::model::{
    FileEntry, FileRole, GroupEntry, GroupState, IntegrityStatus, ProcessedStatus, NEVER_TS,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Schema version written to `PRAGMA user_version` and the meta table.
const SCHEMA_VERSION: i64 = 1;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database was written by a newer build.
    #[error("schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    /// IO error creating the database directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Counts per status plus totals, as reported by `stats`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub total_files: u64,
    pub total_groups: u64,
    pub due_files: u64,
    pub terminal_files: u64,
    pub integrity: BTreeMap<String, u64>,
    pub processed: BTreeMap<String, u64>,
}

/// What GC removed in one pass.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct GcReport {
    pub files_removed: u64,
    pub groups_removed: u64,
}

#[derive(Debug)]
pub struct StateStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    instance_id: String,
    lease_ttl_sec: u64,
}

impl StateStore {
    /// Open (or create) the database file, apply migrations, and reclaim
    /// startup orphans.
    pub fn open(db_path: &Path, lease_ttl_sec: u64) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::init(conn, Some(db_path.to_path_buf()), lease_ttl_sec)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(lease_ttl_sec: u64) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None, lease_ttl_sec)
    }

    fn init(
        conn: Connection,
        db_path: Option<PathBuf>,
        lease_ttl_sec: u64,
    ) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        Self::migrate(&conn)?;
        let instance_id = Self::ensure_instance_id(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
            instance_id,
            lease_ttl_sec,
        };

        store.gc_orphans()?;
        info!(instance = %store.instance_id, "state store opened");
        Ok(store)
    }

    fn migrate(conn: &Connection) -> Result<(), StoreError> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version > SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }

        if version < 1 {
            debug!("initializing schema at version 1");
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    path TEXT UNIQUE NOT NULL,
                    group_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    size_observed_at INTEGER NOT NULL,
                    stable_since INTEGER,
                    integrity TEXT NOT NULL,
                    integrity_score REAL,
                    integrity_attempts INTEGER NOT NULL DEFAULT 0,
                    processed TEXT NOT NULL,
                    convert_attempts INTEGER NOT NULL DEFAULT 0,
                    has_en2 INTEGER,
                    next_check_at INTEGER NOT NULL,
                    backoff_sec INTEGER NOT NULL DEFAULT 0,
                    discovered_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    last_error TEXT,
                    lease_owner TEXT,
                    lease_deadline INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_files_due
                    ON files(next_check_at) WHERE next_check_at < {never};
                CREATE INDEX IF NOT EXISTS idx_files_group ON files(group_id);
                CREATE TABLE IF NOT EXISTS groups (
                    group_id TEXT PRIMARY KEY,
                    original_path TEXT,
                    companion_path TEXT,
                    state TEXT NOT NULL,
                    delete_original INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    finished_at INTEGER
                );
                CREATE TABLE IF NOT EXISTS meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                PRAGMA user_version = 1;",
                never = NEVER_TS
            ))?;
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }

        Ok(())
    }

    fn ensure_instance_id(conn: &Connection) -> Result<String, StoreError> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'instance_id'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => Ok(id),
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('instance_id', ?1)",
                    params![id],
                )?;
                Ok(id)
            }
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    // ── Files ────────────────────────────────────────────────────

    /// Insert or update a file keyed by path; returns the stored entry with
    /// its row id filled in.
    pub fn upsert_file(&self, entry: &FileEntry) -> Result<FileEntry, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO files (
                path, group_id, role, size_bytes, size_observed_at, stable_since,
                integrity, integrity_score, integrity_attempts,
                processed, convert_attempts, has_en2,
                next_check_at, backoff_sec, discovered_at, updated_at, last_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(path) DO UPDATE SET
                group_id = excluded.group_id,
                role = excluded.role,
                size_bytes = excluded.size_bytes,
                size_observed_at = excluded.size_observed_at,
                stable_since = excluded.stable_since,
                integrity = excluded.integrity,
                integrity_score = excluded.integrity_score,
                integrity_attempts = excluded.integrity_attempts,
                processed = excluded.processed,
                convert_attempts = excluded.convert_attempts,
                has_en2 = excluded.has_en2,
                next_check_at = excluded.next_check_at,
                backoff_sec = excluded.backoff_sec,
                updated_at = excluded.updated_at,
                last_error = excluded.last_error",
            params![
                path_str(&entry.path),
                entry.group_id,
                entry.role.as_str(),
                entry.size_bytes as i64,
                entry.size_observed_at,
                entry.stable_since,
                entry.integrity.as_str(),
                entry.integrity_score,
                entry.integrity_attempts,
                entry.processed.as_str(),
                entry.convert_attempts,
                entry.has_en2.map(|b| b as i64),
                entry.next_check_at,
                entry.backoff_sec as i64,
                entry.discovered_at,
                entry.updated_at,
                entry.last_error,
            ],
        )?;

        let id: i64 = conn.query_row(
            "SELECT id FROM files WHERE path = ?1",
            params![path_str(&entry.path)],
            |row| row.get(0),
        )?;

        let mut stored = entry.clone();
        stored.id = Some(id);
        debug!(path = %entry.path.display(), id, "file saved");
        Ok(stored)
    }

    pub fn get_file(&self, path: &Path) -> Result<Option<FileEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                &format!("{} WHERE path = ?1", SELECT_FILE),
                params![path_str(path)],
                row_to_file,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn files_in_group(&self, group_id: &str) -> Result<Vec<FileEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare(&format!("{} WHERE group_id = ?1 ORDER BY role ASC", SELECT_FILE))?;
        let entries = stmt
            .query_map(params![group_id], row_to_file)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Returns up to `limit` due entries ordered by `next_check_at` then
    /// `discovered_at`, atomically claiming a lease on each so no other
    /// picker can see them until the lease expires or `apply` clears it.
    pub fn pick_due(&self, now: i64, limit: u32) -> Result<Vec<FileEntry>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let entries = {
            let mut stmt = tx.prepare(&format!(
                "{} WHERE next_check_at <= ?1 AND next_check_at < {never}
                 AND (lease_owner IS NULL OR lease_deadline < ?1)
                 ORDER BY next_check_at ASC, discovered_at ASC
                 LIMIT ?2",
                SELECT_FILE,
                never = NEVER_TS
            ))?;
            let rows = stmt
                .query_map(params![now, limit], row_to_file)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let deadline = now + self.lease_ttl_sec as i64;
        for entry in &entries {
            tx.execute(
                "UPDATE files SET lease_owner = ?1, lease_deadline = ?2 WHERE path = ?3",
                params![self.instance_id, deadline, path_str(&entry.path)],
            )?;
        }

        tx.commit()?;
        Ok(entries)
    }

    /// Writes a machine decision back and clears the lease. Nothing else
    /// ever mutates a picked row.
    pub fn apply(&self, path: &Path, decision: &Decision, now: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE files SET
                size_bytes = ?1,
                size_observed_at = ?2,
                stable_since = ?3,
                integrity = ?4,
                integrity_score = ?5,
                integrity_attempts = ?6,
                processed = ?7,
                convert_attempts = ?8,
                has_en2 = ?9,
                next_check_at = ?10,
                backoff_sec = ?11,
                updated_at = ?12,
                last_error = ?13,
                lease_owner = NULL,
                lease_deadline = NULL
             WHERE path = ?14",
            params![
                decision.size_bytes as i64,
                decision.size_observed_at,
                decision.stable_since,
                decision.integrity.as_str(),
                decision.integrity_score,
                decision.integrity_attempts,
                decision.processed.as_str(),
                decision.convert_attempts,
                decision.has_en2.map(|b| b as i64),
                decision.next_check_at,
                decision.backoff_sec as i64,
                now,
                decision.last_error,
                path_str(path),
            ],
        )?;
        Ok(())
    }

    /// Pushes a leased row's wake-up past the integrity deadline while the
    /// check runs, so a crash mid-check leaves it reclaimable afterwards.
    /// The lease stays in place.
    pub fn reschedule_for_timeout(
        &self,
        path: &Path,
        next_check_at: i64,
        now: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE files SET next_check_at = ?1, updated_at = ?2 WHERE path = ?3",
            params![next_check_at, now, path_str(path)],
        )?;
        Ok(())
    }

    /// Parks a record forever with the given processed status.
    pub fn mark_terminal(
        &self,
        path: &Path,
        processed: ProcessedStatus,
        now: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE files SET processed = ?1, next_check_at = ?2, updated_at = ?3,
             lease_owner = NULL, lease_deadline = NULL WHERE path = ?4",
            params![processed.as_str(), NEVER_TS, now, path_str(path)],
        )?;
        Ok(())
    }

    /// Re-discovery of a known path only refreshes the observation time;
    /// everything else belongs to the planner.
    pub fn touch_size_observed(&self, path: &Path, now: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE files SET size_observed_at = ?1, updated_at = ?1 WHERE path = ?2",
            params![now, path_str(path)],
        )?;
        Ok(())
    }

    /// Releases the lease and pushes the wake-up out, without touching any
    /// other field. Used when a decision must not be persisted.
    pub fn defer(&self, path: &Path, next_check_at: i64, now: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE files SET next_check_at = ?1, updated_at = ?2,
             lease_owner = NULL, lease_deadline = NULL WHERE path = ?3",
            params![next_check_at, now, path_str(path)],
        )?;
        Ok(())
    }

    pub fn release_lease(&self, path: &Path) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE files SET lease_owner = NULL, lease_deadline = NULL WHERE path = ?1",
            params![path_str(path)],
        )?;
        Ok(())
    }

    /// Drops every lease held by this instance (graceful shutdown).
    pub fn release_own_leases(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE files SET lease_owner = NULL, lease_deadline = NULL WHERE lease_owner = ?1",
            params![self.instance_id],
        )?;
        Ok(n as u64)
    }

    /// Leases already past their deadline but never cleared: a crashed or
    /// wedged handler left them behind.
    pub fn stuck_lease_count(&self, now: i64) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE lease_owner IS NOT NULL AND lease_deadline < ?1",
            params![now],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    // ── Groups ───────────────────────────────────────────────────

    pub fn get_group(&self, group_id: &str) -> Result<Option<GroupEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let group = conn
            .query_row(
                "SELECT group_id, original_path, companion_path, state, delete_original,
                        created_at, finished_at
                 FROM groups WHERE group_id = ?1",
                params![group_id],
                row_to_group,
            )
            .optional()?;
        Ok(group)
    }

    pub fn upsert_group(&self, group: &GroupEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO groups (
                group_id, original_path, companion_path, state, delete_original,
                created_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                group.group_id,
                group.original_path.as_ref().map(|p| path_str(p)),
                group.companion_path.as_ref().map(|p| path_str(p)),
                group.state.as_str(),
                group.delete_original as i64,
                group.created_at,
                group.finished_at,
            ],
        )?;
        Ok(())
    }

    /// Recomputes a group from its member rows: presence, state, and the
    /// completion rule. When the rule holds the group finalizes and every
    /// satisfied member flips to `GroupProcessed`, parked forever.
    ///
    /// Completion rule:
    /// - an original that already carried an English 2.0 track completes
    ///   the group by itself;
    /// - `delete_original = true`: a companion with verified integrity and
    ///   settled processing is sufficient;
    /// - `delete_original = false`: both members must have verified
    ///   integrity and settled processing.
    pub fn sync_group(
        &self,
        group_id: &str,
        now: i64,
        default_delete_original: bool,
    ) -> Result<Option<GroupEntry>, StoreError> {
        let members = self.files_in_group(group_id)?;

        if members.is_empty() {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM groups WHERE group_id = ?1", params![group_id])?;
            return Ok(None);
        }

        let mut group = match self.get_group(group_id)? {
            Some(g) => g,
            None => GroupEntry::new(group_id, default_delete_original, now),
        };

        let live = |f: &&FileEntry| {
            !matches!(
                f.processed,
                ProcessedStatus::Ignored | ProcessedStatus::Duplicate
            )
        };
        let original = members
            .iter()
            .filter(live)
            .find(|f| f.role == FileRole::Original);
        let companion = members
            .iter()
            .filter(live)
            .find(|f| f.role == FileRole::StereoCompanion);

        group.original_path = original.map(|f| f.path.clone());
        group.companion_path = companion.map(|f| f.path.clone());

        if group.state == GroupState::Processed {
            self.upsert_group(&group)?;
            return Ok(Some(group));
        }

        let finished = |f: &FileEntry| {
            f.integrity == IntegrityStatus::Complete
                && matches!(
                    f.processed,
                    ProcessedStatus::SkippedHasEn2
                        | ProcessedStatus::Converted
                        | ProcessedStatus::GroupProcessed
                )
        };

        let exhausted = members.iter().any(|f| {
            f.processed == ProcessedStatus::ConvertFailed && f.next_check_at >= NEVER_TS
        });

        let skip_complete = original
            .map(|f| finished(f) && f.processed == ProcessedStatus::SkippedHasEn2)
            .unwrap_or(false);

        let rule_met = skip_complete
            || if group.delete_original {
                companion.map(finished).unwrap_or(false)
            } else {
                original.map(finished).unwrap_or(false)
                    && companion.map(finished).unwrap_or(false)
            };

        if rule_met {
            let mut state = group.state;
            if state.can_transition_to(GroupState::ReadyToFinalize) {
                state = GroupState::ReadyToFinalize;
            }
            if state.can_transition_to(GroupState::Processed) {
                state = GroupState::Processed;
            }
            group.state = state;
            group.finished_at = Some(now);
            self.upsert_group(&group)?;

            // Members flip to GroupProcessed only when an actual pair was
            // produced; an original that never needed conversion keeps its
            // own terminal status
            let mut flipped = 0u32;
            if companion.is_some() {
                for member in &members {
                    if matches!(
                        member.processed,
                        ProcessedStatus::SkippedHasEn2 | ProcessedStatus::Converted
                    ) {
                        self.mark_terminal(&member.path, ProcessedStatus::GroupProcessed, now)?;
                        flipped += 1;
                    }
                }
            }
            info!(group = group_id, members = flipped, "group finalized");
        } else {
            let converting = members.iter().any(|f| {
                matches!(
                    f.processed,
                    ProcessedStatus::GroupPendingPair | ProcessedStatus::ConvertFailed
                ) || f.role == FileRole::StereoCompanion
            });
            let target = if exhausted {
                GroupState::Failed
            } else if converting {
                GroupState::PendingPair
            } else {
                GroupState::Forming
            };
            if group.state.can_transition_to(target) {
                group.state = target;
            }
            self.upsert_group(&group)?;
        }

        Ok(Some(group))
    }

    // ── Maintenance ──────────────────────────────────────────────

    /// Removes terminal records past the retention window, trims overflow
    /// beyond `max_entries`, and drops groups with no members left.
    pub fn gc(&self, now: i64, keep_days: u64, max_entries: u64) -> Result<GcReport, StoreError> {
        let cutoff = now - (keep_days as i64) * 86_400;
        let conn = self.conn.lock().unwrap();

        let mut files_removed = conn.execute(
            &format!(
                "DELETE FROM files WHERE next_check_at >= {never} AND updated_at < ?1",
                never = NEVER_TS
            ),
            params![cutoff],
        )? as u64;

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        if total as u64 > max_entries {
            let excess = total as u64 - max_entries;
            files_removed += conn.execute(
                "DELETE FROM files WHERE id IN (
                    SELECT id FROM files ORDER BY updated_at ASC LIMIT ?1
                )",
                params![excess as i64],
            )? as u64;
        }

        let groups_removed = conn.execute(
            "DELETE FROM groups WHERE group_id NOT IN (SELECT DISTINCT group_id FROM files)",
            [],
        )? as u64;

        if files_removed > 0 || groups_removed > 0 {
            info!(files = files_removed, groups = groups_removed, "gc pass done");
        }

        Ok(GcReport {
            files_removed,
            groups_removed,
        })
    }

    /// Startup pass over orphaned references: memberless groups are dropped
    /// and files pointing at a missing group get a placeholder row so the
    /// reference is valid again.
    fn gc_orphans(&self) -> Result<(), StoreError> {
        let missing: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT DISTINCT group_id FROM files
                 WHERE group_id NOT IN (SELECT group_id FROM groups)",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;

            conn.execute(
                "DELETE FROM groups WHERE group_id NOT IN (SELECT DISTINCT group_id FROM files)",
                [],
            )?;
            ids
        };

        for group_id in missing {
            let created: i64 = {
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    "SELECT MIN(discovered_at) FROM files WHERE group_id = ?1",
                    params![group_id],
                    |row| row.get(0),
                )?
            };
            self.sync_group(&group_id, created, false)?;
        }

        Ok(())
    }

    pub fn vacuum(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("VACUUM")?;
        info!("database compacted");
        Ok(())
    }

    /// Drops all state and recreates an empty schema.
    pub fn reset(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "DROP TABLE IF EXISTS files;
             DROP TABLE IF EXISTS groups;
             DROP TABLE IF EXISTS meta;
             PRAGMA user_version = 0;",
        )?;
        Self::migrate(&conn)?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('instance_id', ?1)",
            params![self.instance_id],
        )?;
        info!("state store reset");
        Ok(())
    }

    // ── Introspection ────────────────────────────────────────────

    pub fn stats(&self, now: i64) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock().unwrap();

        let total_files: i64 =
            conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        let total_groups: i64 =
            conn.query_row("SELECT COUNT(*) FROM groups", [], |row| row.get(0))?;
        let due_files: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM files WHERE next_check_at <= ?1 AND next_check_at < {never}",
                never = NEVER_TS
            ),
            params![now],
            |row| row.get(0),
        )?;
        let terminal_files: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM files WHERE next_check_at >= {never}",
                never = NEVER_TS
            ),
            [],
            |row| row.get(0),
        )?;

        let mut integrity = BTreeMap::new();
        let mut stmt =
            conn.prepare("SELECT integrity, COUNT(*) FROM files GROUP BY integrity")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            integrity.insert(status, count as u64);
        }

        let mut processed = BTreeMap::new();
        let mut stmt =
            conn.prepare("SELECT processed, COUNT(*) FROM files GROUP BY processed")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            processed.insert(status, count as u64);
        }

        Ok(StoreStats {
            total_files: total_files as u64,
            total_groups: total_groups as u64,
            due_files: due_files as u64,
            terminal_files: terminal_files as u64,
            integrity,
            processed,
        })
    }

    /// Earliest pending wake-up, ignoring parked records.
    pub fn earliest_next_check(&self) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let earliest: Option<i64> = conn.query_row(
            &format!(
                "SELECT MIN(next_check_at) FROM files WHERE next_check_at < {never}",
                never = NEVER_TS
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(earliest)
    }

    pub fn db_size_bytes(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok((page_count * page_size) as u64)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

const SELECT_FILE: &str = "SELECT id, path, group_id, role, size_bytes, size_observed_at,
    stable_since, integrity, integrity_score, integrity_attempts, processed,
    convert_attempts, has_en2, next_check_at, backoff_sec, discovered_at,
    updated_at, last_error FROM files";

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_failure(what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unrecognized {} value {:?}", what, value),
        )),
    )
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileEntry> {
    let integrity_raw: String = row.get(7)?;
    let processed_raw: String = row.get(10)?;
    let role_raw: String = row.get(3)?;

    Ok(FileEntry {
        id: Some(row.get(0)?),
        path: PathBuf::from(row.get::<_, String>(1)?),
        group_id: row.get(2)?,
        role: FileRole::parse(&role_raw).ok_or_else(|| parse_failure("role", &role_raw))?,
        size_bytes: row.get::<_, i64>(4)? as u64,
        size_observed_at: row.get(5)?,
        stable_since: row.get(6)?,
        integrity: IntegrityStatus::parse(&integrity_raw)
            .ok_or_else(|| parse_failure("integrity", &integrity_raw))?,
        integrity_score: row.get(8)?,
        integrity_attempts: row.get(9)?,
        processed: ProcessedStatus::parse(&processed_raw)
            .ok_or_else(|| parse_failure("processed", &processed_raw))?,
        convert_attempts: row.get(11)?,
        has_en2: row.get::<_, Option<i64>>(12)?.map(|v| v != 0),
        next_check_at: row.get(13)?,
        backoff_sec: row.get::<_, i64>(14)? as u64,
        discovered_at: row.get(15)?,
        updated_at: row.get(16)?,
        last_error: row.get(17)?,
    })
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupEntry> {
    let state_raw: String = row.get(3)?;
    Ok(GroupEntry {
        group_id: row.get(0)?,
        original_path: row.get::<_, Option<String>>(1)?.map(PathBuf::from),
        companion_path: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
        state: GroupState::parse(&state_raw).ok_or_else(|| parse_failure("state", &state_raw))?,
        delete_original: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        finished_at: row.get(6)?,
    })
}
