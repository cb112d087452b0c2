// Session and ACL oracle.
//
// Users, sessions, and per-document write grants live in a small SQLite
// database. The relay asks exactly one question of this module per
// connection: "can the holder of this session cookie write to this
// document?" — answered once at connect time and never re-evaluated.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};

pub const SESSION_TTL_DAYS: i64 = 30;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id   TEXT NOT NULL UNIQUE,
    username      TEXT NOT NULL,
    display_name  TEXT NULL,
    created_at    TEXT NOT NULL DEFAULT (datetime('now')),
    last_login    TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    user_id     INTEGER NOT NULL REFERENCES users (id),
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    expires_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS document_grants (
    doc_id      TEXT NOT NULL,
    user_id     INTEGER NOT NULL REFERENCES users (id),
    granted_at  TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (doc_id, user_id)
);
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub external_id: String,
    pub username: String,
    pub display_name: Option<String>,
}

pub struct AclStore {
    conn: Mutex<Connection>,
}

impl AclStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create auth db directory {}", dir.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open auth db at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        conn.execute_batch(SCHEMA_SQL).context("failed to apply auth schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory auth db")?;
        conn.execute_batch(SCHEMA_SQL).context("failed to apply auth schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or refresh a user keyed by the identity provider's id.
    pub fn upsert_user(
        &self,
        external_id: &str,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<User> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO users (external_id, username, display_name, last_login)
            VALUES (?1, ?2, ?3, datetime('now'))
            ON CONFLICT (external_id) DO UPDATE SET
                username = excluded.username,
                display_name = excluded.display_name,
                last_login = datetime('now')
            "#,
            params![external_id, username, display_name],
        )
        .context("failed to upsert user")?;

        conn.query_row(
            "SELECT id, external_id, username, display_name FROM users WHERE external_id = ?1",
            params![external_id],
            user_from_row,
        )
        .context("failed to read back upserted user")
    }

    /// Mint a session token for a user. The token is 32 random bytes, hex
    /// encoded; expiry is stored as RFC 3339 text.
    pub fn create_session(&self, user_id: i64, ttl: Duration) -> Result<String> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = raw.iter().fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        });
        let expires_at = (Utc::now() + ttl).to_rfc3339();

        self.conn()
            .execute(
                "INSERT INTO sessions (id, user_id, expires_at) VALUES (?1, ?2, ?3)",
                params![token, user_id, expires_at],
            )
            .context("failed to insert session")?;
        Ok(token)
    }

    /// Look up a session and return its user, or `None` for an unknown or
    /// expired token. An expired row is deleted during the lookup.
    pub fn resolve_session(&self, token: &str) -> Result<Option<User>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                r#"
                SELECT u.id, u.external_id, u.username, u.display_name, s.expires_at
                FROM sessions s
                JOIN users u ON u.id = s.user_id
                WHERE s.id = ?1
                "#,
                params![token],
                |row| Ok((user_from_row(row)?, row.get::<_, String>(4)?)),
            )
            .optional()
            .context("failed to query session")?;

        let Some((user, expires_at)) = row else {
            return Ok(None);
        };

        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .with_context(|| format!("session for user {} has unparseable expiry", user.id))?;
        if expires_at < Utc::now() {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![token])
                .context("failed to delete expired session")?;
            return Ok(None);
        }
        Ok(Some(user))
    }

    pub fn delete_session(&self, token: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM sessions WHERE id = ?1", params![token])
            .context("failed to delete session")?;
        Ok(())
    }

    pub fn grant_write(&self, doc_id: &str, user_id: i64) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO document_grants (doc_id, user_id) VALUES (?1, ?2)",
                params![doc_id, user_id],
            )
            .context("failed to insert grant")?;
        Ok(())
    }

    pub fn revoke_write(&self, doc_id: &str, user_id: i64) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM document_grants WHERE doc_id = ?1 AND user_id = ?2",
                params![doc_id, user_id],
            )
            .context("failed to delete grant")?;
        Ok(())
    }

    pub fn has_write_grant(&self, doc_id: &str, user_id: i64) -> Result<bool> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM document_grants WHERE doc_id = ?1 AND user_id = ?2",
                params![doc_id, user_id],
                |row| row.get(0),
            )
            .context("failed to query grant")?;
        Ok(count > 0)
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.conn()
            .query_row(
                "SELECT id, external_id, username, display_name FROM users WHERE username = ?1",
                params![username],
                user_from_row,
            )
            .optional()
            .context("failed to query user by username")
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        external_id: row.get(1)?,
        username: row.get(2)?,
        display_name: row.get(3)?,
    })
}

/// Extract the `session` cookie value from a raw `Cookie` header.
pub fn parse_session_cookie(header: &str) -> Option<&str> {
    header.split(';').map(str::trim).find_map(|part| part.strip_prefix("session="))
}

/// The write decision for one connection, computed once at connect time.
#[derive(Debug, Clone)]
pub struct WriteDecision {
    pub user: Option<User>,
    pub can_write: bool,
}

impl WriteDecision {
    pub fn denied() -> Self {
        Self { user: None, can_write: false }
    }

    pub fn username(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.username.as_str())
    }
}

/// Answers "can this session write to this document": superuser override
/// first, explicit grant otherwise.
pub struct AclOracle {
    store: AclStore,
    superusers: HashSet<String>,
}

impl AclOracle {
    pub fn new(store: AclStore, superusers: impl IntoIterator<Item = String>) -> Self {
        let superusers = superusers.into_iter().map(|name| name.to_lowercase()).collect();
        Self { store, superusers }
    }

    pub fn store(&self) -> &AclStore {
        &self.store
    }

    /// Case-insensitive membership in the configured allowlist.
    pub fn is_superuser(&self, username: &str) -> bool {
        self.superusers.contains(&username.to_lowercase())
    }

    pub fn can_write(&self, session_token: Option<&str>, doc_id: &str) -> Result<WriteDecision> {
        let Some(token) = session_token else {
            return Ok(WriteDecision::denied());
        };
        let Some(user) = self.store.resolve_session(token)? else {
            return Ok(WriteDecision::denied());
        };
        let can_write =
            self.is_superuser(&user.username) || self.store.has_write_grant(doc_id, user.id)?;
        Ok(WriteDecision { user: Some(user), can_write })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_user(username: &str) -> (AclStore, User) {
        let store = AclStore::open_in_memory().expect("in-memory store should open");
        let user = store
            .upsert_user(&format!("ext-{username}"), username, Some("Test User"))
            .expect("user should upsert");
        (store, user)
    }

    #[test]
    fn upsert_refreshes_existing_user() {
        let store = AclStore::open_in_memory().expect("in-memory store should open");
        let first = store.upsert_user("ext-1", "alice", None).expect("insert should work");
        let second =
            store.upsert_user("ext-1", "alice_renamed", Some("Alice")).expect("update should work");

        assert_eq!(first.id, second.id);
        assert_eq!(second.username, "alice_renamed");
        assert_eq!(second.display_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn session_resolves_to_its_user() {
        let (store, user) = store_with_user("alice");
        let token =
            store.create_session(user.id, Duration::days(SESSION_TTL_DAYS)).expect("session mints");

        let resolved = store.resolve_session(&token).expect("lookup should work");
        assert_eq!(resolved, Some(user));
        assert!(store.resolve_session("no-such-token").expect("lookup should work").is_none());
    }

    #[test]
    fn expired_session_is_deleted_lazily_on_lookup() {
        let (store, user) = store_with_user("alice");
        let token = store.create_session(user.id, Duration::days(-1)).expect("session mints");

        assert!(store.resolve_session(&token).expect("lookup should work").is_none());

        let remaining: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM sessions WHERE id = ?1", params![token], |row| {
                row.get(0)
            })
            .expect("count should query");
        assert_eq!(remaining, 0, "expired row must be deleted by the lookup");
    }

    #[test]
    fn delete_session_revokes_the_token() {
        let (store, user) = store_with_user("alice");
        let token =
            store.create_session(user.id, Duration::days(SESSION_TTL_DAYS)).expect("session mints");
        store.delete_session(&token).expect("delete should work");
        assert!(store.resolve_session(&token).expect("lookup should work").is_none());
    }

    #[test]
    fn grants_control_write_access_per_document() {
        let (store, user) = store_with_user("alice");
        assert!(!store.has_write_grant("pilot", user.id).expect("query should work"));

        store.grant_write("pilot", user.id).expect("grant should insert");
        store.grant_write("pilot", user.id).expect("double grant is a no-op");
        assert!(store.has_write_grant("pilot", user.id).expect("query should work"));
        assert!(!store.has_write_grant("finale", user.id).expect("query should work"));

        store.revoke_write("pilot", user.id).expect("revoke should delete");
        assert!(!store.has_write_grant("pilot", user.id).expect("query should work"));
    }

    #[test]
    fn oracle_grants_write_to_session_with_grant() {
        let (store, user) = store_with_user("alice");
        store.grant_write("pilot", user.id).expect("grant should insert");
        let token =
            store.create_session(user.id, Duration::days(SESSION_TTL_DAYS)).expect("session mints");
        let oracle = AclOracle::new(store, Vec::new());

        let decision = oracle.can_write(Some(&token), "pilot").expect("oracle should answer");
        assert!(decision.can_write);
        assert_eq!(decision.username(), Some("alice"));

        let other_doc = oracle.can_write(Some(&token), "finale").expect("oracle should answer");
        assert!(!other_doc.can_write);
    }

    #[test]
    fn superuser_override_is_case_insensitive() {
        let (store, user) = store_with_user("Admin");
        let token =
            store.create_session(user.id, Duration::days(SESSION_TTL_DAYS)).expect("session mints");
        let oracle = AclOracle::new(store, vec!["admin".to_string()]);

        // No explicit grant on any document, yet every document is writable.
        let decision = oracle.can_write(Some(&token), "anything").expect("oracle should answer");
        assert!(decision.can_write);
    }

    #[test]
    fn missing_unknown_and_expired_sessions_are_denied() {
        let (store, user) = store_with_user("alice");
        store.grant_write("pilot", user.id).expect("grant should insert");
        let expired = store.create_session(user.id, Duration::days(-1)).expect("session mints");
        let oracle = AclOracle::new(store, Vec::new());

        assert!(!oracle.can_write(None, "pilot").expect("oracle should answer").can_write);
        assert!(!oracle.can_write(Some("bogus"), "pilot").expect("oracle should answer").can_write);
        assert!(!oracle.can_write(Some(&expired), "pilot").expect("oracle should answer").can_write);
    }

    #[test]
    fn session_cookie_is_parsed_from_header() {
        assert_eq!(parse_session_cookie("session=abc123"), Some("abc123"));
        assert_eq!(parse_session_cookie("theme=dark; session=abc123; lang=en"), Some("abc123"));
        assert_eq!(parse_session_cookie("theme=dark"), None);
        assert_eq!(parse_session_cookie(""), None);
    }
}
