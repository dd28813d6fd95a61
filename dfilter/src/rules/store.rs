// Copyright 2024 dshield developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The durable rule table.
//!
//! SQLite-backed. Source replacement happens inside one transaction so a
//! reader never observes a partially replaced source. Every committed write
//! bumps a watch-channel epoch; the lookup cache invalidates on it.

use super::{Provenance, Rule, RuleAction, RuleKind};
use chrono::{Duration, Utc};
use log::debug;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Row,
};
use std::path::Path;
use thiserror::Error;
use tokio::sync::watch;

/// A shorthand for returning store errors.
pub type Result<T> = std::result::Result<T, StoreError>;

/// All possible errors the rule store may return.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error forwarded from the database driver.
    #[error(transparent)]
    Db(#[from] sqlx::Error),

    /// A stored row no longer decodes into a rule.
    #[error("corrupted rule row for domain '{0}'")]
    Corrupt(String),
}

fn action_to_i64(action: RuleAction) -> i64 {
    match action {
        RuleAction::Block => 0,
        RuleAction::Allow => 1,
        RuleAction::Redirect => 2,
        RuleAction::Monitor => 3,
    }
}

fn action_from_i64(v: i64, domain: &str) -> Result<RuleAction> {
    Ok(match v {
        0 => RuleAction::Block,
        1 => RuleAction::Allow,
        2 => RuleAction::Redirect,
        3 => RuleAction::Monitor,
        _ => return Err(StoreError::Corrupt(domain.to_string())),
    })
}

fn kind_to_i64(kind: RuleKind) -> i64 {
    match kind {
        RuleKind::Exact => 0,
        RuleKind::Wildcard => 1,
        RuleKind::Regex => 2,
    }
}

fn kind_from_i64(v: i64, domain: &str) -> Result<RuleKind> {
    Ok(match v {
        0 => RuleKind::Exact,
        1 => RuleKind::Wildcard,
        2 => RuleKind::Regex,
        _ => return Err(StoreError::Corrupt(domain.to_string())),
    })
}

fn provenance_to_i64(p: Provenance) -> i64 {
    match p {
        Provenance::User => 0,
        Provenance::Manifest => 1,
        Provenance::Remote => 2,
        Provenance::System => 3,
    }
}

fn provenance_from_i64(v: i64, domain: &str) -> Result<Provenance> {
    Ok(match v {
        0 => Provenance::User,
        1 => Provenance::Manifest,
        2 => Provenance::Remote,
        3 => Provenance::System,
        _ => return Err(StoreError::Corrupt(domain.to_string())),
    })
}

const RULE_COLUMNS: &str =
    "domain, action, kind, priority, provenance, custom_message, comment, updated_at, expires_at";

fn rule_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Rule> {
    let domain: String = row.try_get("domain")?;
    Ok(Rule {
        action: action_from_i64(row.try_get("action")?, &domain)?,
        kind: kind_from_i64(row.try_get("kind")?, &domain)?,
        priority: row.try_get("priority")?,
        provenance: provenance_from_i64(row.try_get("provenance")?, &domain)?,
        custom_message: row.try_get("custom_message")?,
        comment: row.try_get("comment")?,
        updated_at: row.try_get("updated_at")?,
        expires_at: row.try_get("expires_at")?,
        domain,
    })
}

/// The persistent rule table plus its change-notification channel.
pub struct RuleStore {
    pool: SqlitePool,
    epoch: watch::Sender<u64>,
}

impl RuleStore {
    /// Open (creating schema if missing) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Open an in-memory store, mainly for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL,
                action INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                provenance INTEGER NOT NULL,
                source_id TEXT NOT NULL,
                custom_message TEXT,
                comment TEXT,
                updated_at TEXT,
                expires_at TEXT
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rules_domain ON rules(domain)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rules_source ON rules(source_id)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS query_stats (
                domain TEXT PRIMARY KEY,
                hits INTEGER NOT NULL DEFAULT 0,
                last_seen TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        let (epoch, _) = watch::channel(0);
        Ok(Self { pool, epoch })
    }

    /// Subscribe to committed-write notifications. The value is an epoch
    /// counter; any change means "rules changed, drop cached verdicts".
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    fn notify_changed(&self) {
        self.epoch.send_modify(|e| *e += 1);
    }

    /// Insert one rule attributed to `source_id`.
    pub async fn add_rule(&self, source_id: &str, rule: &Rule) -> Result<()> {
        self.insert_one(&self.pool, source_id, rule).await?;
        self.notify_changed();
        Ok(())
    }

    async fn insert_one<'e, E>(&self, executor: E, source_id: &str, rule: &Rule) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            "INSERT INTO rules (domain, action, kind, priority, provenance, source_id,
                                custom_message, comment, updated_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.domain)
        .bind(action_to_i64(rule.action))
        .bind(kind_to_i64(rule.kind))
        .bind(rule.priority)
        .bind(provenance_to_i64(rule.provenance))
        .bind(source_id)
        .bind(&rule.custom_message)
        .bind(&rule.comment)
        .bind(rule.updated_at)
        .bind(rule.expires_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Insert a batch inside one transaction.
    pub async fn add_rules(&self, source_id: &str, rules: &[Rule]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for rule in rules {
            self.insert_one(&mut *tx, source_id, rule).await?;
        }
        tx.commit().await?;
        self.notify_changed();
        Ok(())
    }

    /// Remove every rule for `domain`, returning how many went away.
    pub async fn remove_rule(&self, domain: &str) -> Result<u64> {
        let n = sqlx::query("DELETE FROM rules WHERE domain = ?")
            .bind(domain)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if n > 0 {
            self.notify_changed();
        }
        Ok(n)
    }

    /// Remove every rule attributed to `source_id`.
    pub async fn remove_source(&self, source_id: &str) -> Result<u64> {
        let n = sqlx::query("DELETE FROM rules WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if n > 0 {
            self.notify_changed();
        }
        Ok(n)
    }

    /// Sweep rules whose expiry has passed.
    pub async fn remove_expired(&self) -> Result<u64> {
        let n = sqlx::query("DELETE FROM rules WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if n > 0 {
            self.notify_changed();
        }
        Ok(n)
    }

    /// Atomically replace every rule of `source_id` with `rules`. Readers see
    /// either the old set or the new set, never a mixture.
    pub async fn replace_source(&self, source_id: &str, rules: &[Rule]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM rules WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        for rule in rules {
            self.insert_one(&mut *tx, source_id, rule).await?;
        }
        tx.commit().await?;
        debug!("replaced source '{}' with {} rules", source_id, rules.len());
        self.notify_changed();
        Ok(())
    }

    /// Exact-domain rules (indexed lookup).
    pub async fn exact_rules(&self, domain: &str) -> Result<Vec<Rule>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM rules WHERE domain = ? AND kind = 0",
            RULE_COLUMNS
        ))
        .bind(domain)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    /// Every stored rule whose pattern can match `domain`: the exact bucket
    /// plus each wildcard suffix candidate (`*.domain` included, for root
    /// matching modes). Expired rules are filtered out here.
    pub async fn matching_rules(&self, domain: &str) -> Result<Vec<Rule>> {
        let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
        let mut patterns: Vec<String> = Vec::with_capacity(labels.len() + 1);
        patterns.push(domain.to_string());
        for i in 0..labels.len() {
            patterns.push(format!("*.{}", labels[i..].join(".")));
        }
        let placeholders = vec!["?"; patterns.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM rules WHERE domain IN ({})",
            RULE_COLUMNS, placeholders
        );
        let mut query = sqlx::query(&sql);
        for p in &patterns {
            query = query.bind(p);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let now = Utc::now();
        let rules: Result<Vec<Rule>> = rows.iter().map(rule_from_row).collect();
        Ok(rules?.into_iter().filter(|r| !r.is_expired(now)).collect())
    }

    /// All rules attributed to `source_id`, in insertion order.
    pub async fn rules_from_source(&self, source_id: &str) -> Result<Vec<Rule>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM rules WHERE source_id = ? ORDER BY id",
            RULE_COLUMNS
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    /// Total stored rules.
    pub async fn rule_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rules")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Rule counts per source identifier.
    pub async fn counts_by_source(&self) -> Result<Vec<(String, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT source_id, COUNT(*) FROM rules GROUP BY source_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(s, n)| (s, n as u64)).collect())
    }

    /// Reclaim free pages.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Database size in bytes.
    pub async fn size_in_bytes(&self) -> Result<u64> {
        let pages: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        Ok((pages * page_size) as u64)
    }

    /// Bump the query counter for `domain` (cache warming input only).
    pub async fn record_query(&self, domain: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO query_stats (domain, hits, last_seen) VALUES (?, 1, ?)
             ON CONFLICT(domain) DO UPDATE SET hits = hits + 1, last_seen = excluded.last_seen",
        )
        .bind(domain)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The `limit` most queried domains.
    pub async fn most_queried(&self, limit: u32) -> Result<Vec<(String, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT domain, hits FROM query_stats ORDER BY hits DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(d, n)| (d, n as u64)).collect())
    }

    /// Query count for one domain.
    pub async fn query_count(&self, domain: &str) -> Result<u64> {
        let hits: Option<i64> = sqlx::query_scalar("SELECT hits FROM query_stats WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hits.unwrap_or(0) as u64)
    }

    /// Prune query counters not seen within `max_age`.
    pub async fn cleanup_query_stats(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - max_age;
        Ok(sqlx::query("DELETE FROM query_stats WHERE last_seen < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }
}
