//! The content-addressed result store.
//!
//! A persistent mapping from the 32-byte fingerprint of a
//! [`SearchResult`] to the record itself. Inserts are
//! insert-or-ignore by fingerprint, so the store holds at most one
//! record per hash and never loses an already-stored result.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use rusqlite::{Connection, Statement};
use tracing::debug;

use crate::db::open_connection;
use crate::types::{hash_to_hex, ResultHash, SearchResult};

/// Store for cached search results.
pub struct ResultStore {
    conn: Connection,
}

impl ResultStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = open_connection(Some(path), "result cache")?;
        let store = ResultStore { conn };
        store.initialize()?;
        Ok(store)
    }

    /// Open an in-memory store, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = open_connection(None, "result cache")?;
        let store = ResultStore { conn };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS search_cache (
                    hash BLOB PRIMARY KEY,
                    title TEXT,
                    search_url TEXT,
                    description TEXT,
                    content_type TEXT,
                    score INTEGER
                )",
                [],
            )
            .map_err(|e| anyhow!("Failed to create search_cache table: {}", e))?;
        Ok(())
    }

    /// Insert every consistent result whose hash is not already
    /// present. Duplicates and inconsistent entries are skipped.
    /// Returns the number of rows actually inserted.
    pub fn insert_many(&self, results: &[SearchResult]) -> Result<usize> {
        if results.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| anyhow!("Failed to begin transaction: {}", e))?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO search_cache
                     (hash, title, search_url, description, content_type, score)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(|e| anyhow!("Failed to prepare insert: {}", e))?;

            for result in results {
                if !result.is_consistent() {
                    debug!(
                        "Dropping inconsistent result {}",
                        hash_to_hex(&result.hash)
                    );
                    continue;
                }
                inserted += stmt
                    .execute(rusqlite::params![
                        &result.hash[..],
                        result.title,
                        result.url,
                        result.description,
                        result.content_type,
                        result.score,
                    ])
                    .map_err(|e| anyhow!("Failed to insert result: {}", e))?;
            }
        }
        tx.commit()
            .map_err(|e| anyhow!("Failed to commit inserts: {}", e))?;
        Ok(inserted)
    }

    /// Case-insensitive substring search over title, URL and
    /// description.
    ///
    /// A query containing spaces also matches each whitespace-separated
    /// token that is not purely numeric. The empty query matches every
    /// stored result.
    pub fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let needle = query.trim().to_lowercase();

        let mut sql = String::from(
            "SELECT hash, title, search_url, description, content_type, score
             FROM search_cache
             WHERE lower(title) LIKE ?1
                OR lower(search_url) LIKE ?1
                OR lower(description) LIKE ?1",
        );
        let mut patterns = vec![format!("%{}%", needle)];

        if needle.contains(' ') {
            for token in needle.split_whitespace() {
                if token.chars().all(|c| c.is_ascii_digit()) {
                    continue;
                }
                patterns.push(format!("%{}%", token));
                let idx = patterns.len();
                sql.push_str(&format!(
                    " OR lower(title) LIKE ?{idx} OR lower(search_url) LIKE ?{idx} OR lower(description) LIKE ?{idx}"
                ));
            }
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| anyhow!("Failed to prepare search query: {}", e))?;
        Self::stmt_to_results(&mut stmt, rusqlite::params_from_iter(patterns.iter()))
    }

    /// Every stored result.
    pub fn all(&self) -> Result<Vec<SearchResult>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT hash, title, search_url, description, content_type, score
                 FROM search_cache",
            )
            .map_err(|e| anyhow!("Failed to prepare query: {}", e))?;
        Self::stmt_to_results(&mut stmt, [])
    }

    /// The set of stored fingerprints.
    pub fn hashes(&self) -> Result<HashSet<ResultHash>> {
        let mut stmt = self
            .conn
            .prepare("SELECT hash FROM search_cache")
            .map_err(|e| anyhow!("Failed to prepare hash query: {}", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))
            .map_err(|e| anyhow!("Failed to query hashes: {}", e))?;

        let mut hashes = HashSet::new();
        for row in rows {
            let bytes = row.map_err(|e| anyhow!("Failed to read hash row: {}", e))?;
            let hash: ResultHash = bytes
                .try_into()
                .map_err(|_| anyhow!("Stored hash is not 32 bytes"))?;
            hashes.insert(hash);
        }
        Ok(hashes)
    }

    /// Atomically increment a result's score. Unknown hashes are a
    /// no-op, not an error.
    pub fn bump_score(&self, hash: &ResultHash, delta: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE search_cache SET score = score + ?1 WHERE hash = ?2",
                rusqlite::params![delta, &hash[..]],
            )
            .map_err(|e| anyhow!("Failed to bump score: {}", e))?;
        Ok(())
    }

    /// Export the fingerprint-to-score map.
    pub fn scores(&self) -> Result<HashMap<ResultHash, i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT hash, score FROM search_cache")
            .map_err(|e| anyhow!("Failed to prepare score query: {}", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| anyhow!("Failed to query scores: {}", e))?;

        let mut scores = HashMap::new();
        for row in rows {
            let (bytes, score) = row.map_err(|e| anyhow!("Failed to read score row: {}", e))?;
            let hash: ResultHash = bytes
                .try_into()
                .map_err(|_| anyhow!("Stored hash is not 32 bytes"))?;
            scores.insert(hash, score);
        }
        Ok(scores)
    }

    /// Write back absolute scores for known fingerprints. Unknown
    /// fingerprints are skipped.
    pub fn sync_scores_from(&self, scores: &HashMap<ResultHash, i64>) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| anyhow!("Failed to begin transaction: {}", e))?;
        {
            let mut stmt = tx
                .prepare("UPDATE search_cache SET score = ?1 WHERE hash = ?2")
                .map_err(|e| anyhow!("Failed to prepare score update: {}", e))?;
            for (hash, score) in scores {
                stmt.execute(rusqlite::params![score, &hash[..]])
                    .map_err(|e| anyhow!("Failed to update score: {}", e))?;
            }
        }
        tx.commit()
            .map_err(|e| anyhow!("Failed to commit score updates: {}", e))?;
        Ok(())
    }

    /// Merge rule across peers: keep the consistent entries, insert
    /// those not already present. Idempotent over the store's own
    /// contents.
    pub fn sync_from(&self, results: &[SearchResult]) -> Result<usize> {
        let consistent: Vec<SearchResult> = results
            .iter()
            .filter(|r| r.is_consistent())
            .cloned()
            .collect();
        self.insert_many(&consistent)
    }

    fn stmt_to_results<P: rusqlite::Params>(
        stmt: &mut Statement,
        params: P,
    ) -> Result<Vec<SearchResult>> {
        let rows = stmt
            .query_map(params, |row| {
                let hash_bytes: Vec<u8> = row.get(0)?;
                let hash: ResultHash = hash_bytes.try_into().map_err(|_| {
                    rusqlite::Error::InvalidColumnType(
                        0,
                        "hash".to_string(),
                        rusqlite::types::Type::Blob,
                    )
                })?;
                Ok(SearchResult::from_parts(
                    hash,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })
            .map_err(|e| anyhow!("Failed to execute query: {}", e))?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(results: &[SearchResult]) -> ResultStore {
        let store = ResultStore::open_in_memory().unwrap();
        store.insert_many(results).unwrap();
        store
    }

    #[test]
    fn test_insert_and_all() {
        let r1 = SearchResult::new("one", "http://one/", "first");
        let r2 = SearchResult::new("two", "http://two/", "second");
        let store = store_with(&[r1.clone(), r2.clone()]);

        let all = store.all().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&r1));
        assert!(all.contains(&r2));
    }

    #[test]
    fn test_duplicate_insert_is_skipped() {
        let r = SearchResult::new("one", "http://one/", "first");
        let store = store_with(&[r.clone()]);
        assert_eq!(store.insert_many(&[r]).unwrap(), 0);
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn test_inconsistent_result_is_dropped() {
        let mut r = SearchResult::new("one", "http://one/", "first");
        r.title = "tampered".to_string();
        let store = ResultStore::open_in_memory().unwrap();
        assert_eq!(store.sync_from(&[r]).unwrap(), 0);
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn test_search_substring_case_insensitive() {
        let r = SearchResult::new("Rust Book", "http://rust/", "learning material");
        let store = store_with(&[r.clone()]);

        assert_eq!(store.search("rust").unwrap(), vec![r.clone()]);
        assert_eq!(store.search("LEARNING").unwrap(), vec![r]);
        assert!(store.search("python").unwrap().is_empty());
    }

    #[test]
    fn test_search_token_expansion_skips_numeric() {
        let r = SearchResult::new("greeting", "http://hello/", "hello world 2024");
        let store = store_with(&[r.clone()]);

        // "hello 2024" is not a substring, but the token "hello" is
        assert_eq!(store.search("hello 2024").unwrap(), vec![r]);
        // a purely numeric token contributes no OR clause
        assert!(store.search("zzz 2024").unwrap().is_empty());
    }

    #[test]
    fn test_empty_query_returns_all() {
        let r1 = SearchResult::new("one", "http://one/", "first");
        let r2 = SearchResult::new("two", "http://two/", "second");
        let store = store_with(&[r1, r2]);
        assert_eq!(store.search("").unwrap().len(), 2);
    }

    #[test]
    fn test_bump_score() {
        let r = SearchResult::new("one", "http://one/", "first");
        let store = store_with(&[r.clone()]);

        store.bump_score(&r.hash, 5).unwrap();
        store.bump_score(&r.hash, -2).unwrap();
        assert_eq!(store.scores().unwrap()[&r.hash], 3);

        // unknown hash is a no-op
        store.bump_score(&[9u8; 32], 1).unwrap();
        assert_eq!(store.scores().unwrap().len(), 1);
    }

    #[test]
    fn test_sync_scores_from() {
        let r = SearchResult::new("one", "http://one/", "first");
        let store = store_with(&[r.clone()]);

        let mut scores = HashMap::new();
        scores.insert(r.hash, 7);
        scores.insert([9u8; 32], 3);
        store.sync_scores_from(&scores).unwrap();

        assert_eq!(store.scores().unwrap()[&r.hash], 7);
        assert_eq!(store.scores().unwrap().len(), 1);
    }

    #[test]
    fn test_sync_from_is_idempotent() {
        let r1 = SearchResult::new("one", "http://one/", "first");
        let r2 = SearchResult::new("two", "http://two/", "second");
        let store = store_with(&[r1, r2]);

        let snapshot = store.all().unwrap();
        assert_eq!(store.sync_from(&snapshot).unwrap(), 0);
        assert_eq!(store.all().unwrap().len(), 2);
    }

    #[test]
    fn test_hashes() {
        let r = SearchResult::new("one", "http://one/", "first");
        let store = store_with(&[r.clone()]);
        let hashes = store.hashes().unwrap();
        assert_eq!(hashes.len(), 1);
        assert!(hashes.contains(&r.hash));
    }
}
