//! Disk-spillable job queue
//!
//! FIFO with a bounded in-memory buffer; overflow is serialized into a SQLite
//! table and pulled back in insertion order when the buffer drains. `clear`
//! removes both halves, including the on-disk rows.

use crate::job::Job;
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::path::Path;
use thiserror::Error;

/// Queue-specific errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Spill storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Job encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A FIFO queue spilling to SQLite past a fixed in-memory bound
pub struct SpillQueue {
    buffer: VecDeque<Job>,
    conn: Connection,
    capacity: usize,
}

impl SpillQueue {
    /// Opens (or creates) a spill queue backed by the given database path
    pub fn open(path: &Path, capacity: usize) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, capacity)
    }

    /// In-memory spill backend (for testing)
    pub fn open_in_memory(capacity: usize) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, capacity)
    }

    fn with_connection(conn: Connection, capacity: usize) -> Result<Self, QueueError> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            CREATE TABLE IF NOT EXISTS spill (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL
            );
        ",
        )?;

        Ok(Self {
            buffer: VecDeque::new(),
            conn,
            capacity: capacity.max(1),
        })
    }

    /// Appends a job.
    ///
    /// Goes to memory while the buffer has room and nothing is spilled;
    /// otherwise to disk, so FIFO order holds across the boundary.
    pub fn push(&mut self, job: &Job) -> Result<(), QueueError> {
        if self.buffer.len() < self.capacity && self.disk_len()? == 0 {
            self.buffer.push_back(job.clone());
            return Ok(());
        }

        let payload = serde_json::to_string(job)?;
        self.conn.execute(
            "INSERT INTO spill (payload) VALUES (?1)",
            params![payload],
        )?;
        Ok(())
    }

    /// Removes and returns the oldest job, refilling from disk as needed
    pub fn pop(&mut self) -> Result<Option<Job>, QueueError> {
        if self.buffer.is_empty() {
            self.refill()?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Empties the queue, including all spilled rows
    pub fn clear(&mut self) -> Result<(), QueueError> {
        self.buffer.clear();
        self.conn.execute("DELETE FROM spill", [])?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.buffer.len() + self.disk_len()?)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.buffer.is_empty() && self.disk_len()? == 0)
    }

    /// Number of jobs currently spilled to disk
    pub fn disk_len(&self) -> Result<usize, QueueError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM spill", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Moves spilled jobs back into the buffer in insertion order
    fn refill(&mut self) -> Result<(), QueueError> {
        while self.buffer.len() < self.capacity {
            let row: Option<(i64, String)> = {
                let mut stmt = self
                    .conn
                    .prepare("SELECT seq, payload FROM spill ORDER BY seq LIMIT 1")?;
                let mut rows = stmt.query([])?;
                match rows.next()? {
                    Some(row) => Some((row.get(0)?, row.get(1)?)),
                    None => None,
                }
            };

            let (seq, payload) = match row {
                Some(row) => row,
                None => break,
            };

            self.conn
                .execute("DELETE FROM spill WHERE seq = ?1", params![seq])?;
            self.buffer.push_back(serde_json::from_str(&payload)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, Resource};
    use url::Url;

    fn job(id: &str) -> Job {
        let url = Url::parse(&format!("https://example.com/{}", id)).unwrap();
        Job::new(JobKind::Explore, Resource::Url(url)).with_id(id)
    }

    #[test]
    fn test_fifo_within_buffer() {
        let mut queue = SpillQueue::open_in_memory(10).unwrap();
        queue.push(&job("a")).unwrap();
        queue.push(&job("b")).unwrap();

        assert_eq!(queue.pop().unwrap().unwrap().id.as_str(), "a");
        assert_eq!(queue.pop().unwrap().unwrap().id.as_str(), "b");
        assert!(queue.pop().unwrap().is_none());
    }

    #[test]
    fn test_fifo_preserved_across_spill() {
        let mut queue = SpillQueue::open_in_memory(2).unwrap();
        for id in ["a", "b", "c", "d", "e"] {
            queue.push(&job(id)).unwrap();
        }

        assert_eq!(queue.disk_len().unwrap(), 3);
        assert_eq!(queue.len().unwrap(), 5);

        let mut order = Vec::new();
        while let Some(popped) = queue.pop().unwrap() {
            order.push(popped.id.as_str().to_string());
        }
        assert_eq!(order, ["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_push_after_spill_stays_on_disk() {
        let mut queue = SpillQueue::open_in_memory(1).unwrap();
        queue.push(&job("a")).unwrap();
        queue.push(&job("b")).unwrap();
        // Buffer has room only after a pop; "c" must not jump ahead of "b"
        assert_eq!(queue.pop().unwrap().unwrap().id.as_str(), "a");
        queue.push(&job("c")).unwrap();

        assert_eq!(queue.pop().unwrap().unwrap().id.as_str(), "b");
        assert_eq!(queue.pop().unwrap().unwrap().id.as_str(), "c");
    }

    #[test]
    fn test_clear_removes_spilled_rows() {
        let mut queue = SpillQueue::open_in_memory(1).unwrap();
        for id in ["a", "b", "c"] {
            queue.push(&job(id)).unwrap();
        }

        queue.clear().unwrap();
        assert!(queue.is_empty().unwrap());
        assert_eq!(queue.disk_len().unwrap(), 0);
        assert!(queue.pop().unwrap().is_none());
    }

    #[test]
    fn test_spill_survives_on_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.db");

        let mut queue = SpillQueue::open(&path, 1).unwrap();
        queue.push(&job("a")).unwrap();
        queue.push(&job("b")).unwrap();

        assert_eq!(queue.pop().unwrap().unwrap().id.as_str(), "a");
        assert_eq!(queue.pop().unwrap().unwrap().id.as_str(), "b");
    }
}
