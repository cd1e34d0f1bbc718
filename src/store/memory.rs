//! In-memory `LineStore`
//!
//! An append-only vector behind a mutex. Not persisted across restarts.

use std::sync::Mutex;

use super::{LineRecord, LineStore, StoreError, StoreResult};

/// In-memory append-only line store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<LineRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Vec<LineRecord>>> {
        self.records
            .lock()
            .map_err(|_| StoreError("store mutex poisoned".to_string()))
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LineStore for MemoryStore {
    fn append(&self, line_number: i64, content: &str, written_at: i64) -> StoreResult<()> {
        let mut records = self.lock()?;
        records.push(LineRecord {
            line_number,
            content: content.to_string(),
            written_at,
        });
        Ok(())
    }

    fn most_recent(&self) -> StoreResult<Option<LineRecord>> {
        let records = self.lock()?;
        Ok(records.last().cloned())
    }

    fn all(&self) -> StoreResult<Vec<LineRecord>> {
        let records = self.lock()?;
        let mut all: Vec<LineRecord> = records.clone();
        all.sort_by_key(|r| r.line_number);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_then_most_recent() {
        let store = MemoryStore::new();
        store.append(1, "first", 100).unwrap();
        store.append(2, "second", 200).unwrap();

        let last = store.most_recent().unwrap().unwrap();
        assert_eq!(last.line_number, 2);
        assert_eq!(last.content, "second");
        assert_eq!(last.written_at, 200);
    }

    #[test]
    fn test_most_recent_is_last_appended_not_highest_line() {
        let store = MemoryStore::new();
        store.append(9, "early", 100).unwrap();
        store.append(3, "late", 200).unwrap();

        // Append-only log semantics: the freshest write wins, whatever its
        // line number.
        let last = store.most_recent().unwrap().unwrap();
        assert_eq!(last.line_number, 3);
    }

    #[test]
    fn test_all_is_ordered_by_line_number() {
        let store = MemoryStore::new();
        store.append(5, "e", 1).unwrap();
        store.append(1, "a", 2).unwrap();
        store.append(3, "c", 3).unwrap();

        let lines: Vec<i64> = store.all().unwrap().iter().map(|r| r.line_number).collect();
        assert_eq!(lines, vec![1, 3, 5]);
    }

    #[test]
    fn test_empty_store() {
        let store = MemoryStore::new();
        assert!(store.most_recent().unwrap().is_none());
        assert!(store.all().unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_append_never_mutates_in_place() {
        let store = MemoryStore::new();
        store.append(1, "v1", 100).unwrap();
        store.append(1, "v2", 200).unwrap();

        // Both records exist; reads see two entries for line 1.
        assert_eq!(store.len(), 2);
        let all = store.all().unwrap();
        assert_eq!(all[0].content, "v1");
        assert_eq!(all[1].content, "v2");
    }
}
