//! Independent change-stream readers.

use super::{ConformedTableRef, TableChange};

/// A reader position in one table's change stream.
///
/// Cursors never affect each other. Each one registers its position with
/// the table, which keeps changes in memory until every live cursor has
/// moved past them.
#[derive(Debug)]
pub struct TableCursor {
    table: ConformedTableRef,
    reader: u64,
    position: usize,
}

impl TableCursor {
    pub fn new(table: ConformedTableRef, position: usize) -> Self {
        let reader = table.register_reader(position);
        Self {
            table,
            reader,
            position,
        }
    }

    pub fn table(&self) -> &ConformedTableRef {
        &self.table
    }

    /// Offset of the next change this cursor will read.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn seek(&mut self, position: usize) {
        self.position = position;
        self.table.move_reader(self.reader, position);
    }

    /// Read up to `limit` changes without moving.
    pub async fn peek(&self, limit: usize) -> Vec<TableChange> {
        self.table.changes_since(self.position, limit).await
    }

    /// Read up to `limit` changes and move past them.
    pub async fn next_batch(&mut self, limit: usize) -> Vec<TableChange> {
        let changes = self.peek(limit).await;
        if let Some(last) = changes.last() {
            self.seek(last.offset + 1);
        }
        changes
    }

    /// Changes committed but not yet read.
    pub async fn lag(&self) -> usize {
        self.table.end_offset().await.saturating_sub(self.position)
    }
}

impl Clone for TableCursor {
    fn clone(&self) -> Self {
        Self::new(self.table.clone(), self.position)
    }
}

impl Drop for TableCursor {
    fn drop(&mut self) {
        self.table.release_reader(self.reader);
    }
}
