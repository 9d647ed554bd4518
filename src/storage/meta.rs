//! Metadata store: the authoritative map between open files and encrypted blocks.
//!
//! Three tables, keyed the same way the block engine looks things up:
//! - `files`: path token, relative path, `assembled` flag
//! - `blocks`: content hash, plaintext size, IV
//! - `openfs`: which block sits at which offset of which file
//!
//! rusqlite is synchronous, so the connection lives behind a `Mutex`. Every
//! method on [`MetaStore`] takes the lock for a single statement (or a small
//! internal transaction); [`MetaStore::transaction`] hands out the lock for a
//! caller-defined group of statements.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::block::{fixed_from_slice, BlockHash, BlockLocation, FileBlock, FileRecord, Iv, PathToken};
use super::migrations::migrations;
use super::BlockError;

/// Shared handle to the SQLite metadata database.
#[derive(Debug)]
pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    /// Open (or create) the database file, enable WAL mode, and run migrations.
    pub fn open(db_path: &Path) -> Result<Self, BlockError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations().to_latest(&mut conn)?;

        log::info!("Metadata store opened at {}", db_path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Private in-memory database, used by tests and throwaway tooling.
    pub fn open_in_memory() -> Result<Self, BlockError> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations().to_latest(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, BlockError> {
        self.conn
            .lock()
            .map_err(|e| BlockError::Poisoned(format!("metadata store: {}", e)))
    }

    /// Take the store lock and open a write transaction.
    ///
    /// Other callers block until the returned guard is committed or dropped.
    /// Dropping without [`MetaTransaction::commit`] rolls back.
    pub fn transaction(&self) -> Result<MetaTransaction<'_>, BlockError> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(MetaTransaction { conn, finished: false })
    }

    /// Every recorded location of a block, in store order.
    pub fn blocks_for_hash(&self, hash: &BlockHash) -> Result<Vec<BlockLocation>, BlockError> {
        blocks_for_hash(&*self.lock()?, hash)
    }

    /// A file's block list, ordered by offset.
    pub fn block_list_for_file(&self, token: &PathToken) -> Result<Vec<FileBlock>, BlockError> {
        block_list_for_file(&*self.lock()?, token)
    }

    pub fn file(&self, token: &PathToken) -> Result<Option<FileRecord>, BlockError> {
        file(&*self.lock()?, token)
    }

    pub fn file_by_path(&self, path: &str) -> Result<Option<FileRecord>, BlockError> {
        file_by_path(&*self.lock()?, path)
    }

    pub fn set_assembled(&self, token: &PathToken, assembled: bool) -> Result<(), BlockError> {
        set_assembled(&*self.lock()?, token, assembled)
    }

    /// Files whose on-disk plaintext is not known to match their block list.
    pub fn pending_files(&self) -> Result<Vec<FileRecord>, BlockError> {
        pending_files(&*self.lock()?)
    }

    /// Replace a file's record and block list in one transaction.
    pub fn put_file(&self, record: &FileRecord, blocks: &[FileBlock]) -> Result<(), BlockError> {
        let tx = self.transaction()?;
        tx.put_file(record, blocks)?;
        tx.commit()
    }

    /// Forget a file and any blocks no other file references.
    pub fn remove_file(&self, token: &PathToken) -> Result<(), BlockError> {
        let tx = self.transaction()?;
        tx.remove_file(token)?;
        tx.commit()
    }
}

/// Scoped hold on the metadata store with an open SQLite transaction.
pub struct MetaTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl MetaTransaction<'_> {
    pub fn commit(mut self) -> Result<(), BlockError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    pub fn blocks_for_hash(&self, hash: &BlockHash) -> Result<Vec<BlockLocation>, BlockError> {
        blocks_for_hash(&self.conn, hash)
    }

    pub fn block_list_for_file(&self, token: &PathToken) -> Result<Vec<FileBlock>, BlockError> {
        block_list_for_file(&self.conn, token)
    }

    pub fn file(&self, token: &PathToken) -> Result<Option<FileRecord>, BlockError> {
        file(&self.conn, token)
    }

    pub fn set_assembled(&self, token: &PathToken, assembled: bool) -> Result<(), BlockError> {
        set_assembled(&self.conn, token, assembled)
    }

    pub fn put_file(&self, record: &FileRecord, blocks: &[FileBlock]) -> Result<(), BlockError> {
        let conn = &*self.conn;
        conn.execute(
            "DELETE FROM openfs WHERE file_path_hmac = ?1",
            params![record.path_token.as_bytes()],
        )?;
        conn.execute(
            "INSERT INTO files (path_hmac, path, assembled) VALUES (?1, ?2, ?3)
             ON CONFLICT(path_hmac) DO UPDATE SET path = excluded.path, assembled = excluded.assembled",
            params![record.path_token.as_bytes(), record.path, record.assembled],
        )?;

        let mut insert_block = conn.prepare_cached(
            "INSERT OR IGNORE INTO blocks (encrypted_hash, blocksize, iv) VALUES (?1, ?2, ?3)",
        )?;
        let mut insert_openfs = conn.prepare_cached(
            "INSERT INTO openfs (file_path_hmac, block_encrypted_hash, offset) VALUES (?1, ?2, ?3)",
        )?;
        for block in blocks {
            let (offset, size) = sql_range(block)?;
            insert_block.execute(params![block.hash.as_bytes(), size, block.iv.as_bytes()])?;
            insert_openfs.execute(params![
                record.path_token.as_bytes(),
                block.hash.as_bytes(),
                offset
            ])?;
        }
        prune_orphan_blocks(conn)?;
        Ok(())
    }

    pub fn remove_file(&self, token: &PathToken) -> Result<(), BlockError> {
        self.conn.execute(
            "DELETE FROM files WHERE path_hmac = ?1",
            params![token.as_bytes()],
        )?;
        prune_orphan_blocks(&self.conn)?;
        Ok(())
    }
}

impl Drop for MetaTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                log::warn!("Metadata rollback failed: {}", e);
            }
        }
    }
}

/// Offsets and sizes are stored as SQLite integers, which are signed.
fn sql_range(block: &FileBlock) -> Result<(i64, i64), BlockError> {
    let out_of_range = || {
        BlockError::InvalidBlockList(format!(
            "block {} at offset {} with size {} is out of range",
            block.hash, block.offset, block.size
        ))
    };
    let offset = i64::try_from(block.offset).map_err(|_| out_of_range())?;
    let size = i64::try_from(block.size).map_err(|_| out_of_range())?;
    Ok((offset, size))
}

fn prune_orphan_blocks(conn: &Connection) -> Result<(), BlockError> {
    conn.execute(
        "DELETE FROM blocks WHERE encrypted_hash NOT IN
         (SELECT block_encrypted_hash FROM openfs)",
        [],
    )?;
    Ok(())
}

fn blob<const N: usize>(row: &Row<'_>, idx: usize) -> rusqlite::Result<[u8; N]> {
    let bytes: Vec<u8> = row.get(idx)?;
    fixed_from_slice(&bytes).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Blob,
            format!("expected {} bytes, got {}", N, bytes.len()).into(),
        )
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        path_token: PathToken(blob(row, 0)?),
        path: row.get(1)?,
        assembled: row.get(2)?,
    })
}

fn blocks_for_hash(conn: &Connection, hash: &BlockHash) -> Result<Vec<BlockLocation>, BlockError> {
    let mut stmt = conn.prepare_cached(
        "SELECT files.path, openfs.offset, blocks.blocksize, blocks.iv
         FROM blocks
         JOIN openfs ON openfs.block_encrypted_hash = blocks.encrypted_hash
         JOIN files ON files.path_hmac = openfs.file_path_hmac
         WHERE blocks.encrypted_hash = ?1
         ORDER BY files.path, openfs.offset",
    )?;
    let rows = stmt.query_map(params![hash.as_bytes()], |row| {
        Ok(BlockLocation {
            path: row.get(0)?,
            offset: row.get::<_, i64>(1)? as u64,
            size: row.get::<_, i64>(2)? as u64,
            iv: Iv(blob(row, 3)?),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn block_list_for_file(conn: &Connection, token: &PathToken) -> Result<Vec<FileBlock>, BlockError> {
    let mut stmt = conn.prepare_cached(
        "SELECT blocks.encrypted_hash, openfs.offset, blocks.blocksize, blocks.iv
         FROM openfs
         JOIN blocks ON blocks.encrypted_hash = openfs.block_encrypted_hash
         WHERE openfs.file_path_hmac = ?1
         ORDER BY openfs.offset",
    )?;
    let rows = stmt.query_map(params![token.as_bytes()], |row| {
        Ok(FileBlock {
            hash: BlockHash(blob(row, 0)?),
            offset: row.get::<_, i64>(1)? as u64,
            size: row.get::<_, i64>(2)? as u64,
            iv: Iv(blob(row, 3)?),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn file(conn: &Connection, token: &PathToken) -> Result<Option<FileRecord>, BlockError> {
    Ok(conn
        .query_row(
            "SELECT path_hmac, path, assembled FROM files WHERE path_hmac = ?1",
            params![token.as_bytes()],
            file_from_row,
        )
        .optional()?)
}

fn file_by_path(conn: &Connection, path: &str) -> Result<Option<FileRecord>, BlockError> {
    Ok(conn
        .query_row(
            "SELECT path_hmac, path, assembled FROM files WHERE path = ?1",
            params![path],
            file_from_row,
        )
        .optional()?)
}

fn set_assembled(conn: &Connection, token: &PathToken, assembled: bool) -> Result<(), BlockError> {
    let changed = conn.execute(
        "UPDATE files SET assembled = ?1 WHERE path_hmac = ?2",
        params![assembled, token.as_bytes()],
    )?;
    if changed == 0 {
        return Err(BlockError::UnknownFile(token.to_hex()));
    }
    Ok(())
}

fn pending_files(conn: &Connection) -> Result<Vec<FileRecord>, BlockError> {
    let mut stmt = conn.prepare_cached(
        "SELECT path_hmac, path, assembled FROM files WHERE assembled = 0 ORDER BY path",
    )?;
    let rows = stmt.query_map([], file_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(token: u8, path: &str, assembled: bool) -> FileRecord {
        FileRecord {
            path_token: PathToken([token; 32]),
            path: path.to_string(),
            assembled,
        }
    }

    fn block_rows(store: &MetaStore) -> i64 {
        store
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))
            .unwrap()
    }

    fn block(hash: u8, offset: u64, size: u64) -> FileBlock {
        FileBlock {
            hash: BlockHash([hash; 32]),
            offset,
            size,
            iv: Iv([hash; 12]),
        }
    }

    #[test]
    fn test_put_and_read_block_list() {
        let store = MetaStore::open_in_memory().unwrap();
        let file = record(1, "a.txt", true);
        // Inserted out of order; read back by offset
        store
            .put_file(&file, &[block(2, 4, 4), block(1, 0, 4)])
            .unwrap();

        let list = store.block_list_for_file(&file.path_token).unwrap();
        assert_eq!(list, vec![block(1, 0, 4), block(2, 4, 4)]);
        assert_eq!(store.file(&file.path_token).unwrap(), Some(file.clone()));
        assert_eq!(store.file_by_path("a.txt").unwrap(), Some(file));
    }

    #[test]
    fn test_blocks_for_hash_lists_every_file() {
        let store = MetaStore::open_in_memory().unwrap();
        store.put_file(&record(1, "a.txt", true), &[block(7, 0, 3)]).unwrap();
        store
            .put_file(&record(2, "b.txt", true), &[block(8, 0, 5), block(7, 5, 3)])
            .unwrap();

        let locations = store.blocks_for_hash(&BlockHash([7; 32])).unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].path, "a.txt");
        assert_eq!(locations[0].offset, 0);
        assert_eq!(locations[1].path, "b.txt");
        assert_eq!(locations[1].offset, 5);
        assert!(store.blocks_for_hash(&BlockHash([9; 32])).unwrap().is_empty());
    }

    #[test]
    fn test_put_file_replaces_block_list() {
        let store = MetaStore::open_in_memory().unwrap();
        let file = record(1, "a.txt", true);
        store.put_file(&file, &[block(1, 0, 4), block(2, 4, 4)]).unwrap();
        store.put_file(&file, &[block(3, 0, 2)]).unwrap();

        let list = store.block_list_for_file(&file.path_token).unwrap();
        assert_eq!(list, vec![block(3, 0, 2)]);
        assert!(store.blocks_for_hash(&BlockHash([1; 32])).unwrap().is_empty());
        assert_eq!(block_rows(&store), 1);
    }

    #[test]
    fn test_reindexing_keeps_block_table_bounded() {
        let store = MetaStore::open_in_memory().unwrap();
        let other = record(2, "b.txt", true);
        store.put_file(&other, &[block(9, 0, 4)]).unwrap();

        let file = record(1, "a.txt", true);
        for round in 0..10u8 {
            let blocks: Vec<FileBlock> = (0..5u8)
                .map(|i| block(10 + round * 5 + i, u64::from(i) * 8, 8))
                .collect();
            store.put_file(&file, &blocks).unwrap();
        }
        // Five live blocks for a.txt plus the one b.txt still references.
        assert_eq!(block_rows(&store), 6);
    }

    #[test]
    fn test_put_file_rejects_out_of_range_blocks() {
        let store = MetaStore::open_in_memory().unwrap();
        let file = record(1, "a.txt", true);
        store.put_file(&file, &[block(1, 0, 4)]).unwrap();

        let huge_offset = [block(1, 0, 4), block(2, u64::MAX, 4)];
        assert!(matches!(
            store.put_file(&file, &huge_offset),
            Err(BlockError::InvalidBlockList(_))
        ));
        let huge_size = [block(3, 0, i64::MAX as u64 + 1)];
        assert!(matches!(
            store.put_file(&file, &huge_size),
            Err(BlockError::InvalidBlockList(_))
        ));
        // Rejected writes roll back; the previous list survives.
        assert_eq!(
            store.block_list_for_file(&file.path_token).unwrap(),
            vec![block(1, 0, 4)]
        );
    }

    #[test]
    fn test_set_assembled_and_pending() {
        let store = MetaStore::open_in_memory().unwrap();
        store.put_file(&record(1, "a.txt", true), &[]).unwrap();
        store.put_file(&record(2, "b.txt", false), &[]).unwrap();

        let pending = store.pending_files().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].path, "b.txt");

        store.set_assembled(&PathToken([1; 32]), false).unwrap();
        assert_eq!(store.pending_files().unwrap().len(), 2);

        let missing = store.set_assembled(&PathToken([3; 32]), true);
        assert!(matches!(missing, Err(BlockError::UnknownFile(_))));
    }

    #[test]
    fn test_transaction_rolls_back_on_drop() {
        let store = MetaStore::open_in_memory().unwrap();
        let token = PathToken([1; 32]);
        store.put_file(&record(1, "a.txt", true), &[]).unwrap();

        {
            let tx = store.transaction().unwrap();
            tx.set_assembled(&token, false).unwrap();
            assert!(!tx.file(&token).unwrap().unwrap().assembled);
        }
        assert!(store.file(&token).unwrap().unwrap().assembled);

        let tx = store.transaction().unwrap();
        tx.set_assembled(&token, false).unwrap();
        tx.commit().unwrap();
        assert!(!store.file(&token).unwrap().unwrap().assembled);
    }

    #[test]
    fn test_remove_file_drops_orphan_blocks() {
        let store = MetaStore::open_in_memory().unwrap();
        store.put_file(&record(1, "a.txt", true), &[block(1, 0, 4)]).unwrap();
        store
            .put_file(&record(2, "b.txt", true), &[block(1, 0, 4), block(2, 4, 4)])
            .unwrap();

        store.remove_file(&PathToken([2; 32])).unwrap();
        assert_eq!(store.blocks_for_hash(&BlockHash([1; 32])).unwrap().len(), 1);
        assert!(store.blocks_for_hash(&BlockHash([2; 32])).unwrap().is_empty());
        assert!(store.file(&PathToken([2; 32])).unwrap().is_none());
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("meta/syncfs.db");
        {
            let store = MetaStore::open(&db_path).unwrap();
            store.put_file(&record(1, "a.txt", false), &[block(1, 0, 4)]).unwrap();
        }
        let store = MetaStore::open(&db_path).unwrap();
        assert_eq!(store.pending_files().unwrap().len(), 1);
    }
}
