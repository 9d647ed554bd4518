use rusqlite_migration::{Migrations, M};

/// Schema migrations for the metadata store.
/// Tracked through SQLite's user_version pragma.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: open tree <-> block map

CREATE TABLE files (
    path_hmac BLOB PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    assembled INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE blocks (
    encrypted_hash BLOB PRIMARY KEY,
    blocksize INTEGER NOT NULL,
    iv BLOB NOT NULL
);

CREATE TABLE openfs (
    file_path_hmac BLOB NOT NULL,
    block_encrypted_hash BLOB NOT NULL,
    offset INTEGER NOT NULL,
    PRIMARY KEY (file_path_hmac, offset),
    FOREIGN KEY (file_path_hmac) REFERENCES files(path_hmac) ON DELETE CASCADE,
    FOREIGN KEY (block_encrypted_hash) REFERENCES blocks(encrypted_hash)
);

CREATE INDEX idx_openfs_block ON openfs(block_encrypted_hash);
CREATE INDEX idx_files_assembled ON files(assembled);
",
    )])
}
