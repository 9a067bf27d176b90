//! SQLite-backed index of the assets in a local photo library.
//!
//! The index stores one row per image file with the metadata needed to build
//! snapshots without touching the files again: album membership, creation
//! and modification stamps, and pixel dimensions. Rescans use the stored
//! mtime/size to skip unchanged files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row, Transaction};
use tracing::{debug, info};

use crate::models::{Asset, AssetId, SmartAlbum};

/// One indexed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedAsset {
    pub path: PathBuf,
    /// First-level directory under the library root, if any.
    pub album: Option<String>,
    pub created_at: i64,
    pub mtime: i64,
    pub size: i64,
    pub width: u32,
    pub height: u32,
    pub last_seen: i64,
}

impl IndexedAsset {
    pub fn to_asset(&self) -> Asset {
        Asset {
            id: AssetId::new(self.path.to_string_lossy()),
            path: self.path.clone(),
            created_at: self.created_at,
            modified_at: self.mtime,
            width: self.width,
            height: self.height,
        }
    }
}

/// Stored values used to decide whether a file must be re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedEntry {
    pub mtime: i64,
    pub size: i64,
    pub created_at: i64,
    pub width: u32,
    pub height: u32,
}

/// Summary of one user album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumSummary {
    pub name: String,
    pub asset_count: usize,
    pub latest_at: i64,
}

pub struct AssetIndex {
    conn: Connection,
}

const SELECT_COLUMNS: &str =
    "path, album, created_at, mtime, size, width, height, last_seen";

impl AssetIndex {
    /// Opens or creates the index at the specified path.
    ///
    /// Uses WAL journaling with NORMAL sync; the index is a rebuildable
    /// cache of the file tree.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create index directory: {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open asset index at {:?}", path))?;
        Self::configure(conn)
    }

    /// In-memory index, used when no persistent location is wanted.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory index")?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )
        .context("Failed to configure SQLite pragmas")?;

        let index = Self { conn };
        index.create_tables()?;
        Ok(index)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS assets (
                path TEXT PRIMARY KEY NOT NULL,
                album TEXT,
                created_at INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                size INTEGER NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                last_seen INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_assets_created ON assets(created_at);
            CREATE INDEX IF NOT EXISTS idx_assets_album ON assets(album);
            CREATE INDEX IF NOT EXISTS idx_assets_last_seen ON assets(last_seen);
            ",
            )
            .context("Failed to create asset index tables")?;

        debug!("Asset index tables created/verified");
        Ok(())
    }

    /// Inserts or updates many assets in one transaction.
    pub fn upsert_batch(&mut self, assets: &[IndexedAsset]) -> Result<usize> {
        if assets.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let count = Self::upsert_in_tx(&tx, assets)?;
        tx.commit()?;

        debug!("Batch upserted {} assets", count);
        Ok(count)
    }

    fn upsert_in_tx(tx: &Transaction, assets: &[IndexedAsset]) -> Result<usize> {
        let mut stmt = tx.prepare_cached(
            "
            INSERT INTO assets (path, album, created_at, mtime, size, width, height, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(path) DO UPDATE SET
                album = excluded.album,
                created_at = excluded.created_at,
                mtime = excluded.mtime,
                size = excluded.size,
                width = excluded.width,
                height = excluded.height,
                last_seen = excluded.last_seen
            ",
        )?;

        let mut count = 0;
        for asset in assets {
            stmt.execute(params![
                asset.path.to_string_lossy(),
                asset.album,
                asset.created_at,
                asset.mtime,
                asset.size,
                asset.width,
                asset.height,
                asset.last_seen,
            ])?;
            count += 1;
        }
        Ok(count)
    }

    /// Stored metadata keyed by path, for cache-aware rescans.
    pub fn cache_map(&self) -> Result<HashMap<PathBuf, CachedEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, mtime, size, created_at, width, height FROM assets")?;

        let map = stmt
            .query_map([], |row| {
                Ok((
                    PathBuf::from(row.get::<_, String>(0)?),
                    CachedEntry {
                        mtime: row.get(1)?,
                        size: row.get(2)?,
                        created_at: row.get(3)?,
                        width: row.get(4)?,
                        height: row.get(5)?,
                    },
                ))
            })?
            .collect::<Result<HashMap<_, _>, _>>()
            .context("Failed to load asset cache map")?;

        Ok(map)
    }

    /// Assets in a scope, newest first.
    ///
    /// `None` selects every asset, `Some(name)` one user album.
    pub fn assets_in_album(&self, album: Option<&str>) -> Result<Vec<Asset>> {
        let rows = match album {
            None => self.query_assets(
                &format!("SELECT {SELECT_COLUMNS} FROM assets ORDER BY created_at DESC, path"),
                params![],
            )?,
            Some(name) => self.query_assets(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM assets WHERE album = ?1 \
                     ORDER BY created_at DESC, path"
                ),
                params![name],
            )?,
        };
        Ok(rows.iter().map(IndexedAsset::to_asset).collect())
    }

    /// Assets belonging to a smart album, newest first.
    pub fn assets_in_smart_album(&self, kind: SmartAlbum) -> Result<Vec<Asset>> {
        let filter = match kind {
            SmartAlbum::Panoramas => "height > 0 AND width >= height * 2",
            SmartAlbum::Verticals => "height > width",
        };
        let rows = self.query_assets(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM assets WHERE {filter} \
                 ORDER BY created_at DESC, path"
            ),
            params![],
        )?;
        Ok(rows.iter().map(IndexedAsset::to_asset).collect())
    }

    fn query_assets(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<IndexedAsset>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, row_to_indexed)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to query assets")?;
        Ok(rows)
    }

    /// User albums ordered by their newest asset, newest first.
    pub fn user_albums(&self) -> Result<Vec<AlbumSummary>> {
        let mut stmt = self.conn.prepare_cached(
            "
            SELECT album, COUNT(*), MAX(created_at)
            FROM assets
            WHERE album IS NOT NULL
            GROUP BY album
            ORDER BY MAX(created_at) DESC, album
            ",
        )?;

        let albums = stmt
            .query_map([], |row| {
                Ok(AlbumSummary {
                    name: row.get(0)?,
                    asset_count: row.get::<_, i64>(1)? as usize,
                    latest_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list albums")?;

        Ok(albums)
    }

    /// Whether a user album currently has any assets.
    pub fn album_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM assets WHERE album = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Updates the last_seen timestamp for files found by a rescan.
    pub fn touch_last_seen(&mut self, paths: &[PathBuf], timestamp: i64) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached("UPDATE assets SET last_seen = ?1 WHERE path = ?2")?;
            for path in paths {
                count += stmt.execute(params![timestamp, path.to_string_lossy()])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// Deletes assets not seen since the given timestamp and returns their paths.
    pub fn delete_stale(&self, older_than: i64) -> Result<Vec<PathBuf>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM assets WHERE last_seen < ?1")?;
        let stale: Vec<PathBuf> = stmt
            .query_map(params![older_than], |row| {
                Ok(PathBuf::from(row.get::<_, String>(0)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let deleted = self
            .conn
            .execute("DELETE FROM assets WHERE last_seen < ?1", params![older_than])?;

        if deleted > 0 {
            info!("Deleted {} stale assets", deleted);
        }
        Ok(stale)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Returns the current Unix timestamp.
    pub fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

fn row_to_indexed(row: &Row<'_>) -> rusqlite::Result<IndexedAsset> {
    Ok(IndexedAsset {
        path: PathBuf::from(row.get::<_, String>(0)?),
        album: row.get(1)?,
        created_at: row.get(2)?,
        mtime: row.get(3)?,
        size: row.get(4)?,
        width: row.get(5)?,
        height: row.get(6)?,
        last_seen: row.get(7)?,
    })
}
