//! SQLite backend implementation.
//!
//! Records, tags and blob metadata live in SQLite; blob bytes live on disk
//! under `blob_root`, one file per blob.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, ToSql};
use tracing::debug;

use super::backend::{
    stream_blob, BlobLimits, BlobReader, BlobStore, MetadataStore, StreamedBlob,
    STREAM_BUFFER_SIZE,
};
use super::schema::{PRAGMAS, SCHEMA};
use crate::error::{Result, StoreError};
use crate::model::{normalize_tags, Blob, BlobId, ImageRecord, NewImageRecord, RecordId};
use crate::query::Predicate;
use crate::tasks::CancelToken;

const SELECT_IMAGES: &str = "SELECT id, original_name, blob_id, content_hash FROM images";

/// Attach the failing operation to a rusqlite error.
trait StorageContext<T> {
    fn storage(self, op: &'static str, id: &str) -> Result<T>;
}

impl<T> StorageContext<T> for rusqlite::Result<T> {
    fn storage(self, op: &'static str, id: &str) -> Result<T> {
        self.map_err(|e| StoreError::storage(op, id, e))
    }
}

pub struct SqliteDb {
    conn: Mutex<Connection>,
    blob_root: PathBuf,
    limits: BlobLimits,
}

impl SqliteDb {
    pub fn open(db_path: &Path, blob_root: &Path, limits: BlobLimits) -> Result<Self> {
        const OP: &str = "open";

        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io(OP, parent.display().to_string(), e))?;
        }
        fs::create_dir_all(blob_root)
            .map_err(|e| StoreError::io(OP, blob_root.display().to_string(), e))?;

        let target = db_path.display().to_string();
        let conn = Connection::open(db_path).storage(OP, &target)?;
        conn.busy_timeout(Duration::from_secs(5)).storage(OP, &target)?;
        conn.execute_batch(PRAGMAS).storage(OP, &target)?;

        Ok(Self {
            conn: Mutex::new(conn),
            blob_root: blob_root.to_path_buf(),
            limits,
        })
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn("initialize")?
            .execute_batch(SCHEMA)
            .storage("initialize", "schema")
    }

    /// Filesystem location of a blob's bytes.
    ///
    /// Shards on the trailing digits: the leading ones are a timestamp and
    /// would put every recent blob in the same directory.
    pub fn blob_path(&self, id: &BlobId) -> PathBuf {
        let id = id.as_str();
        let shard = &id[id.len() - 2..];
        self.blob_root.join(shard).join(id)
    }

    fn conn(&self, op: &'static str) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::storage(op, "connection", "lock poisoned"))
    }

    fn write_blob_file(
        &self,
        path: &Path,
        reader: &mut dyn Read,
        cancel: &CancelToken,
        id: &BlobId,
    ) -> Result<StreamedBlob> {
        const OP: &str = "create_blob";

        let file = File::create(path).map_err(|e| StoreError::io(OP, id.as_str(), e))?;
        let mut writer = BufWriter::with_capacity(STREAM_BUFFER_SIZE, file);
        let streamed = stream_blob(reader, &mut writer, &self.limits, cancel, id)?;
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::io(OP, id.as_str(), e.into_error()))?;
        file.sync_all()
            .map_err(|e| StoreError::io(OP, id.as_str(), e))?;
        Ok(streamed)
    }
}

fn read_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<ImageRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tag_stmt =
        conn.prepare_cached("SELECT tag FROM image_tags WHERE image_id = ? ORDER BY tag")?;
    rows.into_iter()
        .map(|(id, original_name, blob_id, cached_hash)| {
            let tags = tag_stmt
                .query_map([&id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<BTreeSet<String>>>()?;
            Ok(ImageRecord {
                id: RecordId::from_stored(id),
                original_name,
                tags,
                blob_ref: BlobId::from_stored(blob_id),
                cached_hash,
            })
        })
        .collect()
}

fn insert_tags(conn: &Connection, id: &RecordId, tags: &BTreeSet<String>) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached("INSERT INTO image_tags (image_id, tag) VALUES (?, ?)")?;
    for tag in tags {
        stmt.execute(rusqlite::params![id.as_str(), tag])?;
    }
    Ok(())
}

impl BlobStore for SqliteDb {
    fn create_blob(&self, reader: &mut dyn Read, cancel: &CancelToken) -> Result<BlobId> {
        const OP: &str = "create_blob";

        let id = BlobId::generate();
        let path = self.blob_path(&id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(OP, id.as_str(), e))?;
        }

        // Written under a temp name so a failed upload never looks complete.
        let temp_path = path.with_extension("tmp");
        let streamed = match self.write_blob_file(&temp_path, reader, cancel, &id) {
            Ok(streamed) => streamed,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::io(OP, id.as_str(), e));
        }

        let inserted = self.conn(OP).and_then(|conn| {
            conn.execute(
                "INSERT INTO blobs (id, content_type, size_bytes) VALUES (?, ?, ?)",
                rusqlite::params![id.as_str(), streamed.content_type, streamed.size as i64],
            )
            .storage(OP, id.as_str())
        });
        if let Err(e) = inserted {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        debug!(
            blob_id = %id,
            size = streamed.size,
            content_type = %streamed.content_type,
            "Blob created"
        );
        Ok(id)
    }

    fn open_blob(&self, id: &BlobId) -> Result<(BlobReader, String)> {
        const OP: &str = "open_blob";

        let content_type: Option<String> = self
            .conn(OP)?
            .query_row(
                "SELECT content_type FROM blobs WHERE id = ?",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .storage(OP, id.as_str())?;
        let content_type = content_type.ok_or_else(|| StoreError::not_found(OP, "blob", id.as_str()))?;

        let file = File::open(self.blob_path(id)).map_err(|e| StoreError::io(OP, id.as_str(), e))?;
        let reader = BlobReader::new(id.clone(), BufReader::with_capacity(STREAM_BUFFER_SIZE, file));
        Ok((reader, content_type))
    }

    fn blob_info(&self, id: &BlobId) -> Result<Blob> {
        const OP: &str = "blob_info";

        self.conn(OP)?
            .query_row(
                "SELECT content_type, size_bytes FROM blobs WHERE id = ?",
                [id.as_str()],
                |row| {
                    Ok(Blob {
                        id: id.clone(),
                        content_type: row.get(0)?,
                        size: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()
            .storage(OP, id.as_str())?
            .ok_or_else(|| StoreError::not_found(OP, "blob", id.as_str()))
    }

    fn delete_blob(&self, id: &BlobId) -> Result<bool> {
        const OP: &str = "delete_blob";

        let mut conn = self.conn(OP)?;
        let tx = conn.transaction().storage(OP, id.as_str())?;
        let removed = tx
            .execute("DELETE FROM blobs WHERE id = ?", [id.as_str()])
            .storage(OP, id.as_str())?
            > 0;

        // The row only goes once the file is gone; dropping `tx` rolls back.
        match fs::remove_file(self.blob_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(OP, id.as_str(), e)),
        }

        tx.commit().storage(OP, id.as_str())?;
        Ok(removed)
    }
}

impl MetadataStore for SqliteDb {
    fn insert(&self, record: NewImageRecord) -> Result<RecordId> {
        const OP: &str = "insert";

        let id = RecordId::generate();
        let tags = normalize_tags(&record.tags);

        let mut conn = self.conn(OP)?;
        let tx = conn.transaction().storage(OP, id.as_str())?;
        tx.execute(
            "INSERT INTO images (id, original_name, blob_id) VALUES (?, ?, ?)",
            rusqlite::params![id.as_str(), record.original_name, record.blob_ref.as_str()],
        )
        .storage(OP, id.as_str())?;
        insert_tags(&tx, &id, &tags).storage(OP, id.as_str())?;
        tx.commit().storage(OP, id.as_str())?;

        Ok(id)
    }

    fn find_by_id(&self, id: &RecordId) -> Result<ImageRecord> {
        const OP: &str = "find_by_id";

        let conn = self.conn(OP)?;
        read_records(&conn, &format!("{} WHERE id = ?", SELECT_IMAGES), [id.as_str()])
            .storage(OP, id.as_str())?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::not_found(OP, "record", id.as_str()))
    }

    fn find(&self, predicate: &Predicate) -> Result<Vec<ImageRecord>> {
        const OP: &str = "find";

        let conn = self.conn(OP)?;
        let records = match predicate {
            Predicate::All => {
                read_records(&conn, &format!("{} ORDER BY id", SELECT_IMAGES), [])
            }
            Predicate::Untagged => read_records(
                &conn,
                &format!(
                    "{} WHERE NOT EXISTS (SELECT 1 FROM image_tags t WHERE t.image_id = images.id) ORDER BY id",
                    SELECT_IMAGES
                ),
                [],
            ),
            Predicate::AllOf(tags) => {
                let placeholders: Vec<&str> = tags.iter().map(|_| "?").collect();
                let sql = format!(
                    r#"
                    {} WHERE id IN (
                        SELECT image_id FROM image_tags
                        WHERE tag IN ({})
                        GROUP BY image_id
                        HAVING COUNT(*) = ?
                    )
                    ORDER BY id
                    "#,
                    SELECT_IMAGES,
                    placeholders.join(", ")
                );
                let required = tags.len() as i64;
                let mut params: Vec<&dyn ToSql> = tags.iter().map(|t| t as &dyn ToSql).collect();
                params.push(&required);
                read_records(&conn, &sql, params.as_slice())
            }
        };
        records.storage(OP, &predicate.to_string())
    }

    fn replace_tags(&self, id: &RecordId, tags: &[String]) -> Result<()> {
        const OP: &str = "replace_tags";

        let tags = normalize_tags(tags);
        let mut conn = self.conn(OP)?;
        let tx = conn.transaction().storage(OP, id.as_str())?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM images WHERE id = ?)",
                [id.as_str()],
                |row| row.get(0),
            )
            .storage(OP, id.as_str())?;
        if !exists {
            return Err(StoreError::not_found(OP, "record", id.as_str()));
        }

        tx.execute("DELETE FROM image_tags WHERE image_id = ?", [id.as_str()])
            .storage(OP, id.as_str())?;
        insert_tags(&tx, id, &tags).storage(OP, id.as_str())?;
        tx.commit().storage(OP, id.as_str())?;

        debug!(record_id = %id, tags = tags.len(), "Tags replaced");
        Ok(())
    }

    fn set_cached_hash(&self, id: &RecordId, expected_blob: &BlobId, hash: &str) -> Result<bool> {
        const OP: &str = "set_cached_hash";

        let changed = self
            .conn(OP)?
            .execute(
                "UPDATE images SET content_hash = ? WHERE id = ? AND blob_id = ?",
                rusqlite::params![hash, id.as_str(), expected_blob.as_str()],
            )
            .storage(OP, id.as_str())?;
        Ok(changed == 1)
    }

    fn count(&self) -> Result<usize> {
        const OP: &str = "count";

        let count: i64 = self
            .conn(OP)?
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))
            .storage(OP, "images")?;
        Ok(count as usize)
    }

    fn remove_tagged(&self, tag: &str) -> Result<Vec<ImageRecord>> {
        const OP: &str = "remove_tagged";

        let mut conn = self.conn(OP)?;
        let tx = conn.transaction().storage(OP, tag)?;

        let removed = read_records(
            &tx,
            &format!(
                "{} WHERE id IN (SELECT image_id FROM image_tags WHERE tag = ?) ORDER BY id",
                SELECT_IMAGES
            ),
            [tag],
        )
        .storage(OP, tag)?;

        {
            let mut delete_tags = tx
                .prepare("DELETE FROM image_tags WHERE image_id = ?")
                .storage(OP, tag)?;
            let mut delete_image = tx.prepare("DELETE FROM images WHERE id = ?").storage(OP, tag)?;
            for record in &removed {
                delete_tags.execute([record.id.as_str()]).storage(OP, record.id.as_str())?;
                delete_image.execute([record.id.as_str()]).storage(OP, record.id.as_str())?;
            }
        }
        tx.commit().storage(OP, tag)?;

        Ok(removed)
    }

    fn is_blob_referenced(&self, blob: &BlobId) -> Result<bool> {
        const OP: &str = "is_blob_referenced";

        self.conn(OP)?
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM images WHERE blob_id = ?)",
                [blob.as_str()],
                |row| row.get(0),
            )
            .storage(OP, blob.as_str())
    }
}
