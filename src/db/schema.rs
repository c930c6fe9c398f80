pub const SCHEMA: &str = r#"
-- Blobs: raw image bytes live on disk, keyed by id
CREATE TABLE IF NOT EXISTS blobs (
    id TEXT PRIMARY KEY,
    content_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Images: one record per upload, referencing exactly one blob
CREATE TABLE IF NOT EXISTS images (
    id TEXT PRIMARY KEY,
    original_name TEXT NOT NULL,
    blob_id TEXT NOT NULL,
    content_hash TEXT,          -- cached xxh32 of the blob, 8 hex digits
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (blob_id) REFERENCES blobs(id)
);

CREATE INDEX IF NOT EXISTS idx_images_blob ON images(blob_id);
CREATE INDEX IF NOT EXISTS idx_images_hash ON images(content_hash);

-- Image tags: the tag set of each image
CREATE TABLE IF NOT EXISTS image_tags (
    image_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (image_id, tag),
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_image_tags_tag ON image_tags(tag);
"#;

/// Connection settings applied on every open.
pub const PRAGMAS: &str = r#"
PRAGMA foreign_keys = ON;
"#;
