use anyhow::Result;
use rusqlite::Connection;

pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5000i64)?;
    Ok(())
}

pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS media (
  id TEXT PRIMARY KEY,
  filename TEXT NOT NULL,
  stored_filename TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'pending',
  duration_secs REAL,
  face_count INTEGER NOT NULL DEFAULT 0,
  failure_reason TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_media_created ON media(created_at);
CREATE INDEX IF NOT EXISTS idx_media_status ON media(status);

CREATE TABLE IF NOT EXISTS indexed_faces (
  id INTEGER PRIMARY KEY,
  media_id TEXT NOT NULL,
  track_id INTEGER NOT NULL,
  embedding_blob BLOB NOT NULL,
  timestamp REAL NOT NULL,
  start_ts REAL NOT NULL,
  end_ts REAL NOT NULL,
  detection_count INTEGER NOT NULL,
  confidence REAL NOT NULL,
  bbox_json TEXT NOT NULL,
  FOREIGN KEY(media_id) REFERENCES media(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_indexed_faces_media ON indexed_faces(media_id);
    "#,
    )?;
    Ok(())
}
