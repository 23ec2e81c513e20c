use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::face::{BoundingBox, IndexedFace};
use crate::models::media::{MediaAsset, MediaStatus};

const MEDIA_COLUMNS: &str =
    "id, filename, stored_filename, status, duration_secs, face_count, failure_reason, created_at, updated_at";

fn row_to_media(row: &Row<'_>) -> rusqlite::Result<MediaAsset> {
    let status: String = row.get("status")?;
    let status = status.parse::<MediaStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(MediaAsset {
        id: row.get("id")?,
        filename: row.get("filename")?,
        stored_filename: row.get("stored_filename")?,
        status,
        duration_secs: row.get("duration_secs")?,
        face_count: row.get("face_count")?,
        failure_reason: row.get("failure_reason")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn get_media(conn: &Connection, id: &str) -> Result<Option<MediaAsset>> {
    let sql = format!("SELECT {} FROM media WHERE id = ?1", MEDIA_COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_media).optional()?)
}

/// All media, newest first.
pub fn list_media(conn: &Connection) -> Result<Vec<MediaAsset>> {
    let sql = format!("SELECT {} FROM media ORDER BY created_at DESC, rowid DESC", MEDIA_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_media)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn get_media_status(conn: &Connection, id: &str) -> Result<Option<MediaStatus>> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM media WHERE id = ?1", params![id], |r| r.get(0))
        .optional()?;
    status.map(|s| s.parse()).transpose()
}

pub fn count_media_by_status(conn: &Connection) -> Result<Vec<(MediaStatus, i64)>> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM media GROUP BY status ORDER BY status")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    let mut out = Vec::new();
    for r in rows {
        let (status, n) = r?;
        out.push((status.parse()?, n));
    }
    Ok(out)
}

/// Persisted index of one media, in track order.
pub fn load_media_faces(conn: &Connection, media_id: &str) -> Result<Vec<IndexedFace>> {
    let mut stmt = conn.prepare(
        "SELECT track_id, embedding_blob, timestamp, start_ts, end_ts, detection_count, confidence, bbox_json
         FROM indexed_faces WHERE media_id = ?1 ORDER BY track_id",
    )?;
    let rows = stmt.query_map(params![media_id], |r| {
        Ok((
            r.get::<_, u32>(0)?,
            r.get::<_, Vec<u8>>(1)?,
            r.get::<_, f64>(2)?,
            r.get::<_, f64>(3)?,
            r.get::<_, f64>(4)?,
            r.get::<_, u32>(5)?,
            r.get::<_, f64>(6)?,
            r.get::<_, String>(7)?,
        ))
    })?;
    let mut faces = Vec::new();
    for r in rows {
        let (track_id, blob, timestamp, start_ts, end_ts, detection_count, confidence, bbox_json) = r?;
        let embedding = decode_embedding_blob(&blob)
            .with_context(|| format!("corrupt embedding for media {} track {}", media_id, track_id))?;
        let bbox: BoundingBox = serde_json::from_str(&bbox_json)?;
        faces.push(IndexedFace {
            media_id: media_id.to_string(),
            track_id,
            embedding,
            timestamp,
            start_ts,
            end_ts,
            detection_count,
            confidence: confidence as f32,
            bbox,
        });
    }
    Ok(faces)
}

pub fn decode_embedding_blob(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        anyhow::bail!("Embedding blob length is not a multiple of 4");
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
