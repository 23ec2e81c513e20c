use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::face::IndexedFace;
use crate::models::media::{MediaAsset, MediaStatus};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn insert_media(conn: &Connection, media: &MediaAsset) -> Result<()> {
    conn.execute(
        "INSERT INTO media (id, filename, stored_filename, status, duration_secs, face_count, failure_reason, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            media.id,
            media.filename,
            media.stored_filename,
            media.status.as_str(),
            media.duration_secs,
            media.face_count,
            media.failure_reason,
            media.created_at,
            media.updated_at,
        ],
    )
    .with_context(|| format!("failed to insert media {}", media.id))?;
    Ok(())
}

fn current_status(conn: &Connection, media_id: &str) -> Result<Option<MediaStatus>> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM media WHERE id = ?1", params![media_id], |r| r.get(0))
        .optional()?;
    status.map(|s| s.parse()).transpose()
}

/// Move `media_id` to `next`, refusing transitions the state machine does
/// not allow. Returns the status it moved from.
pub fn transition_status(
    conn: &Connection,
    media_id: &str,
    next: MediaStatus,
    failure_reason: Option<&str>,
) -> Result<MediaStatus> {
    let tx = conn.unchecked_transaction()?;
    let prev = match current_status(&tx, media_id)? {
        Some(s) => s,
        None => bail!("media {} does not exist", media_id),
    };
    if !prev.can_transition_to(next) {
        bail!("media {}: illegal status transition {} -> {}", media_id, prev, next);
    }
    tx.execute(
        "UPDATE media SET status = ?1, failure_reason = ?2, updated_at = ?3 WHERE id = ?4",
        params![next.as_str(), failure_reason, now(), media_id],
    )?;
    tx.commit()?;
    Ok(prev)
}

pub fn mark_failed(conn: &Connection, media_id: &str, reason: &str) -> Result<MediaStatus> {
    transition_status(conn, media_id, MediaStatus::Failed, Some(reason))
}

/// Replace every indexed face of `media_id` and mark it ready, in one
/// transaction. The media must currently be `processing`.
pub fn publish_media_index(
    conn: &Connection,
    media_id: &str,
    faces: &[IndexedFace],
    duration_secs: Option<f64>,
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    match current_status(&tx, media_id)? {
        Some(MediaStatus::Processing) => {}
        Some(other) => bail!("media {} is {}, not processing; refusing to publish", media_id, other),
        None => bail!("media {} does not exist", media_id),
    }
    tx.execute("DELETE FROM indexed_faces WHERE media_id = ?1", params![media_id])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO indexed_faces (media_id, track_id, embedding_blob, timestamp, start_ts, end_ts, detection_count, confidence, bbox_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for face in faces {
            if face.media_id != media_id {
                bail!("face of media {} cannot be published under {}", face.media_id, media_id);
            }
            let bbox_json = serde_json::to_string(&face.bbox)?;
            stmt.execute(params![
                media_id,
                face.track_id,
                encode_embedding(&face.embedding),
                face.timestamp,
                face.start_ts,
                face.end_ts,
                face.detection_count,
                face.confidence as f64,
                bbox_json,
            ])?;
        }
    }
    tx.execute(
        "UPDATE media SET status = 'ready', face_count = ?1, duration_secs = COALESCE(?2, duration_secs),
                failure_reason = NULL, updated_at = ?3
         WHERE id = ?4",
        params![faces.len() as i64, duration_secs, now(), media_id],
    )?;
    tx.commit()?;
    Ok(())
}

/// Fail media a previous process left unfinished. Nothing is running yet at
/// startup, so anything pending or processing is stranded.
pub fn fail_interrupted(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "UPDATE media SET status = 'failed', failure_reason = 'ingestion interrupted by server restart', updated_at = ?1
         WHERE status IN ('pending', 'processing')",
        params![now()],
    )?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, query};
    use crate::models::face::BoundingBox;
    use tempfile::TempDir;

    fn setup_test_db() -> (TempDir, Connection) {
        let tmp = TempDir::new().unwrap();
        let conn = db::open_or_create(tmp.path().join("test.db")).unwrap();
        (tmp, conn)
    }

    fn media(id: &str) -> MediaAsset {
        MediaAsset {
            id: id.into(),
            filename: "clip.mp4".into(),
            stored_filename: format!("{}.mp4", id),
            status: MediaStatus::Pending,
            duration_secs: None,
            face_count: 0,
            failure_reason: None,
            created_at: 100,
            updated_at: 100,
        }
    }

    fn face(media_id: &str, track_id: u32) -> IndexedFace {
        IndexedFace {
            media_id: media_id.into(),
            track_id,
            embedding: vec![0.6, 0.8],
            timestamp: 1.5,
            start_ts: 1.0,
            end_ts: 2.0,
            detection_count: 4,
            confidence: 0.9,
            bbox: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
        }
    }

    #[test]
    fn transitions_follow_state_machine() {
        let (_tmp, conn) = setup_test_db();
        insert_media(&conn, &media("a")).unwrap();
        assert!(transition_status(&conn, "a", MediaStatus::Ready, None).is_err());
        assert_eq!(transition_status(&conn, "a", MediaStatus::Processing, None).unwrap(), MediaStatus::Pending);
        mark_failed(&conn, "a", "decode error").unwrap();
        let m = query::get_media(&conn, "a").unwrap().unwrap();
        assert_eq!(m.status, MediaStatus::Failed);
        assert_eq!(m.failure_reason.as_deref(), Some("decode error"));
        assert!(transition_status(&conn, "missing", MediaStatus::Processing, None).is_err());
    }

    #[test]
    fn publish_replaces_faces_and_sets_ready() {
        let (_tmp, conn) = setup_test_db();
        insert_media(&conn, &media("a")).unwrap();
        transition_status(&conn, "a", MediaStatus::Processing, None).unwrap();
        publish_media_index(&conn, "a", &[face("a", 1), face("a", 2)], Some(12.0)).unwrap();

        transition_status(&conn, "a", MediaStatus::Processing, None).unwrap();
        publish_media_index(&conn, "a", &[face("a", 9)], None).unwrap();

        let m = query::get_media(&conn, "a").unwrap().unwrap();
        assert_eq!(m.status, MediaStatus::Ready);
        assert_eq!(m.face_count, 1);
        assert_eq!(m.duration_secs, Some(12.0));
        let faces = query::load_media_faces(&conn, "a").unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].track_id, 9);
        assert_eq!(faces[0].bbox, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
    }

    #[test]
    fn publish_requires_processing() {
        let (_tmp, conn) = setup_test_db();
        insert_media(&conn, &media("a")).unwrap();
        assert!(publish_media_index(&conn, "a", &[face("a", 1)], None).is_err());
        assert!(query::load_media_faces(&conn, "a").unwrap().is_empty());
    }

    #[test]
    fn failed_publish_leaves_previous_faces() {
        let (_tmp, conn) = setup_test_db();
        insert_media(&conn, &media("a")).unwrap();
        transition_status(&conn, "a", MediaStatus::Processing, None).unwrap();
        publish_media_index(&conn, "a", &[face("a", 1)], None).unwrap();
        transition_status(&conn, "a", MediaStatus::Processing, None).unwrap();
        // second face belongs to another media: the whole write rolls back
        assert!(publish_media_index(&conn, "a", &[face("a", 2), face("b", 3)], None).is_err());
        let faces = query::load_media_faces(&conn, "a").unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].track_id, 1);
    }

    #[test]
    fn interrupted_jobs_fail_on_startup() {
        let (_tmp, conn) = setup_test_db();
        insert_media(&conn, &media("a")).unwrap();
        insert_media(&conn, &media("b")).unwrap();
        transition_status(&conn, "b", MediaStatus::Processing, None).unwrap();
        insert_media(&conn, &media("c")).unwrap();
        transition_status(&conn, "c", MediaStatus::Processing, None).unwrap();
        publish_media_index(&conn, "c", &[], None).unwrap();

        assert_eq!(fail_interrupted(&conn).unwrap(), 2);
        assert_eq!(query::get_media_status(&conn, "b").unwrap(), Some(MediaStatus::Failed));
        assert_eq!(query::get_media_status(&conn, "c").unwrap(), Some(MediaStatus::Ready));
    }
}
