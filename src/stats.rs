use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::models::media::MediaStatus;

/// Process-wide counters behind `/metrics`.
pub struct Stats {
    requests_total: AtomicU64,
    uploads_total: AtomicU64,
    ingest_completed: AtomicU64,
    ingest_failed: AtomicU64,
    ingest_timeouts: AtomicU64,
    frames_sampled: AtomicU64,
    frames_failed: AtomicU64,
    faces_indexed: AtomicU64,
    searches_total: AtomicU64,
    search_matches: AtomicU64,
    search_no_face: AtomicU64,
    search_not_ready: AtomicU64,
    started: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            uploads_total: AtomicU64::new(0),
            ingest_completed: AtomicU64::new(0),
            ingest_failed: AtomicU64::new(0),
            ingest_timeouts: AtomicU64::new(0),
            frames_sampled: AtomicU64::new(0),
            frames_failed: AtomicU64::new(0),
            faces_indexed: AtomicU64::new(0),
            searches_total: AtomicU64::new(0),
            search_matches: AtomicU64::new(0),
            search_no_face: AtomicU64::new(0),
            search_not_ready: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn inc_requests(&self) { self.requests_total.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_uploads(&self) { self.uploads_total.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_ingest_failed(&self) { self.ingest_failed.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_ingest_timeouts(&self) { self.ingest_timeouts.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_searches(&self) { self.searches_total.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_search_matches(&self) { self.search_matches.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_search_no_face(&self) { self.search_no_face.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_search_not_ready(&self) { self.search_not_ready.fetch_add(1, Ordering::Relaxed); }

    pub fn record_ingest(&self, frames_sampled: u64, frames_failed: u64, faces: u64) {
        self.ingest_completed.fetch_add(1, Ordering::Relaxed);
        self.frames_sampled.fetch_add(frames_sampled, Ordering::Relaxed);
        self.frames_failed.fetch_add(frames_failed, Ordering::Relaxed);
        self.faces_indexed.fetch_add(faces, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 { self.requests_total.load(Ordering::Relaxed) }
    pub fn ingest_completed(&self) -> u64 { self.ingest_completed.load(Ordering::Relaxed) }
    pub fn ingest_failed(&self) -> u64 { self.ingest_failed.load(Ordering::Relaxed) }
    pub fn frames_failed(&self) -> u64 { self.frames_failed.load(Ordering::Relaxed) }
    pub fn searches_total(&self) -> u64 { self.searches_total.load(Ordering::Relaxed) }
    pub fn search_matches(&self) -> u64 { self.search_matches.load(Ordering::Relaxed) }
    pub fn uptime_secs(&self) -> u64 { self.started.elapsed().as_secs() }

    /// Prometheus text exposition. `media` is the current per-status count.
    pub fn metrics_text(&self, media: &[(MediaStatus, i64)]) -> String {
        let counters = [
            ("facet_requests_total", "HTTP requests served", &self.requests_total),
            ("facet_uploads_total", "Videos uploaded", &self.uploads_total),
            ("facet_ingest_completed_total", "Ingestion runs that published an index", &self.ingest_completed),
            ("facet_ingest_failed_total", "Ingestion runs that ended failed", &self.ingest_failed),
            ("facet_ingest_timeouts_total", "Ingestion runs cancelled by timeout", &self.ingest_timeouts),
            ("facet_frames_sampled_total", "Frames sampled by completed runs", &self.frames_sampled),
            ("facet_frames_failed_total", "Sampled frames skipped after inference errors", &self.frames_failed),
            ("facet_faces_indexed_total", "Faces published to indexes", &self.faces_indexed),
            ("facet_searches_total", "Search requests", &self.searches_total),
            ("facet_search_matches_total", "Searches that found a match", &self.search_matches),
            ("facet_search_no_face_total", "Searches whose query had no face", &self.search_no_face),
            ("facet_search_not_ready_total", "Searches against media that was not ready", &self.search_not_ready),
        ];
        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!("# HELP {} {}\n# TYPE {} counter\n{} {}\n", name, help, name, name, value.load(Ordering::Relaxed)));
        }
        out.push_str("# HELP facet_media Media assets by ingestion status\n# TYPE facet_media gauge\n");
        for (status, n) in media {
            out.push_str(&format!("facet_media{{status=\"{}\"}} {}\n", status, n));
        }
        out.push_str(&format!("# TYPE facet_uptime_seconds gauge\nfacet_uptime_seconds {}\n", self.uptime_secs()));
        out
    }
}
