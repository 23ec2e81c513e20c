//! Per-media face index.
//!
//! An index is assembled with [`FaceIndexBuilder`] and sealed into an
//! immutable [`FaceIndex`]. The [`IndexStore`] only ever hands out whole
//! `Arc<FaceIndex>` snapshots, so replacing a media's index is a single
//! pointer swap and a reader keeps the snapshot it started with.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;

use crate::models::face::IndexedFace;
use crate::pipeline::embedder::euclidean_distance;

#[derive(Debug)]
pub struct FaceIndexBuilder {
    media_id: String,
    dim: Option<usize>,
    entries: Vec<IndexedFace>,
}

impl FaceIndexBuilder {
    pub fn new(media_id: impl Into<String>) -> Self {
        Self { media_id: media_id.into(), dim: None, entries: Vec::new() }
    }

    pub fn push(&mut self, face: IndexedFace) -> Result<()> {
        if face.media_id != self.media_id {
            bail!("face for media {} pushed into index of {}", face.media_id, self.media_id);
        }
        if face.embedding.is_empty() {
            bail!("track {} has an empty embedding", face.track_id);
        }
        match self.dim {
            Some(d) if d != face.embedding.len() => {
                bail!("embedding dimension {} does not match index dimension {}", face.embedding.len(), d)
            }
            Some(_) => {}
            None => self.dim = Some(face.embedding.len()),
        }
        self.entries.push(face);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn seal(self) -> FaceIndex {
        FaceIndex { media_id: self.media_id, entries: self.entries }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Neighbor<'a> {
    pub face: &'a IndexedFace,
    pub distance: f32,
}

/// Sealed, read-only set of faces for one media asset. Lookup is a linear
/// scan; callers only rely on results coming back in ascending distance.
#[derive(Debug)]
pub struct FaceIndex {
    media_id: String,
    entries: Vec<IndexedFace>,
}

impl FaceIndex {
    pub fn from_faces(media_id: impl Into<String>, faces: Vec<IndexedFace>) -> Result<Self> {
        let mut builder = FaceIndexBuilder::new(media_id);
        for face in faces {
            builder.push(face)?;
        }
        Ok(builder.seal())
    }

    pub fn media_id(&self) -> &str {
        &self.media_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexedFace] {
        &self.entries
    }

    /// Up to `k` entries ordered by ascending distance to `query`; ties go to
    /// the lower track id.
    pub fn nearest(&self, query: &[f32], k: usize) -> Vec<Neighbor<'_>> {
        let mut hits: Vec<Neighbor<'_>> = self
            .entries
            .iter()
            .map(|face| Neighbor { face, distance: euclidean_distance(query, &face.embedding) })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.face.track_id.cmp(&b.face.track_id)));
        hits.truncate(k);
        hits
    }
}

/// Published indexes of every media asset that has been searched or
/// ingested since startup.
#[derive(Default)]
pub struct IndexStore {
    inner: RwLock<HashMap<String, Arc<FaceIndex>>>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, media_id: &str) -> Option<Arc<FaceIndex>> {
        self.inner.read().get(media_id).cloned()
    }

    /// Replace the media's index in one step, returning the previous one.
    pub fn publish(&self, index: FaceIndex) -> Option<Arc<FaceIndex>> {
        let index = Arc::new(index);
        self.inner.write().insert(index.media_id.clone(), index)
    }

    pub fn remove(&self, media_id: &str) -> Option<Arc<FaceIndex>> {
        self.inner.write().remove(media_id)
    }

    /// Put back what [`IndexStore::publish`] returned, undoing a publish.
    pub fn restore(&self, media_id: &str, previous: Option<Arc<FaceIndex>>) {
        let mut map = self.inner.write();
        match previous {
            Some(index) => {
                map.insert(media_id.to_string(), index);
            }
            None => {
                map.remove(media_id);
            }
        }
    }

    /// Return the published index, or build one with `load` and keep it
    /// unless another index was published in the meantime.
    pub fn get_or_load<F>(&self, media_id: &str, load: F) -> Result<Arc<FaceIndex>>
    where
        F: FnOnce() -> Result<FaceIndex>,
    {
        if let Some(index) = self.get(media_id) {
            return Ok(index);
        }
        let loaded = Arc::new(load()?);
        let mut map = self.inner.write();
        Ok(map.entry(media_id.to_string()).or_insert(loaded).clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::face::BoundingBox;
    use std::thread;

    fn face(media: &str, track_id: u32, emb: Vec<f32>) -> IndexedFace {
        IndexedFace {
            media_id: media.into(),
            track_id,
            embedding: emb,
            timestamp: track_id as f64,
            start_ts: 0.0,
            end_ts: 1.0,
            detection_count: 3,
            confidence: 0.9,
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
        }
    }

    #[test]
    fn nearest_is_ordered_by_distance() {
        let index = FaceIndex::from_faces(
            "m",
            vec![face("m", 1, vec![0.0, 1.0]), face("m", 2, vec![1.0, 0.0]), face("m", 3, vec![0.6, 0.8])],
        )
        .unwrap();
        let hits = index.nearest(&[1.0, 0.0], 10);
        let ids: Vec<u32> = hits.iter().map(|h| h.face.track_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert_eq!(index.nearest(&[1.0, 0.0], 1).len(), 1);
    }

    #[test]
    fn empty_index_has_no_neighbors() {
        let index = FaceIndexBuilder::new("m").seal();
        assert!(index.is_empty());
        assert!(index.nearest(&[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn builder_rejects_foreign_or_mismatched_faces() {
        let mut b = FaceIndexBuilder::new("m");
        b.push(face("m", 1, vec![1.0, 0.0])).unwrap();
        assert!(b.push(face("other", 2, vec![1.0, 0.0])).is_err());
        assert!(b.push(face("m", 3, vec![1.0, 0.0, 0.0])).is_err());
        assert!(b.push(face("m", 4, vec![])).is_err());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn publish_swaps_whole_snapshots() {
        let store = IndexStore::new();
        store.publish(FaceIndex::from_faces("m", vec![face("m", 1, vec![1.0, 0.0])]).unwrap());
        let held = store.get("m").unwrap();
        let previous = store.publish(
            FaceIndex::from_faces("m", vec![face("m", 10, vec![0.0, 1.0]), face("m", 11, vec![1.0, 0.0])]).unwrap(),
        );
        assert_eq!(previous.unwrap().len(), 1);
        // a reader that grabbed the old snapshot still sees it complete
        assert_eq!(held.len(), 1);
        assert_eq!(store.get("m").unwrap().len(), 2);
    }

    #[test]
    fn get_or_load_keeps_concurrently_published_index() {
        let store = IndexStore::new();
        let loaded = store
            .get_or_load("m", || {
                store_publish_during_load(&store);
                FaceIndex::from_faces("m", vec![face("m", 1, vec![1.0, 0.0])])
            })
            .unwrap();
        assert_eq!(loaded.len(), 2);
    }

    fn store_publish_during_load(store: &IndexStore) {
        store.publish(
            FaceIndex::from_faces("m", vec![face("m", 5, vec![1.0, 0.0]), face("m", 6, vec![0.0, 1.0])]).unwrap(),
        );
    }

    #[test]
    fn concurrent_readers_never_see_mixed_indexes() {
        let store = Arc::new(IndexStore::new());
        let old = || FaceIndex::from_faces("m", (0..3).map(|i| face("m", i, vec![1.0, 0.0])).collect()).unwrap();
        let new = || FaceIndex::from_faces("m", (100..105).map(|i| face("m", i, vec![0.0, 1.0])).collect()).unwrap();
        store.publish(old());

        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    store.publish(if i % 2 == 0 { new() } else { old() });
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let snap = store.get("m").unwrap();
                        let ids: Vec<u32> = snap.entries().iter().map(|f| f.track_id).collect();
                        assert!(ids == vec![0, 1, 2] || ids == vec![100, 101, 102, 103, 104], "mixed index: {:?}", ids);
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
