//! Linear-scan matching of mask descriptors against previously stored masks.
//!
//! Candidates are first filtered by a tolerance band around the query's
//! contour count and total area, then scored by the mean of the two
//! `min/max` ratios. The best score strictly above the threshold wins; equal
//! scores resolve to the record inserted first.
//!
//! Histogram and moments are stored with every record but do not take part
//! in scoring.

use std::fmt;

use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::features::FeatureVector;

/// Identifier assigned by [`MaskStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque reference to the image a mask belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(pub String);

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageRef {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A mask kept for later matching.
#[derive(Debug, Clone)]
pub struct StoredMaskRecord {
    /// Store-assigned id.
    pub id: RecordId,
    /// Owning image.
    pub image: ImageRef,
    /// The removal mask itself.
    pub mask: GrayImage,
    /// Descriptor of `mask`.
    pub features: FeatureVector,
}

/// Best candidate returned by [`MaskStore::find_similar_mask`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityMatch {
    /// Matching record.
    pub id: RecordId,
    /// Score in `(threshold, 1]`.
    pub similarity: f64,
}

/// `min / max` of two non-negative values, 1.0 when both are zero.
#[must_use]
pub fn ratio(a: f64, b: f64) -> f64 {
    let hi = a.max(b);
    if hi <= 0.0 {
        1.0
    } else {
        a.min(b) / hi
    }
}

/// Whether `candidate` lies in `[reference * (1 - tolerance), reference * (1 + tolerance)]`.
#[must_use]
pub fn within_band(candidate: f64, reference: f64, tolerance: f64) -> bool {
    let low = reference * (1.0 - tolerance);
    let high = reference * (1.0 + tolerance);
    (low..=high).contains(&candidate)
}

#[allow(clippy::cast_precision_loss)]
fn contour_count(features: &FeatureVector) -> f64 {
    features.num_contours as f64
}

/// Score of `candidate` against `query`: mean of the contour-count and area ratios.
#[must_use]
pub fn similarity(query: &FeatureVector, candidate: &FeatureVector) -> f64 {
    let contours = ratio(contour_count(query), contour_count(candidate));
    let area = ratio(query.total_area, candidate.total_area);
    (contours + area) / 2.0
}

/// Whether `candidate` passes the band filter around `query`.
#[must_use]
pub fn in_band(query: &FeatureVector, candidate: &FeatureVector, tolerance: f64) -> bool {
    within_band(contour_count(candidate), contour_count(query), tolerance)
        && within_band(candidate.total_area, query.total_area, tolerance)
}

/// In-memory collection of stored masks, kept in insertion order.
///
/// Not synchronized: callers sharing a store across threads must serialize
/// inserts and lookups themselves.
#[derive(Debug, Default)]
pub struct MaskStore {
    records: Vec<StoredMaskRecord>,
    next_id: u64,
}

impl MaskStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted `(image, encoded mask, features JSON)` triples.
    ///
    /// Ids are reassigned in iteration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Image`] if a mask does not decode,
    /// [`Error::Serialization`] for malformed JSON and [`Error::InvalidInput`]
    /// for a histogram that is not 256 buckets long.
    pub fn from_persisted<I, B, S>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = (ImageRef, B, S)>,
        B: AsRef<[u8]>,
        S: AsRef<str>,
    {
        let mut store = Self::new();
        for (image, mask_bytes, features_json) in records {
            let mask = image::load_from_memory(mask_bytes.as_ref())?.to_luma8();
            let features = FeatureVector::from_json(features_json.as_ref())?;
            store.insert(image, mask, features);
        }
        debug!(records = store.len(), "restored mask store");
        Ok(store)
    }

    /// Add a record and return its id.
    pub fn insert(&mut self, image: ImageRef, mask: GrayImage, features: FeatureVector) -> RecordId {
        let id = RecordId(self.next_id);
        self.next_id += 1;
        self.records.push(StoredMaskRecord {
            id,
            image,
            mask,
            features,
        });
        id
    }

    /// Look up a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn get(&self, id: RecordId) -> Result<&StoredMaskRecord> {
        self.records
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("mask record {id}")))
    }

    /// Remove and return a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn remove(&mut self, id: RecordId) -> Result<StoredMaskRecord> {
        let pos = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("mask record {id}")))?;
        Ok(self.records.remove(pos))
    }

    /// Drop every record owned by `image`, returning how many were removed.
    pub fn remove_for_image(&mut self, image: &ImageRef) -> usize {
        let before = self.records.len();
        self.records.retain(|r| &r.image != image);
        before - self.records.len()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, StoredMaskRecord> {
        self.records.iter()
    }

    /// Find the stored mask most similar to `query`.
    ///
    /// `threshold` serves both as the band tolerance and as the score a match
    /// must strictly exceed. `Ok(None)` means nothing qualified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `threshold` is not a finite value in `[0, 1]`.
    pub fn find_similar_mask(
        &self,
        query: &FeatureVector,
        threshold: f64,
    ) -> Result<Option<SimilarityMatch>> {
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidInput(format!(
                "similarity threshold {threshold} outside [0, 1]"
            )));
        }

        let mut best: Option<SimilarityMatch> = None;
        for record in &self.records {
            if !in_band(query, &record.features, threshold) {
                continue;
            }
            let score = similarity(query, &record.features);
            if score > threshold && best.is_none_or(|b| score > b.similarity) {
                best = Some(SimilarityMatch {
                    id: record.id,
                    similarity: score,
                });
            }
        }

        debug!(
            candidates = self.records.len(),
            matched = ?best.map(|b| b.id),
            "similarity scan"
        );
        Ok(best)
    }
}

impl<'a> IntoIterator for &'a MaskStore {
    type Item = &'a StoredMaskRecord;
    type IntoIter = std::slice::Iter<'a, StoredMaskRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn features(num_contours: usize, total_area: f64) -> FeatureVector {
        FeatureVector {
            histogram: vec![0; 256],
            num_contours,
            total_area,
            moments: BTreeMap::new(),
        }
    }

    fn store_of(items: &[(usize, f64)]) -> MaskStore {
        let mut store = MaskStore::new();
        for (i, &(n, a)) in items.iter().enumerate() {
            store.insert(
                ImageRef(format!("img{i}")),
                GrayImage::new(1, 1),
                features(n, a),
            );
        }
        store
    }

    #[test]
    fn ratio_handles_zero() {
        assert!((ratio(0.0, 0.0) - 1.0).abs() < f64::EPSILON);
        assert!(ratio(0.0, 5.0).abs() < f64::EPSILON);
        assert!((ratio(2.0, 4.0) - 0.5).abs() < f64::EPSILON);
        assert!((ratio(4.0, 2.0) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn band_is_inclusive() {
        assert!(within_band(3.0, 4.0, 0.25));
        assert!(within_band(5.0, 4.0, 0.25));
        assert!(!within_band(5.5, 4.0, 0.25));
        assert!(!within_band(2.5, 4.0, 0.25));
    }

    #[test]
    fn self_match_scores_one() {
        let store = store_of(&[(3, 10.0), (12, 400.0), (7, 90.0)]);
        for threshold in [0.0, 0.5, 0.9, 0.999] {
            let m = store
                .find_similar_mask(&features(12, 400.0), threshold)
                .unwrap()
                .unwrap();
            assert_eq!(m.id, RecordId(1));
            assert!((m.similarity - 1.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn zero_contour_query_self_matches() {
        let store = store_of(&[(0, 0.0)]);
        let m = store.find_similar_mask(&features(0, 0.0), 0.9).unwrap();
        assert_eq!(m.map(|m| m.id), Some(RecordId(0)));
    }

    #[test]
    fn contour_band_excludes_even_when_area_matches() {
        // band for 4 contours at 0.25 is [3, 5]
        let store = store_of(&[(6, 100.0)]);
        assert_eq!(store.find_similar_mask(&features(4, 100.0), 0.25).unwrap(), None);

        // at the edge of the band the candidate is scored: (4/5 + 1) / 2 = 0.9
        let store = store_of(&[(5, 100.0)]);
        let m = store.find_similar_mask(&features(4, 100.0), 0.25).unwrap().unwrap();
        assert!((m.similarity - 0.9).abs() < 1e-12);
    }

    #[test]
    fn area_band_excludes() {
        let store = store_of(&[(4, 200.0)]);
        assert_eq!(store.find_similar_mask(&features(4, 100.0), 0.5).unwrap(), None);
    }

    #[test]
    fn score_must_exceed_threshold() {
        // in band at 0.5, score (1 + 0.5) / 2 = 0.75
        let store = store_of(&[(4, 150.0)]);
        let q = features(4, 100.0);
        assert!(store.find_similar_mask(&q, 0.5).unwrap().is_some());
        // score 0.75 does not beat a 0.75 threshold, band [25, 175] still admits it
        let store = store_of(&[(4, 50.0)]);
        assert_eq!(store.find_similar_mask(&q, 0.75).unwrap(), None);
    }

    #[test]
    fn best_score_wins_and_ties_keep_first() {
        let store = store_of(&[(10, 95.0), (10, 99.0), (10, 102.0), (10, 99.0)]);
        let m = store.find_similar_mask(&features(10, 100.0), 0.5).unwrap().unwrap();
        assert_eq!(m.id, RecordId(1));
    }

    #[test]
    fn threshold_is_validated() {
        let store = store_of(&[(1, 1.0)]);
        for bad in [-0.1, 1.1, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                store.find_similar_mask(&features(1, 1.0), bad),
                Err(Error::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn empty_store_matches_nothing() {
        let store = MaskStore::new();
        assert!(store.is_empty());
        assert_eq!(store.find_similar_mask(&features(1, 1.0), 0.5).unwrap(), None);
    }

    #[test]
    fn get_and_remove() {
        let mut store = store_of(&[(1, 1.0), (2, 2.0)]);
        assert_eq!(store.get(RecordId(1)).unwrap().features.num_contours, 2);
        assert!(matches!(store.get(RecordId(9)), Err(Error::NotFound(_))));

        let removed = store.remove(RecordId(0)).unwrap();
        assert_eq!(removed.image, ImageRef::from("img0"));
        assert_eq!(store.len(), 1);
        assert!(matches!(store.remove(RecordId(0)), Err(Error::NotFound(_))));

        // ids are never reused
        let id = store.insert(ImageRef::from("new"), GrayImage::new(1, 1), features(0, 0.0));
        assert_eq!(id, RecordId(2));
    }

    #[test]
    fn cascade_removes_all_records_of_an_image() {
        let mut store = MaskStore::new();
        let owner = ImageRef::from("a.png");
        store.insert(owner.clone(), GrayImage::new(1, 1), features(1, 1.0));
        store.insert(ImageRef::from("b.png"), GrayImage::new(1, 1), features(1, 1.0));
        store.insert(owner.clone(), GrayImage::new(1, 1), features(2, 2.0));
        assert_eq!(store.remove_for_image(&owner), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.iter().next().map(|r| r.image.0.as_str()), Some("b.png"));
    }

    #[test]
    fn restores_from_persisted_records() {
        let mut png = Vec::new();
        GrayImage::from_pixel(3, 2, image::Luma([9]))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let json = serde_json::to_string(&features(2, 8.0)).unwrap();

        let store =
            MaskStore::from_persisted(vec![(ImageRef::from("x.png"), png.clone(), json)])
                .unwrap();
        let record = store.get(RecordId(0)).unwrap();
        assert_eq!(record.mask.dimensions(), (3, 2));
        assert_eq!(record.features.num_contours, 2);

        let bad_json = r#"{"histogram":[0],"num_contours":1,"total_area":1.0,"moments":{}}"#;
        assert!(matches!(
            MaskStore::from_persisted(vec![(ImageRef::from("x.png"), png, bad_json)]),
            Err(Error::InvalidInput(_))
        ));
    }
}
