//! In-memory cache of enrolled vectors, rebuilt wholesale from the store.
//!
//! Readers get an `Arc<CacheSnapshot>` that never changes underneath them.
//! A reload builds a complete replacement and publishes it with a single
//! atomic swap; a failed reload leaves the previous snapshot in place.

use crate::store::{EnrollmentStore, StoreError};
use crate::vector::FeatureVector;
use arc_swap::ArcSwap;
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Immutable point-in-time view of the enrolled faces.
///
/// `vectors[i]` belongs to `labels[i]`.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    vectors: Vec<FeatureVector>,
    labels: Vec<String>,
    generation: u64,
    skipped: usize,
    loaded_at: Option<DateTime<Local>>,
}

impl CacheSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot directly from `(identity_id, vector)` pairs.
    pub fn from_entries(entries: Vec<(String, FeatureVector)>) -> Self {
        let (labels, vectors) = entries.into_iter().unzip();
        Self {
            vectors,
            labels,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeatureVector)> {
        self.labels.iter().map(String::as_str).zip(self.vectors.iter())
    }

    /// Identity label of the vector at `idx`.
    ///
    /// # Panics
    /// If `idx >= self.len()`.
    pub fn label(&self, idx: usize) -> &str {
        &self.labels[idx]
    }

    /// Sample count per identity.
    pub fn identities(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for label in &self.labels {
            *counts.entry(label.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Reload counter; 0 for the initial empty snapshot.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Rows dropped as corrupt during the reload that built this snapshot.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn loaded_at(&self) -> Option<DateTime<Local>> {
        self.loaded_at
    }

    /// Same vectors under the same labels in the same order.
    pub fn same_content(&self, other: &CacheSnapshot) -> bool {
        self.labels == other.labels && self.vectors == other.vectors
    }
}

/// Owner of the current snapshot.
pub struct KnownFaceCache {
    current: ArcSwap<CacheSnapshot>,
    /// Serializes reloads and holds the last published generation.
    reload_lock: Mutex<u64>,
}

impl KnownFaceCache {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(CacheSnapshot::empty()),
            reload_lock: Mutex::new(0),
        }
    }

    /// The latest published snapshot.
    pub fn current(&self) -> Arc<CacheSnapshot> {
        self.current.load_full()
    }

    /// Rebuild the snapshot from every row in `store` and publish it.
    ///
    /// Rows whose vector does not decode are skipped with a warning. If the
    /// store cannot be listed the error is returned and the previous
    /// snapshot stays current.
    pub async fn reload<S>(&self, store: &S) -> Result<Arc<CacheSnapshot>, StoreError>
    where
        S: EnrollmentStore + ?Sized,
    {
        let mut generation = self.reload_lock.lock().await;

        let rows = match store.list_all().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retained_generation = *generation,
                    "face cache reload failed; keeping previous snapshot"
                );
                return Err(e);
            }
        };

        let total = rows.len();
        let mut entries = Vec::with_capacity(total);
        let mut skipped = 0usize;
        for row in rows {
            match FeatureVector::from_bytes(&row.vector_bytes) {
                Ok(vector) => entries.push((row.identity_id, vector)),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(
                        row_id = %row.id,
                        identity = %row.identity_id,
                        error = %e,
                        "skipping corrupt vector record"
                    );
                }
            }
        }

        *generation += 1;
        let mut snapshot = CacheSnapshot::from_entries(entries);
        snapshot.generation = *generation;
        snapshot.skipped = skipped;
        snapshot.loaded_at = Some(Local::now());

        let snapshot = Arc::new(snapshot);
        self.current.store(Arc::clone(&snapshot));

        tracing::info!(
            generation = snapshot.generation,
            vectors = snapshot.len(),
            identities = snapshot.identities().len(),
            skipped,
            total,
            "face cache reloaded"
        );

        Ok(snapshot)
    }
}

impl Default for KnownFaceCache {
    fn default() -> Self {
        Self::new()
    }
}
