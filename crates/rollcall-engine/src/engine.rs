use crate::config::Config;
use crate::enrollment::{CacheRefresh, CancelToken, EnrollmentError, EnrollmentReport, EnrollmentSession, SampleArchive};
use crate::guard::{AttendanceGuard, RecordOutcome};
use crate::recognition::{LoopSettings, RecognitionError, RecognitionEvent, RecognitionLoop};
use crate::SharedAnalyzer;
use chrono::{Local, NaiveDateTime, SubsecRound};
use rollcall_core::{
    AttendanceStatus, AttendanceStore, CacheSnapshot, EnrollmentStore, EuclideanMatcher,
    FeatureVector, FrameSource, KnownFaceCache, MatchResult, Matcher, StoreError,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Local wall-clock time at second precision, the resolution records are stored at.
pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(0)
}

/// Owns the face cache and the attendance guard.
///
/// Every enrollment write sends a [`CacheRefresh`]; a background task turns
/// those into full cache reloads, folding signals that are already queued
/// into a single reload.
pub struct Engine {
    config: Config,
    faces: Arc<dyn EnrollmentStore>,
    cache: Arc<KnownFaceCache>,
    guard: AttendanceGuard,
    matcher: EuclideanMatcher,
    refresh_tx: mpsc::UnboundedSender<CacheRefresh>,
    refresher: JoinHandle<()>,
}

impl Engine {
    /// Load the cache and start the refresher. Must be called inside a tokio runtime.
    ///
    /// Fails if the initial cache load cannot list the enrollment store.
    pub async fn start(
        config: Config,
        faces: Arc<dyn EnrollmentStore>,
        attendance: Arc<dyn AttendanceStore>,
    ) -> Result<Self, StoreError> {
        let cache = Arc::new(KnownFaceCache::new());
        cache.reload(faces.as_ref()).await?;

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let refresher = tokio::spawn(run_refresher(
            Arc::clone(&cache),
            Arc::clone(&faces),
            refresh_rx,
        ));

        tracing::info!(
            threshold = config.match_threshold,
            dedup_policy = ?config.dedup_policy,
            "engine started"
        );

        Ok(Self {
            guard: AttendanceGuard::new(attendance, config.dedup_policy),
            config,
            faces,
            cache,
            matcher: EuclideanMatcher,
            refresh_tx,
            refresher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> Arc<KnownFaceCache> {
        Arc::clone(&self.cache)
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.cache.current()
    }

    pub fn guard(&self) -> &AttendanceGuard {
        &self.guard
    }

    /// Reload the cache now instead of waiting for a refresh signal.
    pub async fn reload(&self) -> Result<Arc<CacheSnapshot>, StoreError> {
        self.cache.reload(self.faces.as_ref()).await
    }

    /// Match one probe against the current snapshot.
    pub fn identify(&self, probe: &FeatureVector) -> MatchResult {
        let snapshot = self.cache.current();
        self.matcher.compare(probe, &snapshot, self.config.match_threshold)
    }

    /// Start a recognition loop matching against this engine's cache.
    pub fn start_recognition(
        &self,
        source: Box<dyn FrameSource>,
        analyzer: SharedAnalyzer,
    ) -> Result<(RecognitionLoop, mpsc::Receiver<RecognitionEvent>), RecognitionError> {
        let (tx, rx) = mpsc::channel(self.config.event_buffer);
        let settings = LoopSettings {
            threshold: self.config.match_threshold,
            confirm_confidence: self.config.confirm_confidence,
        };
        let handle = RecognitionLoop::spawn(
            source,
            analyzer,
            Arc::clone(&self.cache),
            self.matcher,
            settings,
            tx,
        )?;
        Ok((handle, rx))
    }

    /// Run an enrollment session; `target` defaults to the configured sample count.
    pub async fn enroll(
        &self,
        identity_id: &str,
        target: Option<usize>,
        source: Box<dyn FrameSource>,
        analyzer: SharedAnalyzer,
        cancel: CancelToken,
    ) -> Result<EnrollmentReport, EnrollmentError> {
        let target = target.unwrap_or(self.config.enroll_target_samples);
        let mut session = EnrollmentSession::new(identity_id, target)
            .with_min_interval(self.config.enroll_min_interval());
        if let Some(dir) = &self.config.samples_dir {
            session = session.with_archive(SampleArchive::new(dir));
        }
        session
            .capture_samples(
                source,
                analyzer,
                Arc::clone(&self.faces),
                self.refresh_tx.clone(),
                cancel,
            )
            .await
    }

    /// Remove an identity's samples and reload the cache.
    pub async fn remove_identity(&self, identity_id: &str) -> Result<usize, StoreError> {
        let removed = self.faces.delete_identity(identity_id).await?;
        tracing::info!(identity = identity_id, removed, "identity removed");
        if removed > 0 {
            self.cache.reload(self.faces.as_ref()).await?;
        }
        Ok(removed)
    }

    /// Commit an attendance record stamped with the current local time.
    pub async fn confirm(
        &self,
        session_id: &str,
        identity_id: &str,
        status: AttendanceStatus,
    ) -> Result<RecordOutcome, StoreError> {
        self.confirm_at(session_id, identity_id, local_now(), status).await
    }

    pub async fn confirm_at(
        &self,
        session_id: &str,
        identity_id: &str,
        as_of: NaiveDateTime,
        status: AttendanceStatus,
    ) -> Result<RecordOutcome, StoreError> {
        self.guard.record(session_id, identity_id, as_of, status).await
    }

    pub async fn mark_absent(&self, session_id: &str, roster: &[String]) -> Result<usize, StoreError> {
        self.guard
            .mark_absent_for_unattended(session_id, roster, local_now())
            .await
    }

    /// Stop the refresher after it has applied every pending signal.
    pub async fn shutdown(self) {
        drop(self.refresh_tx);
        if let Err(e) = self.refresher.await {
            tracing::warn!(error = %e, "cache refresher task failed");
        }
        tracing::info!("engine stopped");
    }
}

async fn run_refresher(
    cache: Arc<KnownFaceCache>,
    store: Arc<dyn EnrollmentStore>,
    mut rx: mpsc::UnboundedReceiver<CacheRefresh>,
) {
    while let Some(first) = rx.recv().await {
        let mut coalesced = 1usize;
        while rx.try_recv().is_ok() {
            coalesced += 1;
        }
        // A failed reload is already logged by the cache; the next signal retries.
        if let Ok(snapshot) = cache.reload(store.as_ref()).await {
            tracing::debug!(
                identity = %first.identity_id,
                row_id = %first.row_id,
                coalesced,
                generation = snapshot.generation(),
                "cache refreshed after enrollment write"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{analyzer, encoding, face, frames, MemoryFaces, ScriptedSource};
    use rollcall_core::DedupPolicy;
    use rollcall_store::{SqliteStore, DEFAULT_STORE_TIMEOUT};
    use std::time::Duration;

    async fn engine(config: Config) -> (Engine, SqliteStore) {
        let store = SqliteStore::open_in_memory(DEFAULT_STORE_TIMEOUT).await.unwrap();
        let engine = Engine::start(config, Arc::new(store.clone()), Arc::new(store.clone()))
            .await
            .unwrap();
        (engine, store)
    }

    fn test_config() -> Config {
        Config {
            enroll_min_interval_ms: 0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_enrolled_samples_reach_cache() {
        let (engine, _store) = engine(test_config()).await;
        let probe = FeatureVector::from_slice(&encoding(0.25)).unwrap();
        assert!(!engine.identify(&probe).matched);

        let (source, _) = ScriptedSource::new(frames(3, Duration::from_millis(10)));
        let analyzer = analyzer(|_| Ok(vec![face(Some(encoding(0.25)))]));
        let report = engine
            .enroll("S001", Some(3), Box::new(source), analyzer, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.persisted(), 3);

        let cache = engine.cache();
        engine.shutdown().await;

        let snap = cache.current();
        assert_eq!(snap.identities().get("S001"), Some(&3));
        assert!(snap.generation() >= 2);
    }

    #[tokio::test]
    async fn test_identify_uses_configured_threshold() {
        let (engine, store) = engine(Config {
            match_threshold: 0.1,
            ..test_config()
        })
        .await;
        let stored = FeatureVector::from_slice(&encoding(0.0)).unwrap();
        store.insert("S001", "", &stored.to_bytes()).await.unwrap();
        engine.reload().await.unwrap();

        let exact = engine.identify(&stored);
        assert_eq!(exact.identity_id.as_deref(), Some("S001"));

        // Distance ~0.226: inside the default threshold but not this one.
        let near = FeatureVector::from_slice(&encoding(0.02)).unwrap();
        assert!(!engine.identify(&near).matched);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_confirm_respects_dedup_policy() {
        let (engine, store) = engine(Config {
            dedup_policy: DedupPolicy::Day,
            ..test_config()
        })
        .await;
        let morning = local_now();

        let first = engine
            .confirm_at("BH01", "S001", morning, AttendanceStatus::Present)
            .await
            .unwrap();
        assert!(matches!(first, RecordOutcome::Recorded(_)));

        let other_session = engine
            .confirm_at("BH02", "S001", morning, AttendanceStatus::Present)
            .await
            .unwrap();
        assert_eq!(other_session, RecordOutcome::AlreadyRecorded);
        assert!(store.records_for_session("BH02").await.unwrap().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_identity_drops_it_from_cache() {
        let (engine, store) = engine(test_config()).await;
        let bytes = FeatureVector::from_slice(&encoding(0.5)).unwrap().to_bytes();
        store.insert("S001", "", &bytes).await.unwrap();
        store.insert("S002", "", &bytes).await.unwrap();
        engine.reload().await.unwrap();
        assert_eq!(engine.snapshot().len(), 2);

        assert_eq!(engine.remove_identity("S001").await.unwrap(), 1);
        assert_eq!(engine.snapshot().identities().keys().copied().collect::<Vec<_>>(), vec!["S002"]);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_recognition_matches_against_engine_cache() {
        let faces = Arc::new(MemoryFaces::default());
        let bytes = FeatureVector::from_slice(&encoding(0.0)).unwrap().to_bytes();
        faces.insert("S001", "", &bytes).await.unwrap();
        let attendance = SqliteStore::open_in_memory(DEFAULT_STORE_TIMEOUT).await.unwrap();
        let engine = Engine::start(test_config(), faces, Arc::new(attendance)).await.unwrap();

        let (source, _) = ScriptedSource::new(frames(1, Duration::from_millis(10)));
        let analyzer = analyzer(|_| Ok(vec![face(Some(encoding(0.0)))]));
        let (handle, mut rx) = engine.start_recognition(Box::new(source), analyzer).unwrap();

        let event = rx.recv().await.unwrap();
        assert!(event.confirmable);
        let identity = event.result.identity_id.clone().unwrap();
        let outcome = engine
            .confirm("BH01", &identity, AttendanceStatus::Present)
            .await
            .unwrap();
        assert!(matches!(outcome, RecordOutcome::Recorded(_)));

        handle.wait().await.unwrap();
        engine.shutdown().await;
    }
}
