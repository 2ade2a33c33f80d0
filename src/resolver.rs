use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geocode::{GeocodeClient, GeocodeOutcome};
use crate::query::{build_queries, QueryTarget};
use crate::record::{Coordinate, Record, ResolutionStatus, Tier};
use crate::store::RecordStore;

#[derive(Debug, Clone)]
pub struct ResolutionProgress {
    pub total: usize,
    pub processed: usize,
    pub resolved: usize,
    pub index: usize,
    pub label: String,
    pub status: ResolutionStatus,
}

pub type ProgressObserver = Arc<dyn Fn(ResolutionProgress) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub newly_resolved: usize,
    pub errored: usize,
    pub provider_calls: u64,
    pub checkpoints: usize,
    pub cancelled: bool,
    pub dispersed: usize,
    pub resolved: usize,
    pub failed: usize,
    pub unresolved: usize,
}

impl RunSummary {
    fn started(total: usize) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            total,
            processed: 0,
            skipped: 0,
            newly_resolved: 0,
            errored: 0,
            provider_calls: 0,
            checkpoints: 0,
            cancelled: false,
            dispersed: 0,
            resolved: 0,
            failed: 0,
            unresolved: 0,
        }
    }

    /// Refreshes the final status counts from the store.
    pub fn finish(&mut self, store: &RecordStore) {
        let summary = store.summary();
        self.resolved = summary.resolved;
        self.failed = summary.failed;
        self.unresolved = summary.unresolved;
        self.finished_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RecordOutcome {
    Resolved(Coordinate, Tier),
    Failed,
    NoTiers,
}

/// Drives every unresolved record through its tiers, one network call at a
/// time, checkpointing the store every `checkpoint_interval` records.
pub struct Resolver {
    client: GeocodeClient,
    checkpoint_interval: usize,
}

impl Resolver {
    pub fn new(client: GeocodeClient, config: &AppConfig) -> Self {
        Self {
            client,
            checkpoint_interval: config.checkpoint_interval.max(1),
        }
    }

    pub async fn run(
        &self,
        store: &mut RecordStore,
        observer: Option<ProgressObserver>,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<RunSummary> {
        let total = store.len();
        let calls_before = self.client.calls_made();
        let mut summary = RunSummary::started(total);
        let mut since_checkpoint = 0;

        for index in 0..total {
            if let Some(flag) = &cancel_flag {
                if flag.load(Ordering::SeqCst) {
                    info!(processed = summary.processed, "resolution cancelled");
                    summary.cancelled = true;
                    break;
                }
            }

            let outcome = {
                let Some(record) = store.record(index) else {
                    break;
                };
                if record.is_resolved() {
                    summary.skipped += 1;
                    continue;
                }
                self.resolve_record(record).await
            };

            let Some(record) = store.record_mut(index) else {
                break;
            };
            match outcome {
                Ok(RecordOutcome::Resolved(coordinate, tier)) => {
                    record.mark_resolved(coordinate, tier);
                    summary.newly_resolved += 1;
                    info!(
                        row = index + 1,
                        record = %record.label(),
                        tier = tier.as_tag(),
                        %coordinate,
                        "record resolved"
                    );
                }
                Ok(RecordOutcome::Failed) => {
                    record.mark_failed();
                    info!(row = index + 1, record = %record.label(), "no tier matched");
                }
                Ok(RecordOutcome::NoTiers) => {
                    debug!(row = index + 1, record = %record.label(), "no region; left unresolved");
                }
                Err(err) => {
                    summary.errored += 1;
                    warn!(?err, row = index + 1, record = %record.label(), "failed to resolve record");
                }
            }

            summary.processed += 1;
            if let Some(callback) = &observer {
                callback(ResolutionProgress {
                    total,
                    processed: summary.processed,
                    resolved: summary.newly_resolved,
                    index,
                    label: record.label(),
                    status: record.status,
                });
            }

            since_checkpoint += 1;
            if since_checkpoint >= self.checkpoint_interval {
                store.persist()?;
                summary.checkpoints += 1;
                since_checkpoint = 0;
                debug!(processed = summary.processed, "checkpoint written");
            }
        }

        store.persist()?;
        summary.checkpoints += 1;
        summary.provider_calls = self.client.calls_made() - calls_before;
        summary.finish(store);
        Ok(summary)
    }

    async fn resolve_record(&self, record: &Record) -> AppResult<RecordOutcome> {
        let queries = build_queries(record);
        if queries.is_empty() {
            return Ok(RecordOutcome::NoTiers);
        }

        for candidate in queries {
            let text = match candidate.target {
                QueryTarget::Centroid(coordinate) => {
                    debug!(row = record.index + 1, "falling back to region centroid");
                    return Ok(RecordOutcome::Resolved(coordinate, candidate.tier));
                }
                QueryTarget::Search(text) => text,
            };

            info!(
                row = record.index + 1,
                tier = candidate.tier.as_tag(),
                query = %text,
                "searching"
            );
            match self.client.resolve(&text).await? {
                GeocodeOutcome::Match(coordinate) => {
                    return Ok(RecordOutcome::Resolved(coordinate, candidate.tier));
                }
                GeocodeOutcome::NoMatch => {
                    debug!(tier = candidate.tier.as_tag(), query = %text, "no match");
                }
                GeocodeOutcome::Exhausted { attempts } => {
                    debug!(tier = candidate.tier.as_tag(), attempts, "tier abandoned after retries");
                }
            }
        }
        Ok(RecordOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;
    use crate::centroids::centroid_for;
    use crate::errors::ProviderError;
    use crate::geocode::test_support::{fast_config, ScriptedProvider};
    use crate::record::SENTINEL_TEXT;

    const AUSTIN: Coordinate = Coordinate::new(30.2672, -97.7431);

    fn write_csv(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("pilots.csv");
        fs::write(&path, body).unwrap();
        path
    }

    fn resolver(provider: Arc<ScriptedProvider>, config: &AppConfig) -> Resolver {
        Resolver::new(GeocodeClient::with_provider(provider, config), config)
    }

    #[tokio::test(start_paused = true)]
    async fn most_precise_tier_wins() {
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), "Name,City,State\nJane,Austin,TX\n");
        let provider = Arc::new(ScriptedProvider::new().with_match("Austin, TX, USA", AUSTIN));
        let mut store = RecordStore::load(&path).unwrap();

        let summary = resolver(provider.clone(), &fast_config())
            .run(&mut store, None, None)
            .await
            .unwrap();

        let record = store.record(0).unwrap();
        assert_eq!(record.status, ResolutionStatus::Resolved);
        assert_eq!(record.tier, Some(Tier::City));
        assert_eq!(record.coordinate, Some(AUSTIN));
        assert_eq!(provider.queries(), vec!["Austin, TX, USA"]);
        assert_eq!(summary.newly_resolved, 1);
        assert_eq!(summary.provider_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_state_centroid() {
        let dir = tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "Name,Business,City,State\nJane Pilot,Eagle Eye Drones,,TX\n",
        );
        let provider = Arc::new(ScriptedProvider::new());
        let mut store = RecordStore::load(&path).unwrap();

        resolver(provider.clone(), &fast_config())
            .run(&mut store, None, None)
            .await
            .unwrap();

        let record = store.record(0).unwrap();
        assert_eq!(record.status, ResolutionStatus::Resolved);
        assert_eq!(record.tier, Some(Tier::State));
        assert_eq!(record.coordinate, centroid_for("TX"));
        assert_eq!(
            provider.queries(),
            vec!["Eagle Eye Drones, TX, USA", "Jane Pilot, TX, USA"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_region_makes_no_calls() {
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), "Name,City,State\nJane,Austin,\n");
        let provider = Arc::new(ScriptedProvider::new().with_match("Austin, , USA", AUSTIN));
        let mut store = RecordStore::load(&path).unwrap();

        let summary = resolver(provider.clone(), &fast_config())
            .run(&mut store, None, None)
            .await
            .unwrap();

        assert_eq!(store.record(0).unwrap().status, ResolutionStatus::Unresolved);
        assert_eq!(provider.call_count(), 0);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_tier_still_resolves() {
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), "Name,City,State\nJane,Austin,TX\n");
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_match("Austin, TX, USA", AUSTIN)
                .with_failures(vec![ProviderError::Timeout, ProviderError::Timeout]),
        );
        let mut store = RecordStore::load(&path).unwrap();

        resolver(provider.clone(), &fast_config())
            .run(&mut store, None, None)
            .await
            .unwrap();

        let record = store.record(0).unwrap();
        assert_eq!(record.status, ResolutionStatus::Resolved);
        assert_eq!(record.coordinate, Some(AUSTIN));
        assert_eq!(record.tier, Some(Tier::City));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_tiers_mark_record_failed() {
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), "Name,City,State\nJane,Toronto,ON\n");
        let provider = Arc::new(ScriptedProvider::new());
        let mut store = RecordStore::load(&path).unwrap();

        let summary = resolver(provider.clone(), &fast_config())
            .run(&mut store, None, None)
            .await
            .unwrap();

        let record = store.record(0).unwrap();
        assert_eq!(record.status, ResolutionStatus::Failed);
        assert_eq!(record.coordinate_text(), SENTINEL_TEXT);
        assert_eq!(provider.call_count(), 2);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_error_is_isolated_to_its_record() {
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), "Name,City,State\nBroken,Dallas,TX\nJane,Austin,TX\n");
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_match("Austin, TX, USA", AUSTIN)
                .with_failures(vec![ProviderError::Unexpected("malformed".into())]),
        );
        let mut store = RecordStore::load(&path).unwrap();

        let summary = resolver(provider, &fast_config())
            .run(&mut store, None, None)
            .await
            .unwrap();

        assert_eq!(summary.errored, 1);
        assert_eq!(store.record(0).unwrap().status, ResolutionStatus::Unresolved);
        assert!(store.record(1).unwrap().is_resolved());
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_issues_no_queries_for_resolved_records() {
        let dir = tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "Name,City,State\nJane,Austin,TX\nBob,,\nAmy,Toronto,ON\n",
        );
        let first_provider = Arc::new(ScriptedProvider::new().with_match("Austin, TX, USA", AUSTIN));
        let mut store = RecordStore::load(&path).unwrap();
        resolver(first_provider, &fast_config())
            .run(&mut store, None, None)
            .await
            .unwrap();
        let after_first = fs::read_to_string(&path).unwrap();

        let second_provider = Arc::new(ScriptedProvider::new());
        let mut reloaded = RecordStore::load(&path).unwrap();
        let summary = resolver(second_provider.clone(), &fast_config())
            .run(&mut reloaded, None, None)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert!(!second_provider.queries().iter().any(|q| q.starts_with("Austin")));
        assert_eq!(reloaded.record(0), store.record(0));
        assert_eq!(fs::read_to_string(&path).unwrap(), after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoints_survive_a_killed_run() {
        let dir = tempdir().unwrap();
        let mut body = String::from("Name,City,State\n");
        for i in 0..23 {
            body.push_str(&format!("Pilot {i},Town{i},TX\n"));
        }
        let path = write_csv(dir.path(), &body);

        let mut provider = ScriptedProvider::new().stall_after(12);
        for i in 0..23 {
            provider = provider.with_match(&format!("Town{i}, TX, USA"), Coordinate::new(30.0 + i as f64 * 0.01, -97.0));
        }
        let provider = Arc::new(provider);
        let config = AppConfig {
            checkpoint_interval: 10,
            ..fast_config()
        };
        let resolver = resolver(provider.clone(), &config);
        let mut store = RecordStore::load(&path).unwrap();

        let killed = tokio::time::timeout(
            Duration::from_secs(5),
            resolver.run(&mut store, None, None),
        )
        .await;
        assert!(killed.is_err());
        assert_eq!(provider.call_count(), 13);

        let persisted = RecordStore::load(&path).unwrap();
        assert!(persisted.records()[..10].iter().all(Record::is_resolved));
        assert_eq!(persisted.summary().resolved, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_between_records_and_persists() {
        let dir = tempdir().unwrap();
        let mut body = String::from("Name,City,State\n");
        for i in 0..8 {
            body.push_str(&format!("Pilot {i},Austin,TX\n"));
        }
        let path = write_csv(dir.path(), &body);
        let provider = Arc::new(ScriptedProvider::new().with_match("Austin, TX, USA", AUSTIN));
        let cancel = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let observer: ProgressObserver = {
            let cancel = cancel.clone();
            let seen = seen.clone();
            Arc::new(move |progress: ResolutionProgress| {
                seen.lock().push(progress.processed);
                if progress.processed == 3 {
                    cancel.store(true, Ordering::SeqCst);
                }
            })
        };

        let mut store = RecordStore::load(&path).unwrap();
        let summary = resolver(provider, &fast_config())
            .run(&mut store, Some(observer), Some(cancel))
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.processed, 3);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        let persisted = RecordStore::load(&path).unwrap();
        assert_eq!(persisted.summary().resolved, 3);
    }
}
