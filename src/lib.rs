mod centroids;
mod config;
mod dispersal;
mod errors;
mod geocode;
mod query;
mod record;
mod resolver;
mod store;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use centroids::centroid_for;
pub use config::{AppConfig, PublicAppConfig};
pub use dispersal::{destination, haversine_km, Disperser};
pub use errors::{AppError, AppResult, ProviderError};
pub use geocode::{GeocodeClient, GeocodeOutcome, GeocodeProvider, NominatimProvider};
pub use query::{build_queries, CandidateQuery, QueryTarget};
pub use record::{Coordinate, Record, ResolutionStatus, Tier, SENTINEL_TEXT};
pub use resolver::{ProgressObserver, ResolutionProgress, Resolver, RunSummary};
pub use store::{discover_input, RecordStore, StoreSummary};

/// Resolves every pending record, then (when a disperser is given) spreads
/// the state-tier results and writes the final state.
pub async fn run_enrichment(
    store: &mut RecordStore,
    resolver: &Resolver,
    disperser: Option<&mut Disperser>,
    observer: Option<ProgressObserver>,
    cancel_flag: Option<Arc<AtomicBool>>,
) -> AppResult<RunSummary> {
    let mut summary = resolver.run(store, observer, cancel_flag).await?;

    if let Some(disperser) = disperser {
        if summary.cancelled {
            info!("skipping dispersal for a cancelled run");
        } else {
            summary.dispersed = disperser.apply(store.records_mut());
            if summary.dispersed > 0 {
                store.persist()?;
                summary.checkpoints += 1;
            }
        }
    }

    summary.finish(store);
    info!(
        resolved = summary.resolved,
        failed = summary.failed,
        unresolved = summary.unresolved,
        errored = summary.errored,
        dispersed = summary.dispersed,
        provider_calls = summary.provider_calls,
        "enrichment run complete"
    );
    Ok(summary)
}

/// Standalone dispersal over an existing store; persists when anything moved.
pub fn disperse_store(store: &mut RecordStore, disperser: &mut Disperser) -> AppResult<usize> {
    let moved = disperser.apply(store.records_mut());
    if moved > 0 {
        store.persist()?;
    }
    Ok(moved)
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,location_enricher=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
