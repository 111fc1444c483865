//! Bootstrap with the native adapters from `bridge-desktop`.

use bridge_desktop::{HttpFetcher, PassthroughTranscoder, SqliteSnapshotStore};
use bridge_traits::{ChatNotifier, SourceResolver, StreamingSink, SystemClock};
use core_runtime::EngineConfig;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Result, ServiceError};
use crate::service::{CoreDependencies, CoreService};

/// Chat-specific pieces the host still has to provide.
pub struct DesktopHost {
    pub resolver: Arc<dyn SourceResolver>,
    pub sink: Arc<dyn StreamingSink>,
    pub notifier: Arc<dyn ChatNotifier>,
}

/// Start the service with the SQLite store at `database_path`, the HTTP
/// fetcher and the passthrough transcoder.
///
/// ```ignore
/// use core_service::{bootstrap_desktop, desktop::DesktopHost};
///
/// let config = EngineConfig::from_env()?;
/// let core = bootstrap_desktop(config, "data/voicecast.db".into(), DesktopHost {
///     resolver,
///     sink,
///     notifier,
/// })
/// .await?;
/// ```
pub async fn bootstrap_desktop(
    config: EngineConfig,
    database_path: PathBuf,
    host: DesktopHost,
) -> Result<CoreService> {
    let store = SqliteSnapshotStore::new(database_path)
        .await
        .map_err(|err| ServiceError::InitializationFailed(err.to_string()))?;

    let deps = CoreDependencies {
        resolver: host.resolver,
        fetcher: Arc::new(HttpFetcher::with_timeout(config.download_timeout)),
        transcoder: Arc::new(PassthroughTranscoder),
        sink: host.sink,
        notifier: host.notifier,
        store: Arc::new(store),
        clock: Arc::new(SystemClock),
    };
    CoreService::start(config, deps).await
}
