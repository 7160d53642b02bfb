pub mod auth;
pub mod local;
pub mod watch;

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;

use vmux_sync::audio::{BellSink, CueSink, SilentSink};
use vmux_sync::auth::CredentialStore;
use vmux_sync::config::{FileConfig, NotificationConfig, PersistenceConfig, RelayConfig};
use vmux_sync::voice::LoggingVoiceRoom;
use vmux_sync::{
    ClientError, EngineConfig, EngineHandle, PersistenceStore, RelayApi, SyncEngine, VmuxConfig,
};

pub fn engine_config(file: &FileConfig) -> EngineConfig {
    EngineConfig {
        relay: RelayConfig::from_file(&file.relay),
        persistence: PersistenceConfig::from_file(&file.persistence),
        notifications: NotificationConfig::from_file(&file.notifications),
    }
}

pub fn relay_api(config: &VmuxConfig, relay: &RelayConfig) -> Result<RelayApi> {
    RelayApi::new(relay, CredentialStore::new(config.credentials_path()))
}

pub async fn start_engine(config: &VmuxConfig) -> Result<(EngineHandle, JoinHandle<()>)> {
    let engine_config = engine_config(&config.file_config()?);
    let api = relay_api(config, &engine_config.relay)?;
    let store = if engine_config.persistence.enabled {
        Some(PersistenceStore::open(config).await?)
    } else {
        None
    };
    let sink: Arc<dyn CueSink> = if engine_config.notifications.bell {
        Arc::new(BellSink)
    } else {
        Arc::new(SilentSink)
    };
    SyncEngine::start(
        engine_config,
        api,
        store,
        Box::new(LoggingVoiceRoom::new()),
        sink,
    )
    .await
}

/// Turn relay errors into something a person can act on.
pub fn explain(err: ClientError, relay: &str) -> anyhow::Error {
    match err {
        ClientError::Unavailable => anyhow::anyhow!("relay unreachable at {}", relay),
        ClientError::Unauthorized => {
            anyhow::anyhow!("not authorized by {} (pair with `vmux pair <CODE>`)", relay)
        }
        err if err.is_transient() => {
            anyhow::anyhow!("{} is having trouble ({}), try again shortly", relay, err)
        }
        other => other.into(),
    }
}
