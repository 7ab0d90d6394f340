use std::process::ExitCode;

use log::{error, info};
use tokio::sync::mpsc;

use kifu_studio::analysis::AnalysisCoordinator;
use kifu_studio::codec::CodecRegistry;
use kifu_studio::config::Config;
use kifu_studio::engine::StatusCell;
use kifu_studio::server::{self, hub::Hub, AppContext};
use kifu_studio::store::Store;
use kifu_studio::sync::Synchronizer;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let store = match Store::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("could not open database {:?}: {e}", config.db_path);
            return ExitCode::from(1);
        }
    };

    // Effective engine settings: persisted ones win over config defaults.
    let engine_settings = match store.get_app_state() {
        Ok(Some(app)) => app.engine,
        Ok(None) => config.engine.clone(),
        Err(e) => {
            error!("could not read app state: {e}");
            return ExitCode::from(1);
        }
    };

    let hub = Hub::new();
    let engine_status = StatusCell::new();
    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();

    let (coordinator, analysis) = AnalysisCoordinator::new(
        hub.clone(),
        snapshot_tx,
        engine_status.clone(),
        config.engine_map(),
        engine_settings.clone(),
    );
    tokio::spawn(coordinator.run());

    let synchronizer = match Synchronizer::bootstrap(
        store,
        intent_rx,
        snapshot_rx,
        hub.clone(),
        analysis,
        CodecRegistry::with_builtin(),
        engine_status.clone(),
        engine_settings,
    ) {
        Ok(synchronizer) => synchronizer,
        Err(e) => {
            error!("could not restore state: {e}");
            return ExitCode::from(1);
        }
    };
    tokio::spawn(synchronizer.run());

    let listener = match std::net::TcpListener::bind(&config.listen_addr) {
        Ok(listener) => listener,
        Err(e) => {
            error!("could not bind {}: {e}", config.listen_addr);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = listener.set_nonblocking(true) {
        error!("could not configure listener: {e}");
        return ExitCode::from(1);
    }
    info!("listening on {}", config.listen_addr);

    let app = server::router(AppContext {
        hub,
        intents: intent_tx,
        engine_status,
    });
    let serve = match axum::Server::from_tcp(listener) {
        Ok(builder) => builder.serve(app.into_make_service()),
        Err(e) => {
            error!("could not start server: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = serve.await {
        error!("server error: {e}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}
