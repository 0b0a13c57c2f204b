use crate::{
    assembler::ChunkAssembler,
    config::{Config, Validatable},
    inference::InferenceEngine,
    labels::load_class_labels,
    model_loader::ModelLoader,
    model_service::ModelDecoder,
    ort_service::OnnxDecoder,
    preprocessing::ImagePreprocessor,
    server::{router, HttpServer},
    state::AppState,
    telemetry::Metrics,
};
use anyhow::Context;
use std::sync::Arc;
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let labels = load_class_labels(&config.labels.get_path())
        .with_context(|| format!("failed to load labels from {:?}", config.labels.get_path()))?;
    let formats = config.image.formats().map_err(anyhow::Error::msg)?;

    let preprocessor = ImagePreprocessor::new(
        config.model.input_size,
        config.model.layout,
        config.model.filter.into(),
        formats,
    );
    let loader = ModelLoader::new(
        OnnxDecoder::new(config.model.num_instances),
        ChunkAssembler::new(&config.artifact),
        config.model.load_timeout(),
    );
    let metrics = Arc::new(Metrics::new()?);
    let state = AppState::new(
        loader,
        preprocessor,
        InferenceEngine::new(config.model.apply_softmax),
        labels,
        metrics,
    );

    if config.model.preload {
        tokio::spawn(preload(state.clone()));
    }

    let server = HttpServer::new(
        router(state, config.server.max_upload_bytes),
        &config.server,
    )
    .await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn preload<D: ModelDecoder>(state: AppState<D>) {
    match state.model().await {
        Ok(_) => tracing::info!("Model preloaded"),
        Err(e) => tracing::error!(
            code = e.code().as_str(),
            "Model preload failed, will retry on first request: {}",
            e
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
