use crate::{
    config::ServerConfig, model_service::ModelDecoder, routes::api_routes, state::AppState,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

pub fn router<D: ModelDecoder>(state: AppState<D>, max_upload_bytes: usize) -> Router {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();

    api_routes()
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(metrics_layer)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(router: Router, config: &ServerConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
