//! HTTP exposition: the metrics endpoint and the landing page.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use clap::crate_version;
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    api::powerwall::Client,
    collector::Collector,
    config::Config,
    metrics::NAMESPACE,
    prelude::*,
};

const PROJECT_URL: &str = "https://github.com/eigenein/powerwall-exporter";

struct App {
    collector: Collector<Client>,
    metrics_path: String,
}

/// Serve the landing page and the metrics endpoint until SIGINT/SIGTERM.
pub async fn run(config: &Config, client: Client) -> Result {
    let listener = TcpListener::bind(&config.web.listen_address)
        .await
        .with_context(|| format!("failed to bind to `{}`", config.web.listen_address))?;
    let app = Arc::new(App {
        collector: Collector::new(client),
        metrics_path: config.web.metrics_path.clone(),
    });
    let router = Router::new()
        .route("/", get(get_index))
        .route(&config.web.metrics_path, get(get_metrics))
        .with_state(app)
        .layer((TraceLayer::new_for_http(), TimeoutLayer::new(Duration::from_secs(30))));

    info!(
        config.web.listen_address,
        config.web.metrics_path,
        "listening for HTTP connections…",
    );
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

/// Per <https://github.com/tokio-rs/axum/blob/main/examples/graceful-shutdown/src/main.rs>.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// One scrape: run the collection pass and encode whatever it produced.
///
/// Device failures never fail the scrape; a partial or empty sample set is
/// still a valid response.
async fn get_metrics(State(app): State<Arc<App>>) -> Response {
    let scrape = match app.collector.collect().await {
        Ok(scrape) => scrape,
        Err(error) => {
            error!("failed to set up the scrape: {error:#}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match scrape.render() {
        Ok(body) => {
            ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response()
        }
        Err(error) => {
            error!("failed to encode the samples: {error:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_index(State(app): State<Arc<App>>) -> Html<String> {
    Html(format!(
        r#"<!doctype html>
<html>
<head>
    <meta charset="UTF-8">
    <title>{NAMESPACE} exporter</title>
</head>
<body>
    <h1>{NAMESPACE} exporter for Prometheus (Version {version})</h1>
    <p>Exported metrics are available at <a href="{metrics_path}">{metrics_path}</a></p>
    <h2>More information:</h2>
    <p><a href="{PROJECT_URL}">{PROJECT_URL}</a></p>
</body>
</html>
"#,
        version = crate_version!(),
        metrics_path = app.metrics_path,
    ))
}
