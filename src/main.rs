//! Mutating admission webhook that injects a virtiofs sidecar into KubeVirt
//! pods whose ServiceAccount carries an IRSA role annotation.

use std::{convert::Infallible, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use kube::core::{
    admission::{AdmissionRequest, AdmissionReview},
    DynamicObject,
};
use tracing::{info, Level};
use warp::{
    http::StatusCode,
    reply::{self, Reply},
    Filter,
};

mod config;
mod mutate;
mod patch;
mod resolve;

use config::Config;
use resolve::{ClusterServiceAccounts, ServiceAccounts};

#[derive(Parser, Debug, Clone)]
#[command(name = "irsa-mutation-webhook")]
#[command(version, about, long_about = None)]
struct Args {
    /// Webhook server port.
    #[arg(short, long, default_value = "8443")]
    port: u16,
    /// Path to the TLS certificate.
    #[arg(long, default_value = "/etc/webhook/certs/tls.crt")]
    tls_cert: PathBuf,
    /// Path to the TLS key.
    #[arg(long, default_value = "/etc/webhook/certs/tls.key")]
    tls_key: PathBuf,
}

/// HTTP surface for a single admission review. Envelope problems are reported
/// with HTTP status codes; everything past the envelope is answered 200 with
/// an allow/deny admission response from the engine.
async fn handle_mutate<S: ServiceAccounts>(
    content_type: Option<String>,
    body: &[u8],
    accounts: &S,
    config: &Config,
) -> reply::Response {
    if content_type.as_deref() != Some("application/json") {
        return reply::with_status(
            "invalid Content-Type, want `application/json`",
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
        )
        .into_response();
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(body) {
        Ok(review) => review,
        Err(err) => {
            tracing::warn!("Could not decode admission review body: {}", err);
            return reply::with_status(
                format!("could not decode body: {err}"),
                StatusCode::BAD_REQUEST,
            )
            .into_response();
        }
    };

    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            return reply::with_status(
                format!("invalid admission review: {err}"),
                StatusCode::BAD_REQUEST,
            )
            .into_response();
        }
    };

    // The API server correlates responses by UID; a request without one is
    // unanswerable.
    if request.uid.is_empty() {
        return reply::with_status(
            "admission review request UID is required",
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }

    let response = mutate::mutate(&request, accounts, config).await;
    reply::json(&response.into_review()).into_response()
}

fn mutate_route<S>(
    accounts: S,
    config: Arc<Config>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone
where
    S: ServiceAccounts + Clone + Send + Sync + 'static,
{
    warp::path("mutate")
        .and(warp::post())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::body::bytes())
        .and_then(move |content_type: Option<String>, body: bytes::Bytes| {
            let accounts = accounts.clone();
            let config = config.clone();
            async move {
                Ok::<_, Infallible>(handle_mutate(content_type, &body, &accounts, &config).await)
            }
        })
        .with(warp::trace::request())
}

async fn shutdown_signal() {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate.recv() => {},
    }
    info!("Termination signal received, shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::try_parse()?;

    let config = Arc::new(Config::load().context("failed to load configuration")?);
    info!("Loaded configuration: {:?}", config);

    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let accounts = ClusterServiceAccounts::new(client);

    info!("Starting webhook server on port {}", args.port);
    let (_addr, server) = warp::serve(mutate_route(accounts, config))
        .tls()
        .cert_path(&args.tls_cert)
        .key_path(&args.tls_key)
        .bind_with_graceful_shutdown(([0, 0, 0, 0], args.port), shutdown_signal());
    server.await;

    info!("Webhook server stopped");
    Ok(())
}
