//! Admin HTTP surface: JSON endpoints that read store snapshots and
//! mutate the policy list. Bound on loopback; the proxy data path never
//! goes through here.

pub mod handlers;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Server};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::LinkmuxResult;
use crate::store::SourceStore;

/// Process-wide build information, read-only after startup and passed by
/// value into the server.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: String,
    pub commit: String,
    pub build_time: String,
    pub proxy_port: u16,
}

pub struct ApiServer {
    port: u16,
    store: Arc<SourceStore>,
    info: BuildInfo,
}

impl ApiServer {
    pub fn new(port: u16, store: Arc<SourceStore>, info: BuildInfo) -> Self {
        Self { port, store, info }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> LinkmuxResult<()> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let store = self.store.clone();
        let info = self.info.clone();

        let make_svc = make_service_fn(move |_conn| {
            let store = store.clone();
            let info = info.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let store = store.clone();
                    let info = info.clone();
                    async move { Ok::<_, Infallible>(handlers::route(req, store, info).await) }
                }))
            }
        });

        info!("API server listening on {}", addr);
        let server = Server::bind(&addr)
            .serve(make_svc)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                debug!("API server shutting down");
            });

        server.await.map_err(Into::into)
    }
}
