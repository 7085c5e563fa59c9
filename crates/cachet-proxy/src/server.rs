//! Proxy server wiring.
//!
//! Owns the listeners and fans every client connection out to its own
//! task. The proxy endpoint accepts absolute-form requests (explicit
//! proxying), origin-form requests with a `Host` header (transparent
//! HTTP) and CONNECT; the optional transparent TLS endpoint is spawned
//! alongside when configured.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use cachet_cache::{DiskStore, HttpCache};
use cachet_core::Config;

use crate::ca::CaManager;
use crate::cert_store::TlsInterceptor;
use crate::engine::{Engine, Source};
use crate::error::Result;
use crate::{transparent, tunnel};

/// The caching proxy server.
pub struct ProxyServer {
    config: Config,
    engine: Arc<Engine>,
    tls: Option<Arc<TlsInterceptor>>,
}

impl ProxyServer {
    /// Builds the server from a validated configuration: initializes the
    /// cache directory, the engine and - when interception is enabled -
    /// the CA.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let ttl = config.cache.parse_ttl()?;
        let store = DiskStore::new(config.cache.folder.clone(), ttl);
        store.init()?;
        let engine = Arc::new(Engine::new(HttpCache::new(store), config.rules.clone())?);

        let tls = if config.server.https.enabled {
            let https = &config.server.https;
            let ca = if https.ca_cert_file.is_empty() {
                CaManager::with_default_dir()?
            } else {
                CaManager::from_files(
                    Path::new(&https.ca_cert_file),
                    Path::new(&https.ca_key_file),
                )?
            };
            Some(Arc::new(TlsInterceptor::new(ca)))
        } else {
            None
        };

        Ok(Self {
            config,
            engine,
            tls,
        })
    }

    /// Returns the engine, mainly for tests.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Returns the CA certificate PEM when interception is enabled, for
    /// installing into client trust stores.
    pub fn ca_cert_pem(&self) -> Option<&str> {
        self.tls.as_deref().map(TlsInterceptor::ca_cert_pem)
    }

    /// Runs the proxy until a listener fails fatally.
    pub async fn run(self) -> Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Starts the proxy in the background and returns a control handle.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listeners = self.bind().await?;
        let addr = listeners.http.local_addr()?;
        let transparent_addr = match &listeners.transparent {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(async move {
            tokio::select! {
                result = self.serve(listeners) => {
                    if let Err(e) = result {
                        tracing::error!("proxy server error: {e}");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("proxy shutdown signal received");
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            transparent_addr,
            handle,
        })
    }

    /// Binds the proxy endpoint and, when configured, the transparent
    /// TLS endpoint. Bind failures are fatal.
    async fn bind(&self) -> Result<Listeners> {
        let http = TcpListener::bind(&self.config.server.http.address).await?;

        let transparent_address = &self.config.server.https.transparent.address;
        let transparent = if self.tls.is_some() && !transparent_address.is_empty() {
            Some(TcpListener::bind(transparent_address).await?)
        } else {
            None
        };

        Ok(Listeners { http, transparent })
    }

    async fn serve(self, listeners: Listeners) -> Result<()> {
        let addr = listeners.http.local_addr()?;
        tracing::info!("starting caching proxy at {addr}");
        tracing::debug!("cache directory: {}", self.config.cache.folder.display());
        tracing::debug!("cache TTL: {}", self.config.cache.ttl);
        tracing::debug!("rules mode: {}", self.config.rules.mode);

        match &self.tls {
            Some(tls) => {
                tracing::debug!("TLS interception: enabled");
                if let Some(listener) = listeners.transparent {
                    let engine = self.engine.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transparent::run(listener, engine, tls).await {
                            tracing::error!("transparent HTTPS listener failed: {e}");
                        }
                    });
                }
            }
            None => tracing::debug!("TLS interception: disabled"),
        }

        loop {
            let (stream, _peer) = match listeners.http.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("error accepting connection: {e}");
                    continue;
                }
            };
            tokio::spawn(handle_connection(
                stream,
                self.engine.clone(),
                self.tls.clone(),
            ));
        }
    }
}

/// The sockets the proxy serves on.
struct Listeners {
    http: TcpListener,
    transparent: Option<TcpListener>,
}

/// Serves one client connection, CONNECT upgrades included.
async fn handle_connection(
    stream: TcpStream,
    engine: Arc<Engine>,
    tls: Option<Arc<TlsInterceptor>>,
) {
    let service = service_fn(move |req| {
        let engine = engine.clone();
        let tls = tls.clone();
        async move { Ok::<_, Infallible>(route(req, engine, tls).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        tracing::debug!("client connection ended: {e}");
    }
}

/// Dispatches one request: CONNECT to the tunnel handler, everything
/// else into the engine with its source tag.
async fn route(
    req: Request<Incoming>,
    engine: Arc<Engine>,
    tls: Option<Arc<TlsInterceptor>>,
) -> Response<Full<Bytes>> {
    if req.method() == Method::CONNECT {
        return tunnel::handle_connect(req, engine, tls).await;
    }

    let source = if req.uri().scheme().is_some() {
        Source::HttpExplicit
    } else {
        Source::HttpTransparent
    };
    engine.handle(req, source, None).await
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    transparent_addr: Option<SocketAddr>,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy endpoint is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the transparent TLS endpoint's address when enabled.
    pub fn transparent_addr(&self) -> Option<SocketAddr> {
        self.transparent_addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
