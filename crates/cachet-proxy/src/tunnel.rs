//! CONNECT handling.
//!
//! Every tunnel starts in the same place - a CONNECT request naming an
//! authority - and ends in one of two ways. With interception disabled
//! the proxy opens a TCP connection to the authority, answers
//! `200 Connection Established` and splices bytes blindly in both
//! directions. With interception enabled it answers 200, presents a leaf
//! certificate minted for the authority's host, and serves the decrypted
//! requests through the regular caching pipeline.
//!
//! Handshake failures and malformed inner requests are logged and the
//! connection dropped; an unreachable authority surfaces as 503 before
//! the tunnel is established.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::cert_store::TlsInterceptor;
use crate::engine::{error_response, Engine, Source};
use crate::error::ProxyError;

/// Handles a CONNECT request on the proxy endpoint.
///
/// The response returned here completes the CONNECT exchange; the actual
/// tunnel work happens on a spawned task once the connection upgrades.
pub(crate) async fn handle_connect(
    req: Request<Incoming>,
    engine: Arc<Engine>,
    tls: Option<Arc<TlsInterceptor>>,
) -> Response<Full<Bytes>> {
    let Some((host, port)) = tunnel_target(req.uri()) else {
        tracing::warn!("CONNECT without a valid authority: {}", req.uri());
        return error_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
    };

    match tls {
        Some(tls) => {
            tokio::spawn(intercept(req, host, port, engine, tls));
            connection_established()
        }
        None => {
            // Connect upstream before answering so an unreachable
            // authority is reported instead of a dead tunnel.
            match connect_authority(&host, port).await {
                Ok(upstream) => {
                    tokio::spawn(blind_tunnel(req, upstream, host, port));
                    connection_established()
                }
                Err(e) => {
                    tracing::warn!("{e}");
                    error_response(StatusCode::SERVICE_UNAVAILABLE, "cannot reach tunnel target")
                }
            }
        }
    }
}

/// Opens the TCP connection a blind tunnel splices into.
async fn connect_authority(host: &str, port: u16) -> Result<TcpStream, ProxyError> {
    TcpStream::connect((host, port))
        .await
        .map_err(|e| ProxyError::Tunnel(format!("blind tunnel to {host}:{port} failed: {e}")))
}

/// Splices the upgraded client connection and the upstream socket until
/// either side closes.
async fn blind_tunnel(req: Request<Incoming>, mut upstream: TcpStream, host: String, port: u16) {
    match hyper::upgrade::on(req).await {
        Ok(upgraded) => {
            let mut client = TokioIo::new(upgraded);
            match copy_bidirectional(&mut client, &mut upstream).await {
                Ok((sent, received)) => tracing::debug!(
                    "blind tunnel to {host}:{port} closed ({sent} bytes sent, {received} received)"
                ),
                Err(e) => tracing::debug!("blind tunnel to {host}:{port} ended: {e}"),
            }
        }
        Err(e) => tracing::warn!("CONNECT upgrade for {host}:{port} failed: {e}"),
    }
}

/// Takes over the client side of the tunnel with a minted leaf
/// certificate and feeds the decrypted requests back into the engine.
async fn intercept(
    req: Request<Incoming>,
    host: String,
    port: u16,
    engine: Arc<Engine>,
    tls: Arc<TlsInterceptor>,
) {
    let upgraded = match hyper::upgrade::on(req).await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            tracing::warn!("CONNECT upgrade for {host}:{port} failed: {e}");
            return;
        }
    };

    let config = match tls.server_config_for(&host) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("cannot mint certificate for {host}: {e}");
            return;
        }
    };

    match TlsAcceptor::from(config).accept(TokioIo::new(upgraded)).await {
        Ok(stream) => {
            serve_intercepted(
                stream,
                default_host_for(&host, port),
                Source::HttpsExplicit,
                engine,
            )
            .await;
        }
        Err(e) => tracing::debug!("TLS handshake with client for {host} failed: {e}"),
    }
}

/// Serves decrypted HTTP/1.1 requests from an intercepted session
/// through the engine.
pub(crate) async fn serve_intercepted<IO>(
    io: IO,
    default_host: String,
    source: Source,
    engine: Arc<Engine>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let log_host = default_host.clone();
    let host: Arc<str> = default_host.into();

    let service = service_fn(move |req| {
        let engine = engine.clone();
        let host = host.clone();
        async move {
            Ok::<_, Infallible>(engine.handle(req, source, Some(host.as_ref())).await)
        }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        tracing::debug!("intercepted session for {log_host} ended: {e}");
    }
}

/// Extracts the tunnel target from a CONNECT authority, defaulting the
/// port to 443.
fn tunnel_target(uri: &Uri) -> Option<(String, u16)> {
    let host = uri.host()?.to_string();
    let port = uri.port_u16().unwrap_or(443);
    Some((host, port))
}

/// The host the inner requests default to; the standard TLS port is
/// implied and dropped.
fn default_host_for(host: &str, port: u16) -> String {
    if port == 443 {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

fn connection_established() -> Response<Full<Bytes>> {
    Response::new(Full::new(Bytes::new()))
}
