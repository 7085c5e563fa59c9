//! Transparent HTTPS listener.
//!
//! A second socket, typically the target of a packet-filter redirect.
//! The client never asked for a proxy, so there is no CONNECT: the
//! listener reads the TLS ClientHello, takes the destination host from
//! the SNI extension, and enters the interception path as an implicit
//! tunnel to `<sni>:443`. Clients that do not send SNI are dropped -
//! without a name there is nothing to mint a certificate for.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::LazyConfigAcceptor;

use crate::cert_store::TlsInterceptor;
use crate::engine::{Engine, Source};
use crate::error::ProxyError;
use crate::tunnel::serve_intercepted;

/// Runs the transparent TLS listener until the socket fails fatally.
pub(crate) async fn run(
    listener: TcpListener,
    engine: Arc<Engine>,
    tls: Arc<TlsInterceptor>,
) -> Result<(), ProxyError> {
    tracing::info!(
        "transparent HTTPS proxying enabled at {}",
        listener.local_addr()?
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("error accepting transparent connection: {e}");
                continue;
            }
        };

        let engine = engine.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
            let start = match acceptor.await {
                Ok(start) => start,
                Err(e) => {
                    tracing::debug!("failed to read ClientHello from {peer}: {e}");
                    return;
                }
            };

            let Some(sni) = start.client_hello().server_name().map(str::to_string) else {
                tracing::warn!("cannot support non-SNI enabled clients, dropping {peer}");
                return;
            };

            let config = match tls.server_config_for(&sni) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!("cannot mint certificate for {sni}: {e}");
                    return;
                }
            };

            match start.into_stream(config).await {
                Ok(stream) => {
                    serve_intercepted(stream, sni, Source::HttpsTransparent, engine).await;
                }
                Err(e) => tracing::debug!("TLS handshake with {peer} for {sni} failed: {e}"),
            }
        });
    }
}
