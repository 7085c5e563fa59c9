//! End-to-end tests against a real in-process upstream.
//!
//! Each test starts its own upstream server and proxy on ephemeral ports
//! and drives them with a reqwest client configured to use the proxy.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use cachet_core::{CacheRule, Config, RuleMode, RuleSet};
use cachet_proxy::{CaManager, ProxyHandle, ProxyServer};

/// Serves the fixture upstream's responses and counts requests.
async fn upstream_service(
    req: Request<Incoming>,
    hits: Arc<AtomicUsize>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    hits.fetch_add(1, Ordering::SeqCst);

    let saw_bypass = req.headers().contains_key("x-cache-bypass");
    let resp = match req.uri().path() {
        "/missing" => Response::builder()
            .status(404)
            .body(Full::new(Bytes::from_static(b"gone")))
            .unwrap(),
        "/created" => Response::builder()
            .status(201)
            .body(Full::new(Bytes::from_static(b"made")))
            .unwrap(),
        _ => Response::builder()
            .status(200)
            .header("content-type", "text/plain")
            .header("x-saw-bypass", if saw_bypass { "true" } else { "false" })
            .body(Full::new(Bytes::from_static(b"hello")))
            .unwrap(),
    };
    Ok(resp)
}

/// Starts a plaintext upstream server; returns its address and a request
/// counter.
async fn start_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let hits_accept = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let hits = hits_accept.clone();
            tokio::spawn(async move {
                let service =
                    service_fn(move |req| upstream_service(req, hits.clone()));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, hits)
}

/// Starts a TLS upstream presenting a certificate for `localhost` minted
/// by the given CA.
async fn start_tls_upstream(ca: &CaManager) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let acceptor = tokio_rustls::TlsAcceptor::from(ca.mint_server_config("localhost").unwrap());

    let hits_accept = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let hits = hits_accept.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(stream).await else {
                    return;
                };
                let service =
                    service_fn(move |req| upstream_service(req, hits.clone()));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, hits)
}

fn fixture_config(cache_dir: &TempDir, rules: Option<RuleSet>) -> Config {
    let mut config = Config::default();
    config.server.http.address = "127.0.0.1:0".to_string();
    config.server.https.enabled = false;
    config.cache.ttl = "1h".to_string();
    config.cache.folder = cache_dir.path().to_path_buf();
    if let Some(rules) = rules {
        config.rules = rules;
    }
    config
}

async fn start_proxy(config: Config) -> ProxyHandle {
    ProxyServer::new(config).unwrap().start().await.unwrap()
}

fn proxied_client(proxy_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy_addr}")).unwrap())
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}

#[tokio::test]
async fn cold_then_warm_get() {
    let (upstream, hits) = start_upstream().await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(fixture_config(&cache_dir, None)).await;
    let client = proxied_client(proxy.addr());

    // cold: upstream is contacted and the entry is written
    let resp = client
        .get(format!("http://{upstream}/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-cache"], "MISS");
    assert_eq!(resp.text().await.unwrap(), "hello");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let cache_file = cache_dir
        .path()
        .join(upstream.to_string())
        .join("foo")
        .join("GET.bin");
    assert!(cache_file.is_file(), "expected {}", cache_file.display());
    let raw = std::fs::read_to_string(&cache_file).unwrap();
    assert!(raw.starts_with("---HTTP-RESPONSE---\nHTTP/1.1 200 OK\r\n"));
    assert!(raw.ends_with("hello"));

    // warm: served from disk, upstream never sees the request
    let resp = client
        .get(format!("http://{upstream}/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-cache"], "HIT");
    assert_eq!(
        resp.headers()["x-cache-file"],
        format!("{upstream}/foo/GET.bin").as_str()
    );
    assert_eq!(resp.text().await.unwrap(), "hello");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn query_strings_key_separate_entries() {
    let (upstream, _hits) = start_upstream().await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(fixture_config(&cache_dir, None)).await;
    let client = proxied_client(proxy.addr());

    for query in ["q=1", "q=2"] {
        let resp = client
            .get(format!("http://{upstream}/search?{query}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.headers()["x-cache"], "MISS");
    }

    let search_dir = cache_dir.path().join(upstream.to_string()).join("search");
    let files: Vec<_> = std::fs::read_dir(&search_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(files.len(), 2);
    for name in &files {
        assert!(name.starts_with("GET_q"), "unexpected file name {name}");
        assert!(name.ends_with(".bin"));
    }

    proxy.stop().await;
}

#[tokio::test]
async fn bypass_forces_upstream_and_strips_header() {
    let (upstream, hits) = start_upstream().await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(fixture_config(&cache_dir, None)).await;
    let client = proxied_client(proxy.addr());

    // populate the cache
    client
        .get(format!("http://{upstream}/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let cache_file = cache_dir
        .path()
        .join(upstream.to_string())
        .join("foo")
        .join("GET.bin");
    let mtime_before = std::fs::metadata(&cache_file).unwrap().modified().unwrap();

    let resp = client
        .get(format!("http://{upstream}/foo"))
        .header("X-Cache-Bypass", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-cache"], "BYPASS");
    // upstream was contacted and did not see the bypass header
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(resp.headers()["x-saw-bypass"], "false");

    // the cached entry was neither replaced nor removed
    let mtime_after = std::fs::metadata(&cache_file).unwrap().modified().unwrap();
    assert_eq!(mtime_before, mtime_after);

    // an empty value is not a bypass request; the cache still answers
    let resp = client
        .get(format!("http://{upstream}/foo"))
        .header("X-Cache-Bypass", "")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-cache"], "HIT");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    proxy.stop().await;
}

#[tokio::test]
async fn include_mode_skips_unmatched_requests() {
    let (upstream, hits) = start_upstream().await;
    let cache_dir = TempDir::new().unwrap();
    let rules = RuleSet::new(
        RuleMode::Include,
        vec![CacheRule::new("https://other.test", &["GET"])],
    );
    let proxy = start_proxy(fixture_config(&cache_dir, Some(rules))).await;
    let client = proxied_client(proxy.addr());

    let resp = client
        .get(format!("http://{upstream}/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-cache"], "DISABLED");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let cache_file = cache_dir
        .path()
        .join(upstream.to_string())
        .join("foo")
        .join("GET.bin");
    assert!(!cache_file.exists());

    proxy.stop().await;
}

#[tokio::test]
async fn status_patterned_rule_gates_on_response() {
    let (upstream, _hits) = start_upstream().await;
    let cache_dir = TempDir::new().unwrap();
    let rules = RuleSet::new(
        RuleMode::Include,
        vec![CacheRule::new(format!("http://{upstream}"), &["GET"]).with_status_codes(&["2xx"])],
    );
    let proxy = start_proxy(fixture_config(&cache_dir, Some(rules))).await;
    let client = proxied_client(proxy.addr());

    // 404 falls outside 2xx: not cached
    let resp = client
        .get(format!("http://{upstream}/missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.headers()["x-cache"], "DISABLED");
    assert!(!cache_dir
        .path()
        .join(upstream.to_string())
        .join("missing")
        .join("GET.bin")
        .exists());

    // 201 matches 2xx: cached
    let resp = client
        .get(format!("http://{upstream}/created"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    assert_eq!(resp.headers()["x-cache"], "MISS");
    assert!(cache_dir
        .path()
        .join(upstream.to_string())
        .join("created")
        .join("GET.bin")
        .is_file());

    proxy.stop().await;
}

#[tokio::test]
async fn origin_form_requests_are_proxied_transparently() {
    let (upstream, _hits) = start_upstream().await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(fixture_config(&cache_dir, None)).await;

    // a client that was redirected at the network layer speaks
    // origin-form and only carries a Host header
    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    stream
        .write_all(
            format!("GET /foo HTTP/1.1\r\nHost: {upstream}\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.to_lowercase().contains("x-cache: miss"), "{response}");
    assert!(response.ends_with("hello"), "{response}");

    // the cache key was derived from the Host header
    assert!(cache_dir
        .path()
        .join(upstream.to_string())
        .join("foo")
        .join("GET.bin")
        .is_file());

    proxy.stop().await;
}

#[tokio::test]
async fn origin_form_without_host_is_rejected() {
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(fixture_config(&cache_dir, None)).await;

    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    stream
        .write_all(b"GET /foo HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(
        response.starts_with("HTTP/1.0 400") || response.starts_with("HTTP/1.1 400"),
        "{response}"
    );

    proxy.stop().await;
}

/// Writes a CA into a temp dir and returns a config with interception
/// enabled against it.
fn mitm_config(cache_dir: &TempDir, ca_dir: &TempDir) -> (Config, CaManager) {
    let ca = CaManager::load_or_generate(ca_dir.path()).unwrap();
    let (cert_name, key_name) = CaManager::file_names();

    let mut config = fixture_config(cache_dir, None);
    config.server.https.enabled = true;
    config.server.https.ca_cert_file = ca_dir.path().join(cert_name).display().to_string();
    config.server.https.ca_key_file = ca_dir.path().join(key_name).display().to_string();
    (config, ca)
}

#[tokio::test]
async fn connect_is_intercepted_and_cached() {
    let cache_dir = TempDir::new().unwrap();
    let ca_dir = TempDir::new().unwrap();
    let (config, ca) = mitm_config(&cache_dir, &ca_dir);
    let (upstream, hits) = start_tls_upstream(&ca).await;

    let proxy = start_proxy(config).await;
    let client = proxied_client(proxy.addr());

    let url = format!("https://localhost:{}/foo", upstream.port());

    // cold request rides an intercepted CONNECT tunnel
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-cache"], "MISS");
    assert_eq!(resp.text().await.unwrap(), "hello");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // warm request replays from disk without touching the origin
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.headers()["x-cache"], "HIT");
    assert_eq!(resp.text().await.unwrap(), "hello");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(cache_dir
        .path()
        .join(format!("localhost:{}", upstream.port()))
        .join("foo")
        .join("GET.bin")
        .is_file());

    proxy.stop().await;
}

#[tokio::test]
async fn transparent_tls_intercepts_by_sni() {
    let cache_dir = TempDir::new().unwrap();
    let ca_dir = TempDir::new().unwrap();
    let (mut config, ca) = mitm_config(&cache_dir, &ca_dir);
    config.server.https.transparent.address = "127.0.0.1:0".to_string();
    let (upstream, _hits) = start_tls_upstream(&ca).await;

    let proxy = start_proxy(config).await;
    let transparent_addr = proxy.transparent_addr().expect("transparent listener");

    // a TLS client that trusts our CA, connecting straight to the
    // transparent endpoint as if redirected by the packet filter
    let mut roots = rustls::RootCertStore::empty();
    let ca_pem = std::fs::read(ca_dir.path().join(CaManager::file_names().0)).unwrap();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let client_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let tcp = TcpStream::connect(transparent_addr).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(server_name, tcp).await.unwrap();

    // the minted leaf verified against our CA; now speak HTTP inside
    tls.write_all(
        format!(
            "GET /foo HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n",
            upstream.port()
        )
        .as_bytes(),
    )
    .await
    .unwrap();

    let mut response = String::new();
    let _ = tls.read_to_string(&mut response).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.to_lowercase().contains("x-cache: miss"), "{response}");
    assert!(response.ends_with("hello"), "{response}");

    assert!(cache_dir
        .path()
        .join(format!("localhost:{}", upstream.port()))
        .join("foo")
        .join("GET.bin")
        .is_file());

    proxy.stop().await;
}
