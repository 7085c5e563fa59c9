//! The proxy engine.
//!
//! Runs the same two-phase pipeline for every request source. Pre-flight:
//! derive the cache key and try the disk cache; a hit is replayed without
//! touching the network. Post-flight: fetch upstream, consult the rules,
//! persist eligible responses and stamp the `X-Cache` header.
//!
//! Cache failures never reach the client: read errors, corrupt entries
//! and write errors all degrade to a plain upstream fetch. Upstream
//! failures surface as `502 Bad Gateway`.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, HOST};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;

use cachet_cache::HttpCache;
use cachet_core::RuleSet;

use crate::error::ProxyError;

/// Request header that forces a fresh upstream fetch and suppresses
/// caching. Stripped before the request reaches upstream.
pub const BYPASS_HEADER: &str = "x-cache-bypass";

/// Response header reporting the cache outcome: `HIT`, `MISS`,
/// `DISABLED` or `BYPASS`.
pub const CACHE_HEADER: &str = "x-cache";

/// Response header carrying the relative cache path. Only set on hits.
pub const CACHE_FILE_HEADER: &str = "x-cache-file";

/// Timeout applied to the full upstream request-response cycle.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that must not be forwarded between hops.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// How a request reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Absolute-form request on the proxy endpoint.
    HttpExplicit,
    /// Origin-form request on the proxy endpoint, host from `Host`.
    HttpTransparent,
    /// Decrypted request inside an explicit CONNECT tunnel.
    HttpsExplicit,
    /// Decrypted request from the transparent TLS listener.
    HttpsTransparent,
}

impl Source {
    /// Returns the source tag used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpExplicit => "http-explicit",
            Self::HttpTransparent => "http-transparent",
            Self::HttpsExplicit => "https-explicit",
            Self::HttpsTransparent => "https-transparent",
        }
    }

    /// Returns the scheme requests from this source default to.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::HttpExplicit | Self::HttpTransparent => "http",
            Self::HttpsExplicit | Self::HttpsTransparent => "https",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome stamped into the `X-Cache` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheStatus {
    Hit,
    Miss,
    Disabled,
    Bypass,
}

impl CacheStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Disabled => "DISABLED",
            Self::Bypass => "BYPASS",
        }
    }

    /// Hits and bypasses overwrite an origin-supplied `X-Cache` header;
    /// the upstream-derived outcomes leave it alone.
    fn overrides(self) -> bool {
        matches!(self, Self::Hit | Self::Bypass)
    }
}

/// Per-request state crossing the two pipeline phases.
#[derive(Debug)]
struct RequestContext {
    started_at: Instant,
    source: Source,
    cache_key: Option<String>,
    bypass: bool,
}

/// The caching pipeline shared by all listeners.
#[derive(Debug)]
pub struct Engine {
    cache: HttpCache,
    rules: RuleSet,
    client: reqwest::Client,
}

impl Engine {
    /// Creates an engine over the given cache and rules.
    ///
    /// The upstream client honors `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`,
    /// never verifies upstream certificates, never follows redirects
    /// (the client behind us decides that), and gives up after
    /// [`UPSTREAM_TIMEOUT`].
    pub fn new(cache: HttpCache, rules: RuleSet) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(UPSTREAM_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Http(format!("failed to build upstream client: {e}")))?;

        Ok(Self {
            cache,
            rules,
            client,
        })
    }

    /// Returns the ruleset the engine evaluates.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Returns the cache the engine reads and writes.
    pub fn cache(&self) -> &HttpCache {
        &self.cache
    }

    /// Runs one request through the pipeline and produces the response
    /// sent back to the client. Never fails; failures become status
    /// codes.
    ///
    /// `default_host` supplies the authority for origin-form requests
    /// that arrive without a `Host` header, e.g. inside a CONNECT tunnel.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        source: Source,
        default_host: Option<&str>,
    ) -> Response<Full<Bytes>> {
        let mut ctx = RequestContext {
            started_at: Instant::now(),
            source,
            cache_key: None,
            bypass: false,
        };

        let url = match absolute_url(&req, source, default_host) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("rejecting request: {e}");
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "cannot handle requests without Host header, e.g. HTTP/1.0",
                );
            }
        };
        let method = req.method().clone();
        let (mut parts, body) = req.into_parts();

        // only a non-empty value requests a bypass
        let bypass_requested = parts
            .headers
            .get(BYPASS_HEADER)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if bypass_requested {
            parts.headers.remove(BYPASS_HEADER);
            tracing::debug!("bypassing cache for {url}");
            ctx.bypass = true;
        }

        if !ctx.bypass {
            match self.cache.derive_key(&url, method.as_str()) {
                Ok(key) => {
                    if let Some(cached) = self.lookup(&key, &url, &method) {
                        return self.finish(cached, &ctx, &method, &url, CacheStatus::Hit, Some(&key));
                    }
                    ctx.cache_key = Some(key);
                }
                Err(e) => tracing::warn!("failed to derive cache key for {url}: {e}"),
            }
        }

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("failed to read request body for {url}: {e}");
                return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
            }
        };

        let upstream = match self
            .fetch_upstream(method.clone(), &url, parts.headers, body_bytes)
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!("upstream fetch for {url} failed: {e}");
                return error_response(StatusCode::BAD_GATEWAY, "upstream fetch failed");
            }
        };

        let status = upstream.status();
        let x_cache = if ctx.bypass {
            CacheStatus::Bypass
        } else if self
            .rules
            .should_cache(&url, method.as_str(), Some(status.as_u16()))
        {
            if let Some(key) = &ctx.cache_key {
                if let Err(e) = self.cache.set(key, &upstream) {
                    tracing::error!("failed to cache response for {url}: {e}");
                }
            }
            CacheStatus::Miss
        } else {
            CacheStatus::Disabled
        };

        self.finish(upstream, &ctx, &method, &url, x_cache, None)
    }

    /// Tries the cache, downgrading every failure mode to a miss.
    fn lookup(&self, key: &str, url: &str, method: &Method) -> Option<Response<Bytes>> {
        match self.cache.get(key) {
            Ok(Some(resp)) => {
                tracing::debug!("serving {url} from cache");
                Some(resp)
            }
            Ok(None) => None,
            Err(e) if e.is_corrupt() => {
                tracing::debug!("corrupt cache entry for {url}: {e}");
                None
            }
            Err(e) => {
                // Only worth an error-level line when the rules would
                // have cached this request in the first place.
                if self.rules.should_cache(url, method.as_str(), None) {
                    tracing::error!("failed to read cache for {url}: {e}");
                } else {
                    tracing::debug!("failed to read cache for {url}: {e}");
                }
                None
            }
        }
    }

    /// Forwards the request upstream and buffers the whole response.
    async fn fetch_upstream(
        &self,
        method: Method,
        url: &str,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Bytes>, ProxyError> {
        for name in HOP_BY_HOP_HEADERS {
            headers.remove(*name);
        }
        // reqwest derives Host from the URL
        headers.remove(HOST);

        let upstream = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        for name in HOP_BY_HOP_HEADERS {
            headers.remove(*name);
        }
        let body = upstream
            .bytes()
            .await
            .map_err(|e| ProxyError::Upstream(format!("reading upstream body: {e}")))?;

        let mut resp = Response::new(body);
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        Ok(resp)
    }

    /// Stamps the cache headers, logs the request line and converts the
    /// buffered response into the outbound body type.
    fn finish(
        &self,
        resp: Response<Bytes>,
        ctx: &RequestContext,
        method: &Method,
        url: &str,
        x_cache: CacheStatus,
        cache_file: Option<&str>,
    ) -> Response<Full<Bytes>> {
        let (mut parts, body) = resp.into_parts();

        if x_cache.overrides() || !parts.headers.contains_key(CACHE_HEADER) {
            parts
                .headers
                .insert(CACHE_HEADER, HeaderValue::from_static(x_cache.as_str()));
        }
        if let Some(key) = cache_file {
            if let Ok(value) = HeaderValue::from_str(key) {
                parts.headers.insert(CACHE_FILE_HEADER, value);
            }
        }

        tracing::info!(
            "{} {} {} <- {} {} ({})",
            ctx.source,
            parts.status.as_u16(),
            x_cache.as_str(),
            method,
            url,
            format_duration(ctx.started_at.elapsed())
        );

        Response::from_parts(parts, Full::new(body))
    }
}

/// Rebuilds the absolute URL of a request.
///
/// Absolute-form requests pass through unchanged. Origin-form requests
/// get the scheme of their carrier and the host from the `Host` header,
/// the URI authority, or `default_host`, in that order.
pub(crate) fn absolute_url<B>(
    req: &Request<B>,
    source: Source,
    default_host: Option<&str>,
) -> Result<String, ProxyError> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.host().is_some() {
        // scheme://authority with no path renders without the trailing slash
        if uri.path_and_query().is_none() {
            return Ok(format!("{uri}/"));
        }
        return Ok(uri.to_string());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .map(str::to_owned)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .or_else(|| default_host.map(str::to_owned))
        .ok_or_else(|| ProxyError::Protocol("request has no Host header".into()))?;

    let path = if uri.path().is_empty() { "/" } else { uri.path() };
    Ok(match uri.query() {
        Some(query) => format!("{}://{host}{path}?{query}", source.scheme()),
        None => format!("{}://{host}{path}", source.scheme()),
    })
}

/// Builds a plain-text error response.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(format!("{message}\n"))));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Renders a latency for the request log, rounded to the nearest
/// microsecond below 1 ms, millisecond below 1 s, whole second above.
fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if d < Duration::from_millis(1) {
        format!("{}µs", (secs * 1_000_000.0).round() as u64)
    } else if d < Duration::from_secs(1) {
        format!("{}ms", (secs * 1_000.0).round() as u64)
    } else {
        format!("{}s", secs.round() as u64)
    }
}
