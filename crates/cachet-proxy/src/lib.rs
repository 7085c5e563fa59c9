//! Cachet Proxy - caching HTTP(S) forward proxy for development.
//!
//! Intercepts outbound HTTP(S) requests, stores the raw upstream response
//! on disk under a key derived from the request, and replays it on the
//! next matching request - ignoring origin cache directives entirely.
//!
//! ## Architecture
//!
//! ```text
//! client ──> proxy endpoint ──┬── absolute-form ────────────┐
//!                             ├── origin-form (Host header) ┤
//!                             └── CONNECT ──┬─ blind tunnel │ (interception off)
//!                                           └─ MITM ────────┤ (leaf cert from CA)
//! transparent TLS endpoint ── SNI peek ───── MITM ──────────┤
//!                                                           ▼
//!                                                        engine
//!                                      cache lookup ── hit ──> replay (X-Cache: HIT)
//!                                           │ miss
//!                                           ▼
//!                                     upstream fetch ── rules ──> cache? ──> client
//! ```
//!
//! The engine runs the same two-phase pipeline for every source: derive
//! the cache key, try the disk cache, otherwise fetch upstream and - when
//! the rules allow - persist the response for the next run.
//!
//! Upstream TLS verification is deliberately disabled: the proxy exists
//! to serve developer machines talking to arbitrary (often self-signed)
//! endpoints. Do not point production traffic at it.

mod ca;
mod cert_store;
mod engine;
mod error;
mod server;
mod transparent;
mod tunnel;

pub use ca::CaManager;
pub use cert_store::{CertStore, TlsInterceptor};
pub use engine::{Engine, Source, BYPASS_HEADER, CACHE_FILE_HEADER, CACHE_HEADER};
pub use error::{CaError, ProxyError, Result};
pub use server::{ProxyHandle, ProxyServer};
