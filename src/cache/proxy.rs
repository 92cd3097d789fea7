use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use reqwest::Client;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::blob_store::{BlobMeta, BlobStore};
use super::keys::{StreamUrlMatcher, canonicalize_url, chunk_key};
use super::range::{ByteRange, RangeError, parse_range_header, unsatisfied_content_range};
use super::stats::ProxyStats;
use crate::db::repository::OfflineRepository;
use crate::models::ChunkedUrlMetadata;
use crate::utils::CacheError;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Origin headers copied onto pass-through responses.
const FORWARDED_HEADERS: [HeaderName; 6] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
    header::ETAG,
    header::LAST_MODIFIED,
];

/// What the responder decided for one request.
pub enum Interception {
    /// Answered from the cache (or a cache-side error)
    Respond(Response),
    /// Not ours; the caller fetches it from the network
    PassThrough,
}

impl Interception {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, Self::PassThrough)
    }
}

/// Answers media reads from the blob store, whole-file or stitched from
/// chunks, with real HTTP range semantics.
#[derive(Clone)]
pub struct CacheResponder {
    blobs: BlobStore,
    repository: Arc<dyn OfflineRepository>,
    matcher: StreamUrlMatcher,
    stats: ProxyStats,
}

impl CacheResponder {
    pub fn new(
        blobs: BlobStore,
        repository: Arc<dyn OfflineRepository>,
        matcher: StreamUrlMatcher,
    ) -> Self {
        Self {
            blobs,
            repository,
            matcher,
            stats: ProxyStats::new(),
        }
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Serve `raw_url` from the cache if anything for it is cached.
    ///
    /// Only `GET` and `HEAD` for recognized streaming URLs are considered;
    /// everything else passes through untouched.
    pub async fn respond(&self, method: &Method, raw_url: &str, range: Option<&str>) -> Interception {
        if (*method != Method::GET && *method != Method::HEAD) || !self.matcher.matches(raw_url) {
            return Interception::PassThrough;
        }

        self.stats.increment_request();
        if range.is_some() {
            self.stats.increment_range_request();
        }

        let url = canonicalize_url(raw_url);
        let head_only = *method == Method::HEAD;

        match self.blobs.head(&url).await {
            Ok(Some(meta)) => {
                if let Some(response) = self.serve_whole(&url, meta, head_only, range).await {
                    self.stats.increment_whole_hit();
                    return Interception::Respond(response);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to inspect cached blob for {}: {:#}", url, e),
        }

        let metadata = match self.repository.get_chunked_url(&url).await {
            Ok(Some(metadata)) if metadata.chunked && metadata.chunk_size > 0 => metadata,
            Ok(_) => {
                debug!("Responder: {} not cached, passing through", url);
                self.stats.increment_pass_through();
                return Interception::PassThrough;
            }
            Err(e) => {
                warn!("Failed to load chunk metadata for {}: {:#}", url, e);
                self.stats.increment_pass_through();
                return Interception::PassThrough;
            }
        };

        self.stats.increment_chunked_hit();
        Interception::Respond(self.serve_chunked(&metadata, head_only, range).await)
    }

    /// `None` when the blob vanished between lookup and read; that counts
    /// as never cached.
    async fn serve_whole(
        &self,
        url: &str,
        meta: BlobMeta,
        head_only: bool,
        range: Option<&str>,
    ) -> Option<Response> {
        let mut headers = replayed_headers(&meta);
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        if head_only {
            debug!("Responder: HEAD whole-file hit for {}", url);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.content_length));
            return Some((StatusCode::OK, headers, Body::empty()).into_response());
        }

        let blob = match self.blobs.get(url).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(e) => {
                error!("Failed to read cached blob for {}: {:#}", url, e);
                self.stats.increment_read_failure();
                return Some(StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
        };
        let total = blob.data.len() as u64;

        let Some(range) = range else {
            debug!("Responder: whole-file hit for {} ({} bytes)", url, total);
            self.stats.add_bytes_served(total);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total));
            return Some((StatusCode::OK, headers, Body::from(blob.data)).into_response());
        };

        match parse_range_header(range, total) {
            Ok(window) => {
                debug!(
                    "Responder: whole-file range {} for {}",
                    window.content_range(total),
                    url
                );
                let slice = blob.data.slice(window.start as usize..=window.end as usize);
                self.stats.add_bytes_served(window.len());
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(window.len()));
                insert_header(&mut headers, header::CONTENT_RANGE, &window.content_range(total));
                Some((StatusCode::PARTIAL_CONTENT, headers, Body::from(slice)).into_response())
            }
            Err(e) => {
                debug!("Responder: {} for {} ({:?} of {})", e, url, range, total);
                Some(self.unsatisfiable(total, headers))
            }
        }
    }

    async fn serve_chunked(
        &self,
        metadata: &ChunkedUrlMetadata,
        head_only: bool,
        range: Option<&str>,
    ) -> Response {
        let url = metadata.url.as_str();
        let total = metadata.bytes_total;
        let chunk_size = metadata.chunk_size;

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        insert_header(
            &mut headers,
            header::CONTENT_TYPE,
            metadata.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE),
        );

        if head_only {
            debug!("Responder: HEAD chunked hit for {}", url);
            if total > 0 {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total));
            }
            return (StatusCode::OK, headers, Body::empty()).into_response();
        }

        // Without a total there is no range math; stream until the first gap
        let Some(full) = ByteRange::full(total) else {
            if !self.blobs.contains(&chunk_key(url, 0, chunk_size)).await {
                warn!("Responder: first chunk of {} is missing", url);
                self.stats.increment_read_failure();
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            debug!("Responder: chunked hit for {} with unknown length", url);
            let body = Body::from_stream(open_ended_chunks(
                self.blobs.clone(),
                url.to_string(),
                chunk_size,
            ));
            return (StatusCode::OK, headers, body).into_response();
        };

        let (window, partial) = match range.map(|value| parse_range_header(value, total)) {
            Some(Ok(window)) => (window, true),
            Some(Err(RangeError::Unsatisfiable)) => return self.unsatisfiable(total, headers),
            // A header we can't read is treated as absent
            Some(Err(RangeError::Malformed)) | None => (full, false),
        };

        let first = window.start / chunk_size;
        let last = window.end / chunk_size;
        for index in first..=last {
            if !self.blobs.contains(&chunk_key(url, index, chunk_size)).await {
                warn!(
                    "Responder: chunk {} of {} is missing, refusing {}",
                    index,
                    url,
                    window.content_range(total)
                );
                self.stats.increment_read_failure();
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }

        debug!(
            "Responder: chunked {} for {} (chunks {}..={})",
            window.content_range(total),
            url,
            first,
            last
        );
        self.stats.add_bytes_served(window.len());
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(window.len()));

        let status = if partial {
            insert_header(&mut headers, header::CONTENT_RANGE, &window.content_range(total));
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };

        let body = Body::from_stream(chunk_slices(
            self.blobs.clone(),
            url.to_string(),
            chunk_size,
            window,
        ));
        (status, headers, body).into_response()
    }

    fn unsatisfiable(&self, total: u64, mut headers: HeaderMap) -> Response {
        self.stats.increment_unsatisfiable();
        headers.remove(header::CONTENT_LENGTH);
        insert_header(&mut headers, header::CONTENT_RANGE, &unsatisfied_content_range(total));
        (StatusCode::RANGE_NOT_SATISFIABLE, headers, Body::empty()).into_response()
    }
}

/// Lazily emits the part of each chunk that overlaps `window`, in order.
///
/// Interior chunks go out whole; only the first and last are trimmed.
fn chunk_slices(
    blobs: BlobStore,
    url: String,
    chunk_size: u64,
    window: ByteRange,
) -> impl Stream<Item = Result<Bytes, CacheError>> + Send + 'static {
    let first = window.start / chunk_size;
    let last = window.end / chunk_size;

    stream::iter(first..=last).then(move |index| {
        let blobs = blobs.clone();
        let url = url.clone();
        async move { read_chunk_slice(&blobs, &url, index, chunk_size, window).await }
    })
}

async fn read_chunk_slice(
    blobs: &BlobStore,
    url: &str,
    index: u64,
    chunk_size: u64,
    window: ByteRange,
) -> Result<Bytes, CacheError> {
    let blob = blobs
        .get(&chunk_key(url, index, chunk_size))
        .await?
        .ok_or_else(|| CacheError::MissingChunk {
            url: url.to_string(),
            index,
        })?;

    let chunk_start = index * chunk_size;
    let from = window.start.saturating_sub(chunk_start);
    let to = (window.end - chunk_start + 1).min(chunk_size);

    let actual = blob.data.len() as u64;
    if actual < to {
        return Err(CacheError::ShortChunk {
            url: url.to_string(),
            index,
            expected: to,
            actual,
        });
    }
    Ok(blob.data.slice(from as usize..to as usize))
}

/// Every chunk from 0 until the first one that is not cached.
fn open_ended_chunks(
    blobs: BlobStore,
    url: String,
    chunk_size: u64,
) -> impl Stream<Item = Result<Bytes, CacheError>> + Send + 'static {
    stream::unfold(Some(0u64), move |next| {
        let blobs = blobs.clone();
        let url = url.clone();
        async move {
            let index = next?;
            match blobs.get(&chunk_key(&url, index, chunk_size)).await {
                Ok(Some(blob)) => Some((Ok(blob.data), Some(index + 1))),
                Ok(None) => None,
                Err(e) => Some((Err(CacheError::Storage(e)), None)),
            }
        }
    })
}

fn replayed_headers(meta: &BlobMeta) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &meta.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        if name != header::CONTENT_LENGTH {
            headers.insert(name, value);
        }
    }
    if let Some(content_type) = &meta.content_type {
        insert_header(&mut headers, header::CONTENT_TYPE, content_type);
    }
    headers
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => warn!("Dropping invalid {} header {:?}: {}", name, value, e),
    }
}

#[derive(Clone)]
struct ProxyState {
    responder: CacheResponder,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ProxyQuery {
    url: String,
}

/// Router for `GET`/`HEAD /proxy?url=<origin url>`.
pub fn router(responder: CacheResponder, client: Client) -> Router {
    Router::new()
        .route("/proxy", get(serve_proxy).head(serve_proxy))
        .with_state(ProxyState { responder, client })
}

async fn serve_proxy(
    State(state): State<ProxyState>,
    method: Method,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Response {
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    match state.responder.respond(&method, &query.url, range).await {
        Interception::Respond(response) => response,
        Interception::PassThrough => forward(&state.client, method, &query.url, range).await,
    }
}

/// Fetch from the origin, propagating `Range`, and stream the answer back.
async fn forward(client: &Client, method: Method, raw_url: &str, range: Option<&str>) -> Response {
    let url = match Url::parse(raw_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => {
            debug!("Refusing to forward {:?}", raw_url);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let mut request = client.request(method.clone(), url.clone());
    if let Some(range) = range {
        request = request.header(header::RANGE, range);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Pass-through to {} failed: {}", url, e);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status = response.status();
    let mut headers = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = response.headers().get(&name) {
            headers.insert(name, value.clone());
        }
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(response.bytes_stream())
    };
    (status, headers, body).into_response()
}

/// Local HTTP server in front of the responder. Players are handed
/// [`ResponderServer::proxy_url`] instead of the origin URL.
pub struct ResponderServer {
    addr: SocketAddr,
    stats: ProxyStats,
    shutdown: CancellationToken,
}

impl ResponderServer {
    /// Bind `listen_addr` (port 0 picks a free one) and start serving.
    pub async fn bind(listen_addr: &str, responder: CacheResponder, client: Client) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind responder on {}", listen_addr))?;
        let addr = listener.local_addr()?;
        info!("Responder listening on {}", addr);

        let stats = responder.stats().clone();
        let app = router(responder, client);
        let shutdown = CancellationToken::new();
        let stopped = shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(stopped.cancelled_owned())
                .await
            {
                error!("Responder server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            stats,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Playback URL for `origin_url` served through this responder.
    pub fn proxy_url(&self, origin_url: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(origin_url.as_bytes()).collect();
        format!("http://{}/proxy?url={}", self.addr, encoded)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
