use url::Url;

/// Canonical form of a media URL: the fragment is volatile (players append
/// `#t=` offsets) and never part of the cache identity.
pub fn canonicalize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => match raw.trim().split_once('#') {
            Some((base, _)) => base.to_string(),
            None => raw.trim().to_string(),
        },
    }
}

/// Blob key of chunk `index` for `url` stored with windows of `chunk_size`.
///
/// Canonical URLs carry no fragment, so a fragment-shaped suffix can never
/// collide with a whole-file key.
pub fn chunk_key(url: &str, index: u64, chunk_size: u64) -> String {
    format!("{url}#chunk={chunk_size}:{index}")
}

/// Inclusive byte window `[start, end]` covered by chunk `index`.
pub fn chunk_window(index: u64, chunk_size: u64, total: u64) -> (u64, u64) {
    let start = index * chunk_size;
    let end = std::cmp::min(start + chunk_size, total).saturating_sub(1);
    (start, end)
}

/// Recognizes the narrow class of streaming media URLs the responder
/// intercepts. Everything else passes straight through to the network.
#[derive(Debug, Clone)]
pub struct StreamUrlMatcher {
    path_markers: Vec<String>,
}

impl StreamUrlMatcher {
    pub fn new(path_markers: Vec<String>) -> Self {
        Self { path_markers }
    }

    pub fn matches(&self, raw: &str) -> bool {
        let Ok(url) = Url::parse(raw) else {
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let path = url.path();
        self.path_markers
            .iter()
            .any(|marker| !marker.is_empty() && path.contains(marker.as_str()))
    }
}
