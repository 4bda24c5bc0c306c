//! Video source addresses and the canonical keys derived from them.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("empty locator")]
    Empty,
    #[error("invalid stream url {input:?}: {source}")]
    InvalidUrl {
        input: String,
        #[source]
        source: url::ParseError,
    },
}

/// Address of a video source: a local capture device, a network URL or a
/// local video file.
///
/// URLs are stored normalized so that equivalent spellings of the same
/// camera address map to the same [`StreamKey`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Locator {
    Device(u32),
    Url(String),
    File(PathBuf),
}

impl Locator {
    pub fn parse(input: &str) -> Result<Self, LocatorError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(LocatorError::Empty);
        }
        if trimmed.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = trimmed.parse::<u32>() {
                return Ok(Locator::Device(index));
            }
        }
        if trimmed.contains("://") {
            return normalize_url(trimmed).map(Locator::Url);
        }
        Ok(Locator::File(PathBuf::from(trimmed)))
    }

    /// Canonical key for this source. Two locators share a key exactly when
    /// their normalized forms are equal.
    pub fn key(&self) -> StreamKey {
        match self {
            Locator::Device(index) => StreamKey(format!("device:{index}")),
            Locator::Url(url) => StreamKey(format!("url:{url}")),
            Locator::File(path) => StreamKey(format!("file:{}", path.display())),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Locator::Url(_))
    }
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Locator::parse(s)
    }
}

/// Displays the locator with any URL password masked, so it is safe to log.
impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Device(index) => write!(f, "device {index}"),
            Locator::File(path) => write!(f, "{}", path.display()),
            Locator::Url(raw) => match url::Url::parse(raw) {
                Ok(mut url) if url.password().is_some() => {
                    let _ = url.set_password(Some("***"));
                    write!(f, "{url}")
                }
                _ => write!(f, "{raw}"),
            },
        }
    }
}

/// Collision-free identifier of a connection, derived from a normalized
/// [`Locator`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "rtsp" | "rtsps" => Some(554),
        "rtmp" => Some(1935),
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

fn normalize_url(input: &str) -> Result<String, LocatorError> {
    let mut url = url::Url::parse(input).map_err(|source| LocatorError::InvalidUrl {
        input: input.to_string(),
        source,
    })?;

    // Hosts of non-special schemes (rtsp, rtmp) keep their case in the
    // WHATWG model.
    if let Some(host) = url.host_str().map(str::to_ascii_lowercase) {
        let _ = url.set_host(Some(&host));
    }
    if url.port().is_some() && url.port() == default_port(url.scheme()) {
        let _ = url.set_port(None);
    }

    let bare_root = url.path() == "/" && url.query().is_none() && url.fragment().is_none();
    let mut normalized = url.to_string();
    if bare_root && normalized.ends_with('/') {
        normalized.pop();
    }
    Ok(normalized)
}
