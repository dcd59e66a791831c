use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{self, HeaderMap};
use reqwest::{redirect, Client, StatusCode};
use tracing::{debug, warn};

use super::traits::{ByteStream, ObjectMeta, RemoteSource};
use crate::config::ID_PLACEHOLDER;
use crate::error::{CacheError, CacheResult};

/// The file host answers bot-looking clients with an HTML interstitial.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const GENERIC_CONTENT_TYPE: &str = "application/octet-stream";

/// Cookie set by the host when a large file needs a virus-scan confirmation.
const DOWNLOAD_WARNING_COOKIE: &str = "download_warning";

/// Remote store reached over HTTP through a URL template such as
/// `https://drive.google.com/uc?export=download&id={id}`.
pub struct HttpSource {
    client: Client,
    /// Never follows redirects, so the real download link can be read from `Location`.
    resolver: Client,
    url_template: String,
    fallback_content_type: String,
}

impl HttpSource {
    pub fn new(
        url_template: impl Into<String>,
        fallback_content_type: impl Into<String>,
    ) -> CacheResult<Self> {
        let resolver = Client::builder()
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            client: Client::new(),
            resolver,
            url_template: url_template.into(),
            fallback_content_type: fallback_content_type.into(),
        })
    }

    fn initial_url(&self, id: &str) -> String {
        self.url_template.replace(ID_PLACEHOLDER, id)
    }

    /// Turn the public download URL into the link that actually serves bytes.
    ///
    /// A `download_warning` cookie means the host wants a confirmation code appended;
    /// a `Location` header is the real link; otherwise the initial URL already serves
    /// the content.
    pub async fn resolve_direct_link(&self, id: &str) -> CacheResult<String> {
        let initial = self.initial_url(id);
        let resp = self
            .resolver
            .get(&initial)
            .header(header::USER_AGENT, BROWSER_USER_AGENT)
            .send()
            .await
            .map_err(|e| {
                warn!("link resolution for {} failed: {}", id, e);
                CacheError::from(e)
            })?;

        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(status_error(status, "link resolution"));
        }

        if let Some(code) = confirm_code(resp.headers()) {
            debug!("link resolution id={} needs confirmation", id);
            return Ok(format!("{}&confirm={}", initial, code));
        }

        if let Some(location) = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
        {
            debug!("link resolution id={} redirected", id);
            return Ok(location.to_string());
        }

        Ok(initial)
    }

    fn content_type(&self, headers: &HeaderMap) -> String {
        match headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            Some(ct) if !ct.is_empty() && !ct.starts_with(GENERIC_CONTENT_TYPE) => {
                ct.to_string()
            }
            _ => self.fallback_content_type.clone(),
        }
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn fetch_metadata(&self, id: &str) -> CacheResult<ObjectMeta> {
        let link = self.resolve_direct_link(id).await?;
        let resp = self
            .client
            .get(&link)
            .header(header::USER_AGENT, BROWSER_USER_AGENT)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await?;

        let status = resp.status();
        debug!("metadata probe id={} status={}", id, status.as_u16());
        if !status.is_success() {
            return Err(status_error(status, "metadata probe"));
        }

        // 206 carries `Content-Range: bytes 0-0/<total>`; a 200 means the range was ignored.
        let size = if status == StatusCode::PARTIAL_CONTENT {
            resp.headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit('/').next())
                .and_then(|v| v.parse::<u64>().ok())
        } else {
            resp.content_length()
        }
        .ok_or_else(|| {
            CacheError::RemoteUnavailable(format!("no size reported for {}", id))
        })?;

        Ok(ObjectMeta {
            size,
            content_type: self.content_type(resp.headers()),
        })
    }

    async fn fetch_stream(&self, id: &str, from_byte: u64) -> CacheResult<ByteStream> {
        let link = self.resolve_direct_link(id).await?;
        let mut req = self
            .client
            .get(&link)
            .header(header::USER_AGENT, BROWSER_USER_AGENT);
        if from_byte > 0 {
            req = req.header(header::RANGE, format!("bytes={}-", from_byte));
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, "stream fetch"));
        }
        if from_byte > 0 && status != StatusCode::PARTIAL_CONTENT {
            return Err(CacheError::RemoteUnavailable(format!(
                "range from {} not honoured for {}",
                from_byte, id
            )));
        }

        Ok(resp.bytes_stream().map_err(CacheError::from).boxed())
    }
}

fn status_error(status: StatusCode, what: &str) -> CacheError {
    match status.as_u16() {
        401 | 403 => {
            warn!("{} rejected status={}", what, status.as_u16());
            CacheError::RemoteForbidden(status.as_u16())
        }
        code => {
            warn!("{} failed status={}", what, code);
            CacheError::RemoteUnavailable(format!("{} failed: HTTP {}", what, code))
        }
    }
}

/// Extract the confirmation code from a `download_warning*=<code>` cookie.
fn confirm_code(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|cookie| cookie.split(';'))
        .map(str::trim)
        .find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            if name.starts_with(DOWNLOAD_WARNING_COOKIE) && !value.is_empty() {
                Some(value.to_string())
            } else {
                None
            }
        })
}
