//! Page sources addressed by a `{page}` template.
//!
//! The run's target identifier is a template such as
//! `https://example.com/book/page/{page}.pdf` or `./pages/p-{page:03}.pdf`.
//! [`TemplateSource`] expands it for the requested index, then:
//!
//! - **capture** fetches (HTTP) or reads (filesystem) that page and checks the
//!   PDF magic bytes, so a login page or an error document is rejected here
//!   rather than surfacing later as an unparseable artifact;
//! - **advance** checks the *next* page: HTTP 2xx or an existing file means
//!   more pages follow, HTTP 404/410 or a missing file is the end.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tracing::{debug, info};

use super::{Advance, CaptureAdapter, NavigationAdapter, PageTarget};
use crate::error::AdapterError;

static PAGE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{page(?::(\d{1,2}))?\}").expect("static regex"));

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Expand every `{page}` / `{page:N}` placeholder in `template`.
///
/// `{page:N}` zero-pads the index to `N` digits.
pub fn expand_template(template: &str, index: u32) -> Result<String, AdapterError> {
    if !PAGE_PLACEHOLDER.is_match(template) {
        return Err(AdapterError::InvalidTemplate {
            template: template.to_string(),
            reason: "no {page} placeholder".into(),
        });
    }

    let expanded = PAGE_PLACEHOLDER.replace_all(template, |caps: &regex::Captures| {
        match caps.get(1).and_then(|w| w.as_str().parse::<usize>().ok()) {
            Some(width) => format!("{index:0width$}"),
            None => index.to_string(),
        }
    });
    Ok(expanded.into_owned())
}

/// Capture and navigation over a page template.
#[derive(Debug, Clone)]
pub struct TemplateSource {
    client: reqwest::Client,
}

impl TemplateSource {
    /// `timeout_secs` bounds each HTTP request; file templates ignore it.
    pub fn new(timeout_secs: u64) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("pagestitch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AdapterError::Other(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, AdapterError> {
        let unavailable = |reason: String| AdapterError::Unavailable {
            resource: url.to_string(),
            reason,
        };

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                unavailable("request timed out".into())
            } else {
                unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, AdapterError> {
        tokio::fs::read(path).await.map_err(|e| AdapterError::Io {
            resource: path.to_string(),
            source: e,
        })
    }

    async fn url_exists(&self, url: &str) -> Result<bool, AdapterError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| AdapterError::Unavailable {
                resource: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            Ok(false)
        } else {
            Err(AdapterError::Unavailable {
                resource: url.to_string(),
                reason: format!("HTTP {status}"),
            })
        }
    }
}

#[async_trait]
impl CaptureAdapter for TemplateSource {
    async fn capture(&self, page: &PageTarget) -> Result<Vec<u8>, AdapterError> {
        let location = expand_template(&page.target, page.index)?;
        let bytes = if is_url(&location) {
            info!("Fetching page {} from {}", page.index, location);
            self.fetch(&location).await?
        } else {
            debug!("Reading page {} from {}", page.index, location);
            self.read_file(&location).await?
        };

        check_pdf_magic(&location, &bytes)?;
        Ok(bytes)
    }
}

#[async_trait]
impl NavigationAdapter for TemplateSource {
    async fn advance(&self, page: &PageTarget) -> Result<Advance, AdapterError> {
        let next = expand_template(&page.target, page.index + 1)?;
        let has_more = if is_url(&next) {
            self.url_exists(&next).await?
        } else {
            tokio::fs::try_exists(&next)
                .await
                .map_err(|e| AdapterError::Io {
                    resource: next.clone(),
                    source: e,
                })?
        };
        debug!("Page {} → has_more = {}", page.index, has_more);
        Ok(Advance { has_more })
    }
}

/// Reject anything that does not start with `%PDF`.
pub fn check_pdf_magic(resource: &str, bytes: &[u8]) -> Result<(), AdapterError> {
    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        return Err(AdapterError::NotAPdf {
            resource: resource.to_string(),
            magic: bytes.iter().take(4).copied().collect(),
        });
    }
    Ok(())
}
