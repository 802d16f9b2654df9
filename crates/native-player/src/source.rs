//! Locator classification and byte-source selection.

use std::fs::File;

use symphonia::core::io::MediaSource;

use crate::config::{HttpConfig, HttpStrategy};
use crate::error::{PlayerError, Result};
use crate::http_stream::{self, HttpRangeSource};
use crate::progressive::ProgressiveSource;

/// A freshly opened byte source plus what the origin told us about it.
pub struct OpenedSource {
    pub source: Box<dyn MediaSource>,
    /// Content type reported by a remote origin.
    pub content_type: Option<String>,
}

/// Whether `locator` names a network resource rather than a filesystem path.
pub fn is_remote(locator: &str) -> bool {
    let lower = locator.get(..8).unwrap_or(locator).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Open the byte source appropriate to the locator kind.
///
/// Remote locators use the configured [`HttpStrategy`]; everything else is opened as a file.
pub fn open_source(locator: &str, http: &HttpConfig) -> Result<OpenedSource> {
    if !is_remote(locator) {
        let file = File::open(locator)
            .map_err(|e| PlayerError::Open(format!("open {locator}: {e}")))?;
        return Ok(OpenedSource {
            source: Box::new(file),
            content_type: None,
        });
    }

    match http.strategy {
        HttpStrategy::Range => {
            let source = HttpRangeSource::open(locator, http)?;
            let content_type = source.content_type().map(str::to_string);
            tracing::info!(
                url = %locator,
                len = ?source.len(),
                content_type = content_type.as_deref().unwrap_or(""),
                "range source opened"
            );
            Ok(OpenedSource {
                source: Box::new(source),
                content_type,
            })
        }
        HttpStrategy::Progressive => {
            let (body, content_type) = http_stream::open_body(locator, http)?;
            let source = ProgressiveSource::open(body, http.chunk_size)
                .map_err(|e| PlayerError::Open(format!("spawn buffer for {locator}: {e}")))?;
            tracing::info!(url = %locator, "progressive source opened");
            Ok(OpenedSource {
                source: Box::new(source),
                content_type,
            })
        }
    }
}
