//! Server description document: fetch and capability extraction.
//!
//! SAT>IP servers publish a UPnP device description over HTTP. The tool
//! takes the server host from the descriptor URL itself and reads the
//! `satip:X_SATIPCAP` capability string, which lists tuner counts per
//! delivery system, e.g. `DVBS2-2,DVBT-2`. The elements are pulled out
//! with a small text scan rather than a full XML parser. A descriptor
//! without usable capabilities is not fatal here; the tuner ceiling then
//! has to come from the `--max-tuners` override.

use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The descriptor URL could not be parsed.
    #[error("invalid server descriptor URL: {0}")]
    InvalidUrl(String),

    /// The URL carries no host part.
    #[error("server descriptor URL has no host: {0}")]
    MissingHost(String),

    /// The HTTP fetch failed.
    #[error("failed to fetch server descriptor: {0}")]
    Http(#[from] reqwest::Error),
}

/// What the tool learns from the server description.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    /// Host part of the descriptor URL; the RTSP control connection goes
    /// to the same host.
    pub host: String,
    /// UPnP friendly name, when present.
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
    /// Per-delivery-system tuner counts, in document order. Empty when
    /// the descriptor carries no parseable `X_SATIPCAP` element.
    pub capabilities: Vec<(String, usize)>,
}

impl ServerDescriptor {
    /// Number of satellite (DVB-S/S2) tuners the server advertises.
    pub fn satellite_tuners(&self) -> usize {
        self.capabilities
            .iter()
            .filter(|(system, _)| system.starts_with("DVBS"))
            .map(|(_, count)| count)
            .sum()
    }
}

/// Fetch and parse the description document at `url`.
pub async fn fetch(url: &str, timeout: Duration) -> Result<ServerDescriptor, DescriptorError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|_| DescriptorError::InvalidUrl(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| DescriptorError::MissingHost(url.to_string()))?
        .to_string();

    debug!("Fetching server descriptor from {}", url);
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let body = client
        .get(parsed)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let descriptor = parse_description(&host, &body);
    info!(
        "Server {} ({}, {} {}) advertises {} satellite tuners",
        descriptor.host,
        descriptor.friendly_name.as_deref().unwrap_or("unnamed"),
        descriptor.manufacturer.as_deref().unwrap_or("unknown"),
        descriptor.model_name.as_deref().unwrap_or("model"),
        descriptor.satellite_tuners()
    );
    Ok(descriptor)
}

/// Parse a description document body.
fn parse_description(host: &str, body: &str) -> ServerDescriptor {
    let capabilities = match element_text(body, "satip:X_SATIPCAP") {
        Some(text) => parse_capabilities(text),
        None => {
            warn!("Server descriptor carries no X_SATIPCAP element");
            Vec::new()
        }
    };

    ServerDescriptor {
        host: host.to_string(),
        friendly_name: element_text(body, "friendlyName").map(str::to_string),
        manufacturer: element_text(body, "manufacturer").map(str::to_string),
        model_name: element_text(body, "modelName").map(str::to_string),
        capabilities,
    }
}

/// `DVBS2-2,DVBT-2` into `[("DVBS2", 2), ("DVBT", 2)]`. Segments that do
/// not match the `SYSTEM-count` form are skipped.
fn parse_capabilities(text: &str) -> Vec<(String, usize)> {
    text.split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .filter_map(|segment| {
            let parsed = segment.rsplit_once('-').and_then(|(system, count)| {
                let count = count.parse().ok()?;
                (!system.is_empty()).then(|| (system.to_string(), count))
            });
            if parsed.is_none() {
                warn!("Skipping unparseable capability segment {:?}", segment);
            }
            parsed
        })
        .collect()
}

/// Text content of the first `<name ...>text</...>` element, or `None`
/// when the element is absent or self-closing.
fn element_text<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}", name);
    let mut search = 0;
    while let Some(found) = xml[search..].find(&open) {
        let after_name = search + found + open.len();
        let rest = &xml[after_name..];
        match rest.chars().next() {
            Some('>') => {
                let content = &rest[1..];
                return content.find("</").map(|end| content[..end].trim());
            }
            Some(c) if c.is_whitespace() => {
                let tag_end = rest.find('>')?;
                if rest[..tag_end].trim_end().ends_with('/') {
                    return None;
                }
                let content = &rest[tag_end + 1..];
                return content.find("</").map(|end| content[..end].trim());
            }
            // Prefix of a longer element name; keep scanning.
            _ => search = after_name,
        }
    }
    None
}
