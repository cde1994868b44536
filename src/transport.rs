//! Outbound transport — per-credential proxy clients and the headers
//! that make a probe look like a legitimate client of its platform.

use anyhow::{Context, Result};
use http::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use std::time::Duration;

use crate::registry::ProxyDescriptor;

/// Build an HTTP client honoring the credential's proxy descriptor, with
/// a bounded request timeout.
pub fn build_transport(proxy: Option<&ProxyDescriptor>, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if let Some(desc) = proxy {
        let url = format!("{}://{}:{}", desc.scheme, desc.host, desc.port);
        let mut proxy = reqwest::Proxy::all(&url)
            .with_context(|| format!("Invalid proxy descriptor '{url}'"))?;
        if let (Some(user), Some(pass)) = (&desc.username, &desc.password) {
            proxy = proxy.basic_auth(user, pass);
        }
        builder = builder.proxy(proxy);
    }

    builder.build().context("Failed to build outbound client")
}

/// Client-fingerprint headers for a provider platform.
pub fn fingerprint_headers(platform: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    match platform {
        "anthropic" => {
            headers.insert(USER_AGENT, HeaderValue::from_static("claude-cli/1.0.0 (external)"));
            headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
            headers.insert("anthropic-beta", HeaderValue::from_static("oauth-2025-04-20"));
        }
        "openai" => {
            headers.insert(USER_AGENT, HeaderValue::from_static("OpenAI/NodeJS/4.0.0"));
        }
        _ => {
            headers.insert(
                USER_AGENT,
                HeaderValue::from_static(concat!("credpulse/", env!("CARGO_PKG_VERSION"))),
            );
        }
    }
    headers
}
