//! Reusable HTTP clients keyed by credential, endpoint and timeout.

use crate::error::Result;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A ready-to-use client bound to one endpoint and credential.
///
/// Owned by the [`ClientPool`]; work items hold an `Arc` for the duration of
/// an attempt and never close it.
#[derive(Clone)]
pub struct ClientHandle {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl ClientHandle {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: normalize_base_url(&base_url.into()),
            api_key: api_key.into(),
            timeout,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn redact(key: &str) -> String {
    if key.chars().count() > 6 {
        format!("{}***", key.chars().take(6).collect::<String>())
    } else {
        "***".to_string()
    }
}

/// Trim trailing slashes and a pasted `/chat/completions` suffix.
///
/// Backends append their own endpoint path.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    trimmed
        .strip_suffix("/chat/completions")
        .unwrap_or(trimmed)
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    credential_prefix: String,
    base_url: String,
    timeout: Duration,
}

impl PoolKey {
    fn new(api_key: &str, base_url: &str, timeout: Duration) -> Self {
        let credential_prefix = if api_key.is_empty() {
            "none".to_string()
        } else {
            api_key.chars().take(10).collect()
        };
        Self {
            credential_prefix,
            base_url: normalize_base_url(base_url),
            timeout,
        }
    }
}

/// Lazily built, shared [`ClientHandle`]s.
///
/// Lookup and creation happen under one lock, so concurrent first use of a
/// key never builds two handles.
#[derive(Debug, Default)]
pub struct ClientPool {
    handles: Mutex<HashMap<PoolKey, Arc<ClientHandle>>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the handle for `(api_key, base_url, timeout)`, building it on first use.
    ///
    /// Handles are keyed by a credential prefix. A pooled handle is reused
    /// only when its full credential matches; otherwise it is replaced.
    pub fn get_client(
        &self,
        api_key: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Arc<ClientHandle>> {
        let key = PoolKey::new(api_key, base_url, timeout);
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match handles.get(&key) {
            Some(handle) if handle.api_key() == api_key => return Ok(Arc::clone(handle)),
            Some(_) => tracing::debug!(
                base_url = %key.base_url,
                "credential changed, replacing API client"
            ),
            None => {}
        }

        // The timeout bounds connecting and each body read, not the whole
        // response, so long generations that keep streaming are not cut off.
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        let handle = Arc::new(ClientHandle::new(client, base_url, api_key, timeout));
        tracing::debug!(base_url = %handle.base_url(), ?timeout, "created API client");
        handles.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all handles. In-flight users keep theirs; new lookups rebuild.
    pub fn clear(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.clear();
        }
    }
}
