//! Environment handed to every spawned child.

use std::collections::BTreeMap;
use std::ffi::OsString;

use tracing::debug;

/// Variables the server forwards to children when it was given values for them.
pub const PASSTHROUGH_VARS: [&str; 3] = ["DELTA_NEW", "DELTA_OLD", "DELTA_KEYWORDS"];

/// Network-mode switches a child must never inherit, or it would start
/// another server or client instead of the application.
pub const STRIPPED_VARS: [&str; 3] = ["DELTA_MODE", "DELTA_SERVER", "DELTA_CLIENT"];

pub const CHILD_MARKER_VAR: &str = "DELTA_SERVER_CHILD";
pub const NOTES_URL_VAR: &str = "DELTA_NOTES_URL";

/// Caller-supplied overrides layered on top of the server's own environment.
#[derive(Debug, Clone, Default)]
pub struct ChildEnv {
    overrides: BTreeMap<String, String>,
}

impl ChildEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allow-listed passthrough value. Names outside
    /// [`PASSTHROUGH_VARS`] and empty values are dropped.
    pub fn passthrough(mut self, key: &str, value: Option<String>) -> Self {
        if !PASSTHROUGH_VARS.contains(&key) {
            return self;
        }
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.overrides.insert(key.to_string(), value);
        }
        self
    }

    pub fn notes_url(mut self, url: impl Into<String>) -> Self {
        self.overrides.insert(NOTES_URL_VAR.to_string(), url.into());
        self
    }

    pub fn overrides(&self) -> &BTreeMap<String, String> {
        &self.overrides
    }

    /// Merge `base` (normally the server's own environment) with the overrides.
    pub fn compose<I>(&self, base: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env: BTreeMap<String, String> = base
            .into_iter()
            .filter(|(k, _)| !STRIPPED_VARS.contains(&k.as_str()))
            .collect();
        env.entry("TERM".to_string())
            .or_insert_with(|| "xterm-256color".to_string());
        env.insert(CHILD_MARKER_VAR.to_string(), "true".to_string());
        for (k, v) in &self.overrides {
            env.insert(k.clone(), v.clone());
        }
        env
    }

    /// Like [`compose`](Self::compose), but for raw OS pairs. Entries that
    /// are not valid UTF-8 are skipped.
    pub fn compose_os<I>(&self, base: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        self.compose(base.into_iter().filter_map(|(k, v)| {
            match (k.into_string(), v.into_string()) {
                (Ok(k), Ok(v)) => Some((k, v)),
                (Ok(k), Err(_)) => {
                    debug!(key = %k, "Skipping non-UTF-8 environment value");
                    None
                }
                (Err(k), _) => {
                    debug!(key = ?k, "Skipping non-UTF-8 environment variable");
                    None
                }
            }
        }))
    }

    pub fn compose_from_process(&self) -> BTreeMap<String, String> {
        self.compose_os(std::env::vars_os())
    }
}
