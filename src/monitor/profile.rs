//! Per-source timing profiles.
//!
//! Remote image servers differ widely in latency and page size. Each profile
//! gives the monitor its three thresholds plus the retry budget and any
//! request headers a source needs. Profiles are looked up once per session by
//! key; unknown keys get the `default` profile.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

pub const DEFAULT_PROFILE: &str = "default";

/// Timing and request settings for one kind of source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceProfile {
    pub key: String,
    /// Time without any progress before a "still waiting" notice
    pub initial_timeout: Duration,
    /// Period of the stall check; no progress for twice this marks the session stuck
    pub check_interval: Duration,
    /// Hard ceiling for the whole session
    pub max_timeout: Duration,
    /// Per-tile retry budget, never above the configured ceiling; `None`
    /// uses the ceiling
    pub max_retries: Option<u32>,
    /// Extra request headers sent with every request for this source
    pub headers: Vec<(String, String)>,
}

impl SourceProfile {
    pub fn new(key: impl Into<String>, initial: u64, interval: u64, max: u64) -> Self {
        Self {
            key: key.into(),
            initial_timeout: Duration::from_secs(initial),
            check_interval: Duration::from_secs(interval),
            max_timeout: Duration::from_secs(max),
            max_retries: None,
            headers: Vec::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Retries allowed for this profile under `ceiling`.
    pub fn retry_budget(&self, ceiling: u32) -> u32 {
        self.max_retries.map_or(ceiling, |budget| budget.min(ceiling))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl Default for SourceProfile {
    fn default() -> Self {
        SourceProfile::new(DEFAULT_PROFILE, 30, 10, 300).with_max_retries(3)
    }
}

/// Lookup table of source profiles.
#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: HashMap<String, SourceProfile>,
    aliases: HashMap<String, String>,
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileTable {
    /// An empty table; lookups return [`SourceProfile::default`].
    pub fn empty() -> Self {
        Self {
            profiles: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Profiles for the sources this crate is known to work against.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for profile in [
            SourceProfile::default(),
            // container downloads are large; stitching happens after the download
            SourceProfile::new("morgan", 90, 15, 480).with_max_retries(2),
            SourceProfile::new("graz", 180, 30, 900).with_max_retries(5),
            SourceProfile::new("manuscripta", 60, 15, 300),
            SourceProfile::new("verona", 90, 10, 600),
            SourceProfile::new("trinity", 60, 20, 360),
            SourceProfile::new("loc", 60, 20, 360),
            SourceProfile::new("hhu", 60, 15, 300),
            SourceProfile::new("arca", 30, 10, 180),
            SourceProfile::new("internet-culturale", 45, 10, 240),
            SourceProfile::new("bdl", 30, 10, 120)
                .with_header("Referer", "https://www.bdl.servizirl.it/"),
            SourceProfile::new("bne", 30, 10, 180),
            SourceProfile::new("vienna_manuscripta", 45, 15, 240),
            SourceProfile::new("mdc_catalonia", 45, 15, 300),
        ] {
            table.insert(profile);
        }
        table.alias("manuscripta.se", "manuscripta");
        table.alias("nbm", "verona");
        table
    }

    pub fn insert(&mut self, profile: SourceProfile) {
        self.profiles.insert(profile.key.to_ascii_lowercase(), profile);
    }

    pub fn alias(&mut self, alias: &str, key: &str) {
        self.aliases
            .insert(alias.to_ascii_lowercase(), key.to_ascii_lowercase());
    }

    /// Profile for `key` (case-insensitive), falling back to `default`.
    pub fn lookup(&self, key: &str) -> SourceProfile {
        let key = key.to_ascii_lowercase();
        let key = self.aliases.get(&key).unwrap_or(&key);
        self.profiles
            .get(key)
            .or_else(|| self.profiles.get(DEFAULT_PROFILE))
            .cloned()
            .unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}
