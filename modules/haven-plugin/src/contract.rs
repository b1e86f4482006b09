use std::fmt;
use std::ops::BitOr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use haven_common::{ArchiveOutcome, MediaSource, Metadata};

pub type Result<T> = std::result::Result<T, PluginError>;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin does not support this operation: {0}")]
    Unsupported(String),

    #[error("Plugin initialization failed: {0}")]
    Initialization(String),

    #[error("Plugin operation failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A single plugin capability. Backed by one bit in [`CapabilitySet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Discover = 1 << 0,
    Archive = 1 << 1,
    Stream = 1 << 2,
    Search = 1 << 3,
    Metadata = 1 << 4,
    HealthCheck = 1 << 5,
}

impl Capability {
    const ALL: [Capability; 6] = [
        Capability::Discover,
        Capability::Archive,
        Capability::Stream,
        Capability::Search,
        Capability::Metadata,
        Capability::HealthCheck,
    ];
}

/// A set of capabilities; membership tests are single bit-tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Capability>", into = "Vec<Capability>")]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability as u8)
    }

    pub const fn contains(self, capability: Capability) -> bool {
        self.0 & capability as u8 != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl BitOr for Capability {
    type Output = CapabilitySet;

    fn bitor(self, rhs: Capability) -> CapabilitySet {
        CapabilitySet::empty().with(self).with(rhs)
    }
}

impl BitOr<Capability> for CapabilitySet {
    type Output = CapabilitySet;

    fn bitor(self, rhs: Capability) -> CapabilitySet {
        self.with(rhs)
    }
}

impl From<Vec<Capability>> for CapabilitySet {
    fn from(capabilities: Vec<Capability>) -> Self {
        capabilities
            .into_iter()
            .fold(CapabilitySet::empty(), CapabilitySet::with)
    }
}

impl From<CapabilitySet> for Vec<Capability> {
    fn from(set: CapabilitySet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|c| format!("{c:?}")).collect();
        write!(f, "{}", names.join("+"))
    }
}

/// Static description of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Unique plugin identifier.
    pub name: String,
    pub display_name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Media types this plugin handles (youtube, podcast, ...).
    #[serde(default)]
    pub media_types: Vec<String>,
    pub capabilities: CapabilitySet,
    /// Optional JSON schema describing the plugin's configuration.
    #[serde(default)]
    pub config_schema: Option<serde_json::Value>,
}

impl PluginInfo {
    pub fn new(name: impl Into<String>, capabilities: CapabilitySet) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            version: "1.0.0".to_string(),
            description: String::new(),
            media_types: Vec::new(),
            capabilities,
            config_schema: None,
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }
}

/// A media source connector.
///
/// `discover` is required iff the `Discover` capability is declared, and
/// `archive` iff `Archive` is; the defaults report the operation as
/// unsupported. `health_check` must not fail — plugins report unhealth by
/// returning false.
#[async_trait]
pub trait ArchiverPlugin: Send + Sync {
    fn info(&self) -> PluginInfo;

    /// Idempotent setup. Called once before first use; a failure makes the
    /// plugin unavailable.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Best-effort teardown; persists any in-plugin ephemeral state.
    async fn shutdown(&self) {}

    /// Merge new values into the plugin's configuration.
    async fn configure(&self, _config: Metadata) {}

    /// Cheap liveness probe.
    async fn health_check(&self) -> bool {
        true
    }

    /// Produce the current finite list of candidate sources, deduplicated
    /// within the call. May be empty.
    async fn discover(&self) -> Result<Vec<MediaSource>> {
        Err(PluginError::Unsupported(format!(
            "{} does not implement discovery",
            self.info().name
        )))
    }

    /// Download one source to a local file. On success the outcome's
    /// `output_path` is a readable regular file of the stated size.
    async fn archive(&self, source: &MediaSource) -> Result<ArchiveOutcome> {
        Err(PluginError::Unsupported(format!(
            "{} cannot archive {}",
            self.info().name,
            source.source_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_set_bit_tests() {
        let set = Capability::Discover | Capability::Archive;
        assert!(set.contains(Capability::Discover));
        assert!(set.contains(Capability::Archive));
        assert!(!set.contains(Capability::Stream));

        let widened = set | Capability::HealthCheck;
        assert!(widened.contains(Capability::HealthCheck));
        assert_eq!(widened.iter().count(), 3);
    }

    #[test]
    fn capability_set_serializes_as_list() {
        let set = Capability::Discover | Capability::Archive;
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["discover","archive"]"#);

        let parsed: CapabilitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn plugin_info_defaults_display_name() {
        let info = PluginInfo::new("DemoPlugin", CapabilitySet::empty());
        assert_eq!(info.display_name, "DemoPlugin");
        assert!(!info.has_capability(Capability::Discover));
    }
}
