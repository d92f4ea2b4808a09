//! Plugin manifest and reload policy.

use crate::plugin::PluginError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a plugin wants file changes to its entry module handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPolicy {
    /// Reload at the first safe point after the change settles.
    #[default]
    ReloadImmediately,
    /// Reload at the next level transition, never mid-session.
    ReloadOnNextSafePoint,
    /// Ignore file changes; only an operator request reloads the plugin.
    OnlyManualReload,
}

impl fmt::Display for ReloadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReloadPolicy::ReloadImmediately => "reload_immediately",
            ReloadPolicy::ReloadOnNextSafePoint => "reload_on_next_safe_point",
            ReloadPolicy::OnlyManualReload => "only_manual_reload",
        };
        f.write_str(name)
    }
}

/// Descriptive data a plugin declares about itself.
///
/// The manifest id is the plugin's identity inside the host. Operators
/// address plugins by it, and the per-plugin configuration and data
/// directories are named after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub reload_policy: ReloadPolicy,
}

impl PluginManifest {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            author: None,
            website: None,
            reload_policy: ReloadPolicy::default(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }

    pub fn with_reload_policy(mut self, policy: ReloadPolicy) -> Self {
        self.reload_policy = policy;
        self
    }

    /// Rejects manifests the host cannot key a plugin by.
    ///
    /// The id becomes a directory name, so path separators and relative
    /// components are refused.
    pub fn validate(&self) -> Result<(), PluginError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(PluginError::InvalidManifest("id must not be empty".to_string()));
        }
        if id != self.id {
            return Err(PluginError::InvalidManifest(format!(
                "id '{}' has surrounding whitespace",
                self.id
            )));
        }
        if id == "." || id == ".." || id.contains(['/', '\\']) {
            return Err(PluginError::InvalidManifest(format!(
                "id '{}' is not a valid directory name",
                self.id
            )));
        }
        if self.version.trim().is_empty() {
            return Err(PluginError::InvalidManifest(format!(
                "plugin '{}' has an empty version",
                self.id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PluginManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.id, self.version)?;
        if let Some(author) = &self.author {
            write!(f, " by {author}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_builder() {
        let manifest = PluginManifest::new("greeter", "1.2.0")
            .with_author("Plugin Host Team")
            .with_website("https://example.invalid/greeter")
            .with_reload_policy(ReloadPolicy::OnlyManualReload);

        assert_eq!(manifest.id, "greeter");
        assert_eq!(manifest.author.as_deref(), Some("Plugin Host Team"));
        assert_eq!(manifest.reload_policy, ReloadPolicy::OnlyManualReload);
        assert_eq!(manifest.to_string(), "greeter v1.2.0 by Plugin Host Team");
    }

    #[test]
    fn test_default_policy_is_immediate() {
        let manifest = PluginManifest::new("a", "0.1.0");
        assert_eq!(manifest.reload_policy, ReloadPolicy::ReloadImmediately);
    }

    #[test]
    fn test_manifest_validation() {
        assert!(PluginManifest::new("greeter", "1.0.0").validate().is_ok());
        assert!(PluginManifest::new("", "1.0.0").validate().is_err());
        assert!(PluginManifest::new(" greeter", "1.0.0").validate().is_err());
        assert!(PluginManifest::new("../escape", "1.0.0").validate().is_err());
        assert!(PluginManifest::new("..", "1.0.0").validate().is_err());
        assert!(PluginManifest::new("greeter", " ").validate().is_err());
    }

    #[test]
    fn test_manifest_from_toml() {
        let manifest: PluginManifest = toml::from_str(
            r#"
            id = "economy"
            version = "2.0.0"
            reload_policy = "reload_on_next_safe_point"
            "#,
        )
        .unwrap();

        assert_eq!(manifest.id, "economy");
        assert_eq!(manifest.author, None);
        assert_eq!(manifest.reload_policy, ReloadPolicy::ReloadOnNextSafePoint);
    }
}
