use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use mcpm_core::{ProfileMetadata, ServerConfig};
use tracing::debug;

use crate::paths;
use crate::CatalogError;

/// The persisted set of known MCP servers and profile metadata. Servers
/// and profiles are kept in `BTreeMap`s so iteration order is always
/// lexicographic by name — this is what gives the registry its
/// deterministic, first-registered-wins collision behavior.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    servers: BTreeMap<String, ServerConfig>,
    profiles: BTreeMap<String, ProfileMetadata>,
    servers_path: Option<PathBuf>,
    profiles_path: Option<PathBuf>,
}

impl Catalog {
    /// Loads the catalog from the default config directory, creating an
    /// empty in-memory catalog (not yet persisted) if neither file exists.
    pub fn load() -> Result<Self, CatalogError> {
        Self::load_from(paths::servers_path()?, paths::profiles_path()?)
    }

    pub fn load_from(
        servers_path: impl Into<PathBuf>,
        profiles_path: impl Into<PathBuf>,
    ) -> Result<Self, CatalogError> {
        let servers_path = servers_path.into();
        let profiles_path = profiles_path.into();

        let servers = read_json_or_default(&servers_path)?;
        let profiles = read_json_or_default(&profiles_path)?;

        Ok(Self {
            servers,
            profiles,
            servers_path: Some(servers_path),
            profiles_path: Some(profiles_path),
        })
    }

    /// Persists both files atomically (write-to-temp-then-rename).
    /// Re-saving unchanged state produces byte-identical output (testable
    /// property: idempotent writes), since `BTreeMap` iteration order is
    /// canonical.
    pub fn save(&self) -> Result<(), CatalogError> {
        if let Some(path) = &self.servers_path {
            write_json_atomic(path, &self.servers)?;
        }
        if let Some(path) = &self.profiles_path {
            write_json_atomic(path, &self.profiles)?;
        }
        Ok(())
    }

    pub fn add_server(&mut self, server: ServerConfig) -> Result<(), CatalogError> {
        ServerConfig::validate_name(server.name())?;
        let name = server.name().to_string();
        if self.servers.contains_key(&name) {
            return Err(CatalogError::ServerExists(name));
        }
        debug!(server = %name, "catalog: adding server");
        self.servers.insert(name, server);
        Ok(())
    }

    pub fn remove_server(&mut self, name: &str) -> Result<ServerConfig, CatalogError> {
        self.servers
            .remove(name)
            .ok_or_else(|| CatalogError::ServerNotFound(name.to_string()))
    }

    pub fn get_server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// All servers in lexicographic order by name.
    pub fn list_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.values()
    }

    pub fn list_servers_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a ServerConfig> {
        self.servers.values().filter(move |s| s.has_profile_tag(tag))
    }

    pub fn add_profile_tag(&mut self, server_name: &str, tag: &str) -> Result<(), CatalogError> {
        let server = self
            .servers
            .get_mut(server_name)
            .ok_or_else(|| CatalogError::ServerNotFound(server_name.to_string()))?;
        server.profile_tags_mut().insert(tag.to_string());
        Ok(())
    }

    pub fn remove_profile_tag(&mut self, server_name: &str, tag: &str) -> Result<(), CatalogError> {
        let server = self
            .servers
            .get_mut(server_name)
            .ok_or_else(|| CatalogError::ServerNotFound(server_name.to_string()))?;
        server.profile_tags_mut().remove(tag);
        Ok(())
    }

    /// Profiles are virtual: any tag attached to at least one server is a
    /// profile, whether or not it has its own metadata entry.
    pub fn virtual_profiles(&self) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = self
            .servers
            .values()
            .flat_map(|s| s.profile_tags().iter().cloned())
            .collect();
        tags.extend(self.profiles.keys().cloned());
        tags
    }

    pub fn upsert_profile_metadata(&mut self, metadata: ProfileMetadata) {
        self.profiles.insert(metadata.name.clone(), metadata);
    }

    pub fn get_profile_metadata(&self, name: &str) -> Option<&ProfileMetadata> {
        self.profiles.get(name)
    }

    pub fn get_profile_metadata_mut(&mut self, name: &str) -> Option<&mut ProfileMetadata> {
        self.profiles.get_mut(name)
    }

    pub fn delete_profile_metadata(&mut self, name: &str) -> Option<ProfileMetadata> {
        self.profiles.remove(name)
    }

    pub fn list_profile_metadata(&self) -> impl Iterator<Item = &ProfileMetadata> {
        self.profiles.values()
    }

    /// A profile's complete resolved view: its member servers (in
    /// lexicographic order) plus its metadata, if any was ever set.
    pub fn complete_profile(&self, name: &str) -> CompleteProfile<'_> {
        CompleteProfile {
            name: name.to_string(),
            servers: self.list_servers_by_tag(name).collect(),
            metadata: self.profiles.get(name),
        }
    }
}

pub struct CompleteProfile<'a> {
    pub name: String,
    pub servers: Vec<&'a ServerConfig>,
    pub metadata: Option<&'a ProfileMetadata>,
}

fn read_json_or_default<T>(path: &Path) -> Result<T, CatalogError>
where
    T: Default + serde::de::DeserializeOwned,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| CatalogError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), CatalogError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| CatalogError::Write {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let content = serde_json::to_string_pretty(value).map_err(|source| CatalogError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content.as_bytes()).map_err(|source| CatalogError::Write {
        path: tmp_path.display().to_string(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| CatalogError::Write {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpm_core::StdioServer;
    use tempfile::TempDir;

    fn stdio(name: &str) -> ServerConfig {
        ServerConfig::Stdio(StdioServer {
            name: name.to_string(),
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "some-server".to_string()],
            env: Default::default(),
            profile_tags: Default::default(),
        })
    }

    #[test]
    fn add_then_get_then_remove() {
        let mut catalog = Catalog::default();
        catalog.add_server(stdio("alpha")).unwrap();
        assert!(catalog.get_server("alpha").is_some());
        assert!(matches!(
            catalog.add_server(stdio("alpha")),
            Err(CatalogError::ServerExists(_))
        ));
        let removed = catalog.remove_server("alpha").unwrap();
        assert_eq!(removed.name(), "alpha");
        assert!(catalog.get_server("alpha").is_none());
    }

    #[test]
    fn servers_iterate_in_lexicographic_order() {
        let mut catalog = Catalog::default();
        catalog.add_server(stdio("zeta")).unwrap();
        catalog.add_server(stdio("alpha")).unwrap();
        catalog.add_server(stdio("mid")).unwrap();
        let names: Vec<_> = catalog.list_servers().map(|s| s.name()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn profile_tags_round_trip_symmetrically() {
        let mut catalog = Catalog::default();
        catalog.add_server(stdio("alpha")).unwrap();
        catalog.add_profile_tag("alpha", "dev").unwrap();
        assert!(catalog.get_server("alpha").unwrap().has_profile_tag("dev"));
        assert_eq!(catalog.list_servers_by_tag("dev").count(), 1);

        catalog.remove_profile_tag("alpha", "dev").unwrap();
        assert!(!catalog.get_server("alpha").unwrap().has_profile_tag("dev"));
        assert_eq!(catalog.list_servers_by_tag("dev").count(), 0);
    }

    #[test]
    fn save_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut catalog =
            Catalog::load_from(dir.path().join("servers.json"), dir.path().join("profiles.json"))
                .unwrap();
        catalog.add_server(stdio("alpha")).unwrap();
        catalog.add_profile_tag("alpha", "dev").unwrap();
        catalog.save().unwrap();
        let first = fs::read_to_string(dir.path().join("servers.json")).unwrap();
        catalog.save().unwrap();
        let second = fs::read_to_string(dir.path().join("servers.json")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn virtual_profiles_include_metadata_only_profiles() {
        let mut catalog = Catalog::default();
        catalog.add_server(stdio("alpha")).unwrap();
        catalog.add_profile_tag("alpha", "dev").unwrap();
        catalog.upsert_profile_metadata(ProfileMetadata::new("empty-profile"));
        let profiles = catalog.virtual_profiles();
        assert!(profiles.contains("dev"));
        assert!(profiles.contains("empty-profile"));
    }

    #[test]
    fn reload_from_disk_preserves_state() {
        let dir = TempDir::new().unwrap();
        let servers_path = dir.path().join("servers.json");
        let profiles_path = dir.path().join("profiles.json");

        let mut catalog = Catalog::load_from(&servers_path, &profiles_path).unwrap();
        catalog.add_server(stdio("alpha")).unwrap();
        catalog.add_profile_tag("alpha", "dev").unwrap();
        catalog.save().unwrap();

        let reloaded = Catalog::load_from(&servers_path, &profiles_path).unwrap();
        assert!(reloaded.get_server("alpha").unwrap().has_profile_tag("dev"));
    }
}
