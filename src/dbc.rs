// src/dbc.rs
//
// Message name resolution. The core only needs `id -> name`; the DBC-backed
// implementation parses files with can-dbc and keeps the message names.

use std::collections::HashMap;
use std::path::Path;

use crate::io::EXTENDED_ID_MAX;

/// Resolve a CAN id to a symbolic message name. Empty when unknown.
pub trait NameResolver: Send + Sync {
    fn resolve(&self, id: u32) -> String;
}

impl<F> NameResolver for F
where
    F: Fn(u32) -> String + Send + Sync,
{
    fn resolve(&self, id: u32) -> String {
        self(id)
    }
}

/// Resolver used while no database is loaded
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDatabase;

impl NameResolver for NoDatabase {
    fn resolve(&self, _id: u32) -> String {
        String::new()
    }
}

/// Message names from one or more DBC files.
#[derive(Clone, Debug, Default)]
pub struct DbcNames {
    names: HashMap<u32, String>,
}

impl DbcNames {
    /// Parse DBC text. Later definitions of an id replace earlier ones.
    pub fn parse(&mut self, dbc_content: &str) -> Result<usize, String> {
        let dbc = can_dbc::Dbc::try_from(dbc_content)
            .map_err(|e| format!("Failed to parse DBC file: {:?}", e))?;
        for message in &dbc.messages {
            // Extended ids carry the DBC flag bit in raw()
            let id = message.id.raw() & EXTENDED_ID_MAX;
            self.names.insert(id, message.name.clone());
        }
        Ok(dbc.messages.len())
    }

    pub fn from_str(dbc_content: &str) -> Result<Self, String> {
        let mut names = Self::default();
        names.parse(dbc_content)?;
        Ok(names)
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = read_dbc(path)?;
        let mut names = Self::default();
        let count = names
            .parse(&content)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        tlog!("[dbc] Loaded {} messages from {}", count, path.display());
        Ok(names)
    }

    /// Merge every `*.dbc` file in `dir`, in file name order.
    pub fn from_folder(dir: &Path) -> Result<Self, String> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| format!("Failed to read {}: {}", dir.display(), e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("dbc"))
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(format!("No .dbc files in {}", dir.display()));
        }

        let mut names = Self::default();
        for path in &paths {
            let content = read_dbc(path)?;
            match names.parse(&content) {
                Ok(count) => tlog!("[dbc] Loaded {} messages from {}", count, path.display()),
                Err(e) => tlog!("[dbc] Skipped {}: {}", path.display(), e),
            }
        }
        Ok(names)
    }

    /// Load a single file or a whole folder depending on what `path` is
    pub fn load(path: &Path) -> Result<Self, String> {
        if path.is_dir() {
            Self::from_folder(path)
        } else {
            Self::from_file(path)
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl NameResolver for DbcNames {
    fn resolve(&self, id: u32) -> String {
        self.names.get(&id).cloned().unwrap_or_default()
    }
}

/// DBC files in the wild are often Latin-1; fall back to a lossy decode.
fn read_dbc(path: &Path) -> Result<String, String> {
    let bytes =
        std::fs::read(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}
