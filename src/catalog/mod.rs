/*-
 * ========================LICENSE_START=================================
 * Hearth Orchestrator
 * %%
 * Copyright (C) 2023 - 2026 Hearth Project Developers
 * %%
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
 * THE SOFTWARE.
 * =========================LICENSE_END==================================
 */

pub mod graph;

use crate::models::{AppDefinition, AppName};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Read-through cache of the app definitions on disk. One TOML file per app,
/// anywhere below the catalog directory; `refresh` rereads the tree.
pub struct CatalogCache {
    dir: PathBuf,
    definitions: RwLock<BTreeMap<AppName, AppDefinition>>,
}

impl CatalogCache {
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let cache = Self {
            dir: dir.into(),
            definitions: RwLock::new(BTreeMap::new()),
        };
        cache.refresh()?;
        Ok(cache)
    }

    /// Rereads the directory tree. A malformed definition file is logged and
    /// skipped so that one broken file cannot take every app offline.
    pub fn refresh(&self) -> Result<(), CatalogError> {
        let mut files = Vec::new();
        collect_toml_files(&self.dir, &mut files)?;
        files.sort();

        let mut definitions = BTreeMap::new();
        for path in files {
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    log::warn!("Skipping unreadable catalog file {}: {err}", path.display());
                    continue;
                }
            };
            match toml::from_str::<AppDefinition>(&raw) {
                Ok(definition) => {
                    if let Some(previous) =
                        definitions.insert(definition.name.clone(), definition)
                    {
                        log::warn!(
                            "Duplicate catalog entry for {}, keeping the later file",
                            previous.name
                        );
                    }
                }
                Err(err) => {
                    log::warn!("Skipping malformed catalog file {}: {err}", path.display());
                }
            }
        }

        log::debug!("Catalog loaded with {} app definitions", definitions.len());
        *self.definitions.write().expect("catalog lock poisoned") = definitions;
        Ok(())
    }

    pub fn get(&self, name: &AppName) -> Option<AppDefinition> {
        self.definitions
            .read()
            .expect("catalog lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn get_all(&self) -> Vec<AppDefinition> {
        self.definitions
            .read()
            .expect("catalog lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_user_apps(&self) -> Vec<AppDefinition> {
        self.definitions
            .read()
            .expect("catalog lock poisoned")
            .values()
            .filter(|definition| !definition.system)
            .cloned()
            .collect()
    }

    pub fn is_system_app(&self, name: &AppName) -> bool {
        self.definitions
            .read()
            .expect("catalog lock poisoned")
            .get(name)
            .map(|definition| definition.system)
            .unwrap_or(false)
    }
}

fn collect_toml_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), CatalogError> {
    let entries = std::fs::read_dir(dir).map_err(|err| CatalogError::UnreadableDirectory {
        dir: dir.to_path_buf(),
        err,
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_toml_files(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Cannot read catalog directory {dir}: {err}")]
    UnreadableDirectory {
        dir: PathBuf,
        #[source]
        err: std::io::Error,
    },
}
