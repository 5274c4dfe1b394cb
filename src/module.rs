//! Modules: the set of classes making up one application or replacement library, and the codec
//! that moves them between memory and an apktool-style smali directory.

use crate::error::RmPermError;
use crate::types::SmaliClass;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// API level the rewritten code targets unless told otherwise.
pub const DEFAULT_API_LEVEL: u32 = 19;

/// An in-memory module. Classes are shared, so an untouched class can move from an input module
/// to an output module without being copied.
#[derive(Debug, Clone)]
pub struct Module {
    pub classes: Vec<Rc<SmaliClass>>,
    pub api_level: u32,
}

impl Default for Module {
    fn default() -> Self {
        Module {
            classes: vec![],
            api_level: DEFAULT_API_LEVEL,
        }
    }
}

impl Module {
    pub fn from_classes(classes: Vec<SmaliClass>) -> Module {
        Module {
            classes: classes.into_iter().map(Rc::new).collect(),
            ..Module::default()
        }
    }

    pub fn find_class(&self, jni_name: &str) -> Option<&Rc<SmaliClass>> {
        self.classes.iter().find(|c| c.name.as_jni_type() == jni_name)
    }

    /// Fails if two classes share a name.
    pub fn check_unique_names(&self) -> Result<(), RmPermError> {
        let mut seen = HashSet::new();
        for c in &self.classes {
            if !seen.insert(&c.name) {
                fail!("Class {} is defined more than once", c.name.as_jni_type());
            }
        }
        Ok(())
    }
}

/// Reads and writes whole modules.
pub trait ModuleCodec {
    fn parse(&self, path: &Path) -> Result<Module, RmPermError>;
    fn write(&self, path: &Path, module: &Module) -> Result<(), RmPermError>;
}

/// Codec for a directory tree of `.smali` files, one class per file, as produced by
/// `apktool decode`.
#[derive(Debug, Clone, Copy)]
pub struct SmaliDirectoryCodec {
    pub api_level: u32,
}

impl Default for SmaliDirectoryCodec {
    fn default() -> Self {
        SmaliDirectoryCodec {
            api_level: DEFAULT_API_LEVEL,
        }
    }
}

/// Recurses a base path, typically a 'smali' folder from apktool, returning every `.smali` file
/// in a stable order.
pub fn find_smali_files(dir: &Path) -> Result<Vec<PathBuf>, RmPermError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| err!("Error reading directory {}: {}", dir.display(), e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| err!("Error reading directory {}: {}", dir.display(), e))?;
    entries.sort_by_key(|e| e.file_name());

    let mut results = vec![];
    for entry in entries {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| err!("Error reading {}: {}", path.display(), e))?;
        if file_type.is_dir() {
            results.extend(find_smali_files(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "smali") {
            results.push(path);
        }
    }

    Ok(results)
}

impl ModuleCodec for SmaliDirectoryCodec {
    fn parse(&self, path: &Path) -> Result<Module, RmPermError> {
        if !path.is_dir() {
            fail!("Module path {} is not a directory", path.display());
        }
        let mut classes = vec![];
        for file in find_smali_files(path)? {
            debug!("Reading {}", file.display());
            let class = SmaliClass::read_from_file(&file).map_err(|e| err!(e, context: "{}", path.display()))?;
            classes.push(Rc::new(class));
        }
        info!("{} smali classes loaded from {}", classes.len(), path.display());
        Ok(Module {
            classes,
            api_level: self.api_level,
        })
    }

    /// Writes into a staging directory next to `path` and moves it into place once every class
    /// is written. `path` must be absent or empty.
    fn write(&self, path: &Path, module: &Module) -> Result<(), RmPermError> {
        module.check_unique_names()?;
        if path.exists() {
            let mut entries = fs::read_dir(path).map_err(|e| err!("Error reading directory {}: {}", path.display(), e))?;
            if entries.next().is_some() {
                fail!("Output directory {} is not empty", path.display());
            }
        }

        let staging = staging_path(path)?;
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| err!("Error removing {}: {}", staging.display(), e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| err!("Error creating directory {}: {}", staging.display(), e))?;
        if let Err(e) = write_classes(&staging, module) {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!("Could not remove {}: {}", staging.display(), cleanup);
            }
            return Err(e);
        }

        if path.exists() {
            fs::remove_dir(path).map_err(|e| err!("Error removing {}: {}", path.display(), e))?;
        }
        fs::rename(&staging, path)
            .map_err(|e| err!("Error moving {} to {}: {}", staging.display(), path.display(), e))?;
        info!("{} smali classes written to {}", module.classes.len(), path.display());
        Ok(())
    }
}

fn staging_path(path: &Path) -> Result<PathBuf, RmPermError> {
    match path.file_name() {
        Some(name) => Ok(path.with_file_name(format!(".{}.partial", name.to_string_lossy()))),
        None => Err(err!("Output path {} has no directory name", path.display())),
    }
}

fn write_classes(dir: &Path, module: &Module) -> Result<(), RmPermError> {
    for class in &module.classes {
        let file = class.write_to_directory(dir)?;
        debug!("Wrote {}", file.display());
    }
    Ok(())
}
