//! Query packs loaded from a directory of JSON files.

use std::fs;
use std::path::{Path, PathBuf};

use dbsampler_core::{PackError, PackSource, QueryPack};
use tracing::debug;

/// Reads every `*.json` file in a directory as one [`QueryPack`].
///
/// Files are read in name order. A pack without a `source` takes the file
/// stem, so `pg-core.json` yields collector references like `pg-core:top`.
pub struct JsonDirSource {
    dir: PathBuf,
}

impl JsonDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pack_files(&self) -> Result<Vec<PathBuf>, PackError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| PackError::Source(format!("{}: {}", self.dir.display(), e)))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| PackError::Source(format!("{}: {}", self.dir.display(), e)))?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn read_pack(path: &Path) -> Result<QueryPack, PackError> {
    let content = fs::read_to_string(path)
        .map_err(|e| PackError::Source(format!("{}: {}", path.display(), e)))?;
    let mut pack: QueryPack = serde_json::from_str(&content)
        .map_err(|e| PackError::Source(format!("{}: {}", path.display(), e)))?;

    if pack.source_identifier.trim().is_empty()
        && let Some(stem) = path.file_stem()
    {
        pack.source_identifier = stem.to_string_lossy().into_owned();
    }
    Ok(pack)
}

impl PackSource for JsonDirSource {
    fn load(&self) -> Result<Vec<QueryPack>, PackError> {
        let mut packs = Vec::new();
        for path in self.pack_files()? {
            let pack = read_pack(&path)?;
            debug!(
                file = %path.display(),
                source = %pack.source_identifier,
                collectors = pack.collectors.len(),
                "pack loaded"
            );
            packs.push(pack);
        }
        Ok(packs)
    }
}
