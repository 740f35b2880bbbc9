//! Local directory source
//!
//! Every file with the configured extension is one document. The file's
//! modification time is its datestamp; files not newer than the stored
//! cursor are counted as seen but never read. Symbolic links are followed.

use crate::config::DirectoryConfig;
use crate::document::DocumentRecord;
use crate::harvester::{HarvestSession, Harvester};
use crate::HarvestError;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub struct DirectoryHarvester {
    source_id: String,
    config: DirectoryConfig,
}

/// One candidate file
#[derive(Debug)]
struct Entry {
    path: PathBuf,
    identifier: String,
    modified: Option<DateTime<Utc>>,
}

impl DirectoryHarvester {
    pub fn new(source_id: &str, config: DirectoryConfig) -> Self {
        Self {
            source_id: source_id.to_string(),
            config,
        }
    }

    /// Lists matching files in a stable order
    fn collect(&self) -> Result<Vec<Entry>, HarvestError> {
        let root = PathBuf::from(&self.config.path);
        let max_depth = if self.config.recursive { usize::MAX } else { 1 };

        let mut entries = Vec::new();
        for entry in WalkDir::new(&root)
            .follow_links(true)
            .max_depth(max_depth)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| walk_error(&root, e))?;
            if !entry.file_type().is_file() || !self.matches_extension(entry.path()) {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| walk_error(&root, e))?;
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            entries.push(Entry {
                identifier: self.identifier_for(&root, entry.path()),
                path: entry.into_path(),
                modified,
            });
        }
        Ok(entries)
    }

    fn matches_extension(&self, path: &Path) -> bool {
        let wanted = self.config.extension.trim_start_matches('.');
        if wanted.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted))
    }

    /// `file:` + prefix + path relative to the root, with `/` separators
    fn identifier_for(&self, root: &Path, path: &Path) -> String {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let relative: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        format!("file:{}{}", self.config.identifier_prefix, relative.join("/"))
    }
}

impl Harvester for DirectoryHarvester {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn harvest(&mut self, session: &mut HarvestSession) -> Result<(), HarvestError> {
        if self.config.delete_missing_documents {
            session.enable_deletion_tracking();
        }

        let entries = self.collect()?;
        info!(
            "{}: {} files found in {}",
            self.source_id,
            entries.len(),
            self.config.path
        );

        for entry in entries {
            if let Some(modified) = entry.modified {
                session.propose_cursor_if_newer(modified);
            }
            if !self.config.ignore_datestamps && session.is_up_to_date(entry.modified) {
                debug!("{} is unchanged", entry.identifier);
                session.skip_unchanged(&entry.identifier);
                continue;
            }

            let payload =
                fs::read_to_string(&entry.path).map_err(|source| io_error(&entry.path, source))?;
            session.add_document(DocumentRecord::new(entry.identifier, entry.modified, payload))?;
        }
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> HarvestError {
    HarvestError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn walk_error(root: &Path, error: walkdir::Error) -> HarvestError {
    let path = error.path().unwrap_or(root).to_path_buf();
    io_error(&path, error.into())
}
