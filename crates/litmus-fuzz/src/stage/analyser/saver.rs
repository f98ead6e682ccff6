//! Archival of failing subjects as gzipped tarballs.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use flate2::{Compression, write::GzEncoder};
use tracing::warn;

use crate::{
    observer::Observers,
    plan::{Plan, analysis::Analysis},
    status::Status,
    subject::{Subject, normaliser::{NormaliseError, Normaliser}},
};

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error(transparent)]
    Normalise(#[from] NormaliseError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Plan(#[from] Box<crate::plan::PlanError>),
}

/// Where saved artifacts land.
///
/// Each bad-status bucket gets `<root>/<status>/<plan-time>/`, holding the
/// plan snapshot and one tarball per failing subject.
#[derive(Debug, Clone)]
pub struct Pathset {
    root: PathBuf,
}

impl Pathset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn bucket_dir(&self, status: Status, time: &DateTime<Utc>) -> PathBuf {
        self.root
            .join(status.to_string().to_lowercase())
            .join(time.format("%Y%m%d%H%M%S").to_string())
    }

    pub fn tarball(&self, status: Status, time: &DateTime<Utc>, name: &str) -> PathBuf {
        self.bucket_dir(status, time).join(format!("{name}.tar.gz"))
    }
}

/// A gzipped tar archive under construction.
pub struct TgzWriter {
    tar: tar::Builder<GzEncoder<File>>,
}

impl std::fmt::Debug for TgzWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TgzWriter")
    }
}

impl TgzWriter {
    pub fn create(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let gz = GzEncoder::new(file, Compression::default());
        Ok(Self {
            tar: tar::Builder::new(gz),
        })
    }

    /// Adds the file at `rpath` under the archive name `wpath`, deriving the
    /// tar header from the source file's metadata.  Empty `rpath`s are
    /// skipped.
    pub fn tar_file(&mut self, rpath: &Path, wpath: &Path) -> Result<(), io::Error> {
        if rpath.as_os_str().is_empty() {
            return Ok(());
        }
        self.tar.append_path_with_name(rpath, wpath)
    }

    /// Flushes and closes the tar stream, the gzip stream, and the file, in
    /// that order, reporting the first failure.  Streams that error part-way
    /// are still dropped, so every handle is closed on all paths.
    pub fn finish(self) -> Result<(), io::Error> {
        let gz = self.tar.into_inner()?;
        let file = gz.finish()?;
        file.sync_all()
    }
}

/// Archives the bad-outcome buckets of an analysis.
#[derive(Debug)]
pub struct Saver {
    paths: Pathset,
    observers: Observers,
}

impl Saver {
    pub fn new(paths: Pathset, observers: Observers) -> Self {
        Self { paths, observers }
    }

    /// Saves every subject of every bad bucket.
    ///
    /// Per-subject failures are surfaced through observers and do not stop
    /// the remaining archives.
    pub fn run(&self, plan: &Plan, analysis: &Analysis) -> Result<(), SaveError> {
        let time = plan.metadata.created;
        for (status, bucket) in &analysis.by_status {
            if !status.is_bad() || bucket.is_empty() {
                continue;
            }
            plan.write_file(&self.paths.bucket_dir(*status, &time).join("plan.json"))
                .map_err(Box::new)?;
            for (name, subject) in bucket {
                let dest = self.paths.tarball(*status, &time, name);
                match self.save_subject(name, subject, &dest) {
                    Ok(()) => self.observers.on_save(name, *status, &dest),
                    Err(e) => self.observers.on_save_error(name, &e.to_string()),
                }
            }
        }
        Ok(())
    }

    fn save_subject(&self, name: &str, subject: &Subject, dest: &Path) -> Result<(), SaveError> {
        let mut normaliser = Normaliser::new(name);
        normaliser.subject(subject)?;

        let mut archive = TgzWriter::create(dest)?;
        let result = self.tar_mappings(name, &normaliser, &mut archive);
        // The archive is closed whether or not the writes succeeded; a
        // partial tarball with a closed stream beats a leaked handle.
        let closed = archive.finish();
        result?;
        Ok(closed?)
    }

    fn tar_mappings(
        &self,
        name: &str,
        normaliser: &Normaliser,
        archive: &mut TgzWriter,
    ) -> Result<(), SaveError> {
        for (npath, entry) in &normaliser.mappings {
            if !entry.original.as_os_str().is_empty() && !entry.original.exists() {
                warn!(subject = name, missing = %entry.original.display(), "skipping absent file");
                continue;
            }
            archive.tar_file(&entry.original, npath)?;
        }
        Ok(())
    }
}
