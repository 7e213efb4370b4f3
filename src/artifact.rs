//! Run-scoped artifact store and directory archives.
//!
//! Every artifact lives at `<root>/<run_id>/<name>` next to a `<name>.sha256`
//! sidecar. Artifacts are write-once: a second `put` under the same name fails,
//! and reads verify the payload against the recorded digest.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::security::sha256_bytes;

const DIGEST_SUFFIX: &str = ".sha256";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArtifactRef {
    pub run_id: String,
    pub name: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    run_id: String,
}

impl ArtifactStore {
    pub fn open(root: &Path, run_id: &str) -> Result<Self> {
        validate_name(run_id)?;
        let dir = root.join(run_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create artifact directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            run_id: run_id.to_string(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    pub fn put(&self, name: &str, data: &[u8]) -> Result<ArtifactRef> {
        validate_name(name)?;
        let path = self.path_of(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    anyhow!("Artifact '{name}' already exists in run {}", self.run_id)
                }
                _ => anyhow!(err).context(format!("Failed to create artifact '{name}'")),
            })?;
        if let Err(err) = file.write_all(data).and_then(|_| file.sync_all()) {
            let _ = fs::remove_file(&path);
            return Err(anyhow!(err).context(format!("Failed to write artifact '{name}'")));
        }

        let sha256 = sha256_bytes(data);
        fs::write(self.digest_path(name), &sha256)
            .with_context(|| format!("Failed to record digest for artifact '{name}'"))?;
        debug!(run_id = %self.run_id, artifact = name, size = data.len(), "Artifact published");

        Ok(ArtifactRef {
            run_id: self.run_id.clone(),
            name: name.to_string(),
            sha256,
            size: data.len() as u64,
        })
    }

    pub fn put_file(&self, name: &str, source: &Path) -> Result<ArtifactRef> {
        let data = fs::read(source)
            .with_context(|| format!("Failed to read artifact source: {}", source.display()))?;
        self.put(name, &data)
    }

    pub fn put_json<T: Serialize>(&self, name: &str, value: &T) -> Result<ArtifactRef> {
        let data = serde_json::to_vec_pretty(value)
            .with_context(|| format!("Failed to serialise artifact '{name}'"))?;
        self.put(name, &data)
    }

    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        validate_name(name)?;
        let path = self.path_of(name);
        let data = fs::read(&path).with_context(|| {
            format!("Artifact '{name}' not found in run {}", self.run_id)
        })?;
        let recorded = fs::read_to_string(self.digest_path(name))
            .with_context(|| format!("Digest for artifact '{name}' is missing"))?;
        let actual = sha256_bytes(&data);
        if recorded.trim() != actual {
            bail!(
                "Artifact '{name}' is corrupt: expected sha256 {}, found {actual}",
                recorded.trim()
            );
        }
        Ok(data)
    }

    pub fn get_string(&self, name: &str) -> Result<String> {
        String::from_utf8(self.get(name)?)
            .with_context(|| format!("Artifact '{name}' is not valid UTF-8"))
    }

    pub fn get_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let data = self.get(name)?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Artifact '{name}' is not valid JSON"))
    }

    pub fn list(&self) -> Result<Vec<ArtifactRef>> {
        let mut refs = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list artifacts in {}", self.dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(DIGEST_SUFFIX) || !entry.file_type()?.is_file() {
                continue;
            }
            let sha256 = fs::read_to_string(self.digest_path(&name)).unwrap_or_default();
            refs.push(ArtifactRef {
                run_id: self.run_id.clone(),
                name,
                sha256: sha256.trim().to_string(),
                size: entry.metadata()?.len(),
            });
        }
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    fn digest_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{DIGEST_SUFFIX}"))
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.ends_with(DIGEST_SUFFIX)
    {
        bail!("Invalid artifact name '{name}'");
    }
    Ok(())
}

/// Pack a directory tree into a gzip-compressed tar archive.
///
/// Entries are added in sorted order with normalised headers, so packing the
/// same tree twice yields the same bytes.
pub fn pack_directory(source: &Path) -> Result<Vec<u8>> {
    if !source.is_dir() {
        bail!("Cannot archive '{}': not a directory", source.display());
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(source).sort_by_file_name().min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context("Archive entry escaped its root")?;
        builder
            .append_path_with_name(entry.path(), relative)
            .with_context(|| format!("Failed to archive {}", entry.path().display()))?;
    }

    let encoder = builder.into_inner().context("Failed to finish tar stream")?;
    encoder.finish().context("Failed to finish gzip stream")
}

/// Extract an archive produced by [`pack_directory`] into `destination`.
pub fn unpack_archive(data: &[u8], destination: &Path) -> Result<()> {
    fs::create_dir_all(destination).with_context(|| {
        format!("Failed to create extraction directory: {}", destination.display())
    })?;
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    archive.set_preserve_permissions(true);
    archive
        .unpack(destination)
        .with_context(|| format!("Failed to extract archive into {}", destination.display()))
}

/// Pack `source` and write the archive to `output`.
pub fn pack_to_file(source: &Path, output: &Path) -> Result<String> {
    let data = pack_directory(source)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create archive directory: {}", parent.display()))?;
    }
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create archive: {}", output.display()))?;
    file.write_all(&data)
        .with_context(|| format!("Failed to write archive: {}", output.display()))?;
    Ok(sha256_bytes(&data))
}
