//! Bundle builder: turns a set of module FQCNs into a content-addressed,
//! self-contained archive a gate can execute.
//!
//! Building has four steps: resolve each FQCN to a module file, scan it for
//! a declared dependency block, collect the named auxiliary libraries
//! transitively, then pack everything plus an entry-point stub descriptor
//! into a gzipped tar keyed by a fingerprint of its contents. Archives are
//! cached on disk under `cache_dir` by fingerprint; concurrent builds for
//! the same fingerprint deduplicate; one process builds, the rest wait for
//! the finished file to appear.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashSet;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorContext, Result};

/// Version of the entry-point stub packed into every bundle. Bumped
/// whenever the stub's wire protocol or dispatch behavior changes, since
/// that invalidates every previously-cached bundle.
pub const STUB_VERSION: &str = "1";

/// A module resolved to a file on disk, with its declared dependencies.
#[derive(Debug, Clone)]
struct ResolvedModule {
    fqcn: String,
    path: PathBuf,
    bytes: Vec<u8>,
    dependencies: Vec<String>,
}

/// A built, content-addressed bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// hash(sorted entries, entry stub version, target profile).
    pub fingerprint: String,
    /// Path to the gzipped tar archive on disk.
    pub path: PathBuf,
}

/// Resolves module FQCNs and auxiliary libraries and packs them into bundles.
pub struct BundleBuilder {
    search_paths: Vec<PathBuf>,
    collection_root: PathBuf,
    lib_root: PathBuf,
    cache_dir: PathBuf,
    building: DashSet<String>,
}

impl BundleBuilder {
    /// `search_paths` are checked before `collection_root` when resolving a
    /// bare module name; `lib_root` is where auxiliary libraries live.
    pub fn new(
        search_paths: Vec<PathBuf>,
        collection_root: impl Into<PathBuf>,
        lib_root: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            search_paths,
            collection_root: collection_root.into(),
            lib_root: lib_root.into(),
            cache_dir: cache_dir.into(),
            building: DashSet::new(),
        }
    }

    /// Build (or fetch from cache) the bundle for `modules` targeting
    /// `target_profile` (e.g. `"x86_64-linux/python3.11"`).
    pub async fn build(&self, modules: &[String], target_profile: &str) -> Result<Bundle> {
        let mut resolved = Vec::new();
        for fqcn in modules {
            resolved.push(self.resolve_module(fqcn)?);
        }

        let mut dependency_names: BTreeSet<String> = BTreeSet::new();
        for module in &resolved {
            dependency_names.extend(module.dependencies.iter().cloned());
        }
        let auxiliaries = self.collect_auxiliaries(&dependency_names)?;

        let fingerprint = compute_fingerprint(&resolved, &auxiliaries, target_profile);
        let archive_path = self.cache_dir.join(format!("{fingerprint}.tar.gz"));

        if archive_path.exists() {
            return Ok(Bundle {
                fingerprint,
                path: archive_path,
            });
        }

        std::fs::create_dir_all(&self.cache_dir)?;
        let lock_path = self.cache_dir.join(format!("{fingerprint}.lock"));

        if !self.claim_build(&fingerprint, &lock_path)? {
            self.wait_for(&archive_path).await?;
            return Ok(Bundle {
                fingerprint,
                path: archive_path,
            });
        }

        let result = self.pack(&resolved, &auxiliaries, target_profile, &archive_path);
        self.building.remove(&fingerprint);
        let _ = std::fs::remove_file(&lock_path);
        result?;

        Ok(Bundle {
            fingerprint,
            path: archive_path,
        })
    }

    /// Claim the build for this fingerprint. Returns `true` if this call is
    /// the builder, `false` if another process already holds the lock file.
    fn claim_build(&self, fingerprint: &str, lock_path: &Path) -> Result<bool> {
        if !self.building.insert(fingerprint.to_string()) {
            return Ok(false);
        }
        match std::fs::OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                self.building.remove(fingerprint);
                Ok(false)
            }
            Err(e) => {
                self.building.remove(fingerprint);
                Err(e.into())
            }
        }
    }

    /// Poll for the archive another builder is producing.
    async fn wait_for(&self, archive_path: &Path) -> Result<()> {
        for _ in 0..600 {
            if archive_path.exists() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(Error::BundleBuildFailed(format!(
            "timed out waiting for concurrent build of {}",
            archive_path.display()
        )))
    }

    fn resolve_module(&self, fqcn: &str) -> Result<ResolvedModule> {
        let file_name = module_file_name(fqcn);
        let mut candidates: Vec<PathBuf> = self.search_paths.iter().map(|dir| dir.join(&file_name)).collect();
        candidates.push(self.collection_root.join(&file_name));

        for candidate in &candidates {
            if candidate.is_file() {
                let bytes = std::fs::read(candidate).with_context(|| format!("reading module '{fqcn}'"))?;
                let dependencies = scan_dependencies(&bytes);
                return Ok(ResolvedModule {
                    fqcn: fqcn.to_string(),
                    path: candidate.clone(),
                    bytes,
                    dependencies,
                });
            }
        }

        Err(Error::BundleBuildFailed(format!(
            "module '{fqcn}' not found in any search path or the collection root"
        )))
    }

    fn collect_auxiliaries(&self, names: &BTreeSet<String>) -> Result<Vec<(String, Vec<u8>)>> {
        let mut seen = BTreeSet::new();
        let mut queue: Vec<String> = names.iter().cloned().collect();
        let mut out = Vec::new();

        while let Some(name) = queue.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let path = self.lib_root.join(&name);
            let bytes = std::fs::read(&path).with_context(|| format!("reading auxiliary library '{name}'"))?;
            for transitive in scan_dependencies(&bytes) {
                if !seen.contains(&transitive) {
                    queue.push(transitive);
                }
            }
            out.push((name, bytes));
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn pack(
        &self,
        modules: &[ResolvedModule],
        auxiliaries: &[(String, Vec<u8>)],
        target_profile: &str,
        archive_path: &Path,
    ) -> Result<()> {
        let dir = archive_path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir).context("creating temp bundle file")?;

        {
            let encoder = GzEncoder::new(tmp.as_file(), Compression::default());
            let mut builder = tar::Builder::new(encoder);

            for module in modules {
                let entry_name = format!("modules/{}", module_file_name(&module.fqcn));
                append_bytes(&mut builder, &entry_name, &module.bytes)?;
            }
            for (name, bytes) in auxiliaries {
                let entry_name = format!("lib/{name}");
                append_bytes(&mut builder, &entry_name, bytes)?;
            }

            let stub_manifest = serde_json::json!({
                "stub_version": STUB_VERSION,
                "target_profile": target_profile,
                "modules": modules.iter().map(|m| m.fqcn.clone()).collect::<Vec<_>>(),
            });
            let manifest_bytes = serde_json::to_vec_pretty(&stub_manifest).context("serializing bundle manifest")?;
            append_bytes(&mut builder, "entrypoint.json", &manifest_bytes)?;

            let encoder = builder.into_inner().context("finalizing bundle tar")?;
            encoder.finish().context("finalizing bundle gzip")?;
        }

        tmp.persist(archive_path).map_err(|e| e.error).context("renaming bundle into place")?;
        Ok(())
    }
}

/// Unpack a built bundle archive into `dest_dir`, for the diagnostics
/// harness that runs one bundled module directly without a gate transport.
pub fn extract(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir).with_context(|| format!("creating extract dir {}", dest_dir.display()))?;
    let file = std::fs::File::open(archive_path).with_context(|| format!("opening bundle archive {}", archive_path.display()))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest_dir)
        .with_context(|| format!("unpacking bundle archive into {}", dest_dir.display()))?;
    Ok(())
}

fn append_bytes<W: std::io::Write>(builder: &mut tar::Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name).context("setting tar entry path")?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("appending '{name}' to bundle"))?;
    Ok(())
}

fn module_file_name(fqcn: &str) -> String {
    fqcn.replace('.', "/")
}

/// Parse a module's declared dependencies from a metadata comment block.
/// Recognized form: a line matching `# ftl2:dependencies: lib_a, lib_b`.
fn scan_dependencies(bytes: &[u8]) -> Vec<String> {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return Vec::new();
    };
    for line in text.lines().take(50) {
        let trimmed = line.trim_start_matches(['#', '/', '*', ' ']);
        if let Some(rest) = trimmed.strip_prefix("ftl2:dependencies:") {
            return rest
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    Vec::new()
}

fn compute_fingerprint(modules: &[ResolvedModule], auxiliaries: &[(String, Vec<u8>)], target_profile: &str) -> String {
    let mut entries: Vec<(String, &[u8])> = modules
        .iter()
        .map(|m| (format!("module:{}", m.fqcn), m.bytes.as_slice()))
        .chain(auxiliaries.iter().map(|(name, bytes)| (format!("lib:{name}"), bytes.as_slice())))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (name, bytes) in &entries {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        hasher.update(bytes);
        hasher.update(b"\0");
    }
    hasher.update(STUB_VERSION.as_bytes());
    hasher.update(target_profile.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Read a bundle archive's manifest without extracting it, for diagnostics.
pub fn read_manifest(archive_path: &Path) -> Result<serde_json::Value> {
    let file = std::fs::File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == "entrypoint.json" {
            let mut buf = String::new();
            entry.read_to_string(&mut buf)?;
            return Ok(serde_json::from_str(&buf)?);
        }
    }
    Err(Error::BundleBuildFailed(format!(
        "bundle {} has no entrypoint.json",
        archive_path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, BundleBuilder) {
        let dir = tempfile::tempdir().unwrap();
        let modules_dir = dir.path().join("modules");
        let lib_dir = dir.path().join("lib");
        let cache_dir = dir.path().join("cache");
        std::fs::create_dir_all(&modules_dir).unwrap();
        std::fs::create_dir_all(&lib_dir).unwrap();
        std::fs::create_dir_all(modules_dir.join("ftl2/builtin")).unwrap();

        std::fs::write(
            modules_dir.join("ftl2/builtin/copy"),
            "# ftl2:dependencies: shutil_ext\nprint('copy')\n",
        )
        .unwrap();
        std::fs::write(lib_dir.join("shutil_ext"), "def helper(): pass\n").unwrap();

        let builder = BundleBuilder::new(vec![modules_dir], dir.path().join("collections"), lib_dir, cache_dir);
        (dir, builder)
    }

    #[tokio::test]
    async fn builds_and_caches_by_fingerprint() {
        let (_dir, builder) = setup();
        let modules = vec!["ftl2.builtin.copy".to_string()];

        let bundle1 = builder.build(&modules, "x86_64-linux/py3.11").await.unwrap();
        assert!(bundle1.path.exists());

        let bundle2 = builder.build(&modules, "x86_64-linux/py3.11").await.unwrap();
        assert_eq!(bundle1.fingerprint, bundle2.fingerprint);
        assert_eq!(bundle1.path, bundle2.path);
    }

    #[tokio::test]
    async fn different_target_profile_yields_different_fingerprint() {
        let (_dir, builder) = setup();
        let modules = vec!["ftl2.builtin.copy".to_string()];

        let bundle1 = builder.build(&modules, "x86_64-linux/py3.11").await.unwrap();
        let bundle2 = builder.build(&modules, "aarch64-linux/py3.11").await.unwrap();
        assert_ne!(bundle1.fingerprint, bundle2.fingerprint);
    }

    #[tokio::test]
    async fn missing_module_fails_closed() {
        let (_dir, builder) = setup();
        let modules = vec!["ftl2.builtin.nonexistent".to_string()];
        let result = builder.build(&modules, "x86_64-linux/py3.11").await;
        assert!(matches!(result, Err(Error::BundleBuildFailed(_))));
    }

    #[tokio::test]
    async fn manifest_roundtrips_through_archive() {
        let (_dir, builder) = setup();
        let modules = vec!["ftl2.builtin.copy".to_string()];
        let bundle = builder.build(&modules, "x86_64-linux/py3.11").await.unwrap();
        let manifest = read_manifest(&bundle.path).unwrap();
        assert_eq!(manifest["stub_version"], STUB_VERSION);
    }
}
