use chrono::{Local, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::ZipWriter;

pub const RESULTS_ROOT_ENV: &str = "RESULTSROOT";
pub const CODE_ROOT_ENV: &str = "CODEROOT";
pub const DEFAULT_RESULTS_ROOT: &str = "results";
pub const CONFIG_FILE: &str = "prov.yaml";

pub const DETAILS_DIR: &str = "details";
pub const CODE_DIR: &str = "code";
pub const RESULTS_DIR: &str = "results";
pub const RUN_FILE: &str = "run.sh";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const MANIFEST_FILE: &str = "manifest.json";

const TIMESTAMP_FORMAT: &str = "%d-%m-%y@%H:%M:%S";

const FILE_READ_ONLY: u32 = 0o444;
const DIR_READ_ONLY: u32 = 0o555;
const FILE_WRITABLE: u32 = 0o644;
const DIR_WRITABLE: u32 = 0o755;
const DIR_FULL_ACCESS: u32 = 0o777;

pub type Result<T> = std::result::Result<T, ProvenanceError>;

#[derive(Debug, Error)]
pub enum ProvenanceError {
    #[error("code root not configured: set {CODE_ROOT_ENV} (or code_root in {CONFIG_FILE}) to the top directory containing your code; files used by the run under that directory are copied into the run directory")]
    CodeRootUnset,

    #[error("run directory already exists: {}", .0.display())]
    RunDirectoryExists(PathBuf),

    #[error("{phase} failed for {}: {source}", path.display())]
    Filesystem {
        phase: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("format error for {}: {detail}", path.display())]
    Format { path: PathBuf, detail: String },
}

impl ProvenanceError {
    fn fs(phase: &'static str, path: &Path, source: io::Error) -> Self {
        ProvenanceError::Filesystem {
            phase,
            path: path.to_path_buf(),
            source,
        }
    }
}

fn format_error(path: &Path, err: impl std::fmt::Display) -> ProvenanceError {
    ProvenanceError::Format {
        path: path.to_path_buf(),
        detail: err.to_string(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvConfig {
    #[serde(default)]
    pub results_root: Option<PathBuf>,
    #[serde(default)]
    pub code_root: Option<PathBuf>,
}

impl ProvConfig {
    /// Reads `prov.yaml` from the working directory if present, then applies
    /// the `RESULTSROOT` / `CODEROOT` environment overrides on top.
    pub fn load() -> Result<Self> {
        let mut config = match fs::read_to_string(CONFIG_FILE) {
            Ok(raw) => serde_yaml::from_str(&raw)
                .map_err(|e| format_error(Path::new(CONFIG_FILE), e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(ProvenanceError::fs("read", Path::new(CONFIG_FILE), e)),
        };
        if let Ok(root) = env::var(RESULTS_ROOT_ENV) {
            config.results_root = Some(PathBuf::from(root));
        }
        if let Ok(root) = env::var(CODE_ROOT_ENV) {
            config.code_root = Some(PathBuf::from(root));
        }
        Ok(config)
    }
}

/// One run directory on disk. Holds nothing but the path; all contents live
/// on the filesystem and are read back through the typed accessors.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    path: PathBuf,
}

impl RunDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("run")
    }

    pub fn details(&self) -> PathBuf {
        self.path.join(DETAILS_DIR)
    }

    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.path.join(rel.as_ref())
    }

    pub fn write_json<T: Serialize>(&self, rel: impl AsRef<Path>, data: &T) -> Result<()> {
        let path = self.path.join(rel.as_ref());
        let bytes = serde_json::to_vec(data).map_err(|e| format_error(&path, e))?;
        fs::write(&path, bytes).map_err(|e| ProvenanceError::fs("write", &path, e))
    }

    pub fn read_json<T: DeserializeOwned>(&self, rel: impl AsRef<Path>) -> Result<T> {
        let path = self.path.join(rel.as_ref());
        let bytes = fs::read(&path).map_err(|e| ProvenanceError::fs("read", &path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| format_error(&path, e))
    }

    pub fn write_bin<T: Serialize>(&self, rel: impl AsRef<Path>, data: &T) -> Result<()> {
        let path = self.path.join(rel.as_ref());
        let bytes = bincode::serialize(data).map_err(|e| format_error(&path, e))?;
        fs::write(&path, bytes).map_err(|e| ProvenanceError::fs("write", &path, e))
    }

    pub fn read_bin<T: DeserializeOwned>(&self, rel: impl AsRef<Path>) -> Result<T> {
        let path = self.path.join(rel.as_ref());
        let bytes = fs::read(&path).map_err(|e| ProvenanceError::fs("read", &path, e))?;
        bincode::deserialize(&bytes).map_err(|e| format_error(&path, e))
    }

    pub fn write_bytes(&self, rel: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        let path = self.path.join(rel.as_ref());
        fs::write(&path, data).map_err(|e| ProvenanceError::fs("write", &path, e))
    }

    pub fn read_bytes(&self, rel: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = self.path.join(rel.as_ref());
        fs::read(&path).map_err(|e| ProvenanceError::fs("read", &path, e))
    }

    pub fn write_text(&self, rel: impl AsRef<Path>, data: &str) -> Result<()> {
        let path = self.path.join(rel.as_ref());
        fs::write(&path, data).map_err(|e| ProvenanceError::fs("write", &path, e))
    }

    pub fn read_text(&self, rel: impl AsRef<Path>) -> Result<String> {
        let path = self.path.join(rel.as_ref());
        fs::read_to_string(&path).map_err(|e| ProvenanceError::fs("read", &path, e))
    }

    pub fn write_floats(&self, rel: impl AsRef<Path>, data: &[f64]) -> Result<()> {
        self.write_bin(rel, &data)
    }

    pub fn read_floats(&self, rel: impl AsRef<Path>) -> Result<Vec<f64>> {
        self.read_bin(rel)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: String,
    pub created_at: String,
    pub files: Vec<SnapshotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: String,
    pub sha256: String,
}

/// Registers the calling source file with a [`ProvenanceContext`], so it is
/// captured by the next `create`. Paths resolve relative to the working
/// directory; files outside the code root are filtered out at snapshot time.
#[macro_export]
macro_rules! source_file {
    ($ctx:expr) => {
        $ctx.register_source(::std::path::Path::new(file!()))
    };
}

/// Owns the whole provenance state for one process: the two roots, the
/// source registry, and the created/loaded directory lists whose interplay
/// drives the relock protocol.
pub struct ProvenanceContext {
    results_root: PathBuf,
    code_root: Option<PathBuf>,
    sources: Vec<PathBuf>,
    created: Vec<RunDirectory>,
    loaded: Vec<RunDirectory>,
}

impl ProvenanceContext {
    pub fn new(config: ProvConfig) -> Self {
        let results_root = config
            .results_root
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS_ROOT));
        let code_root = config.code_root.filter(|p| !p.as_os_str().is_empty());
        Self {
            results_root,
            code_root,
            sources: Vec::new(),
            created: Vec::new(),
            loaded: Vec::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ProvConfig::load()?))
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    pub fn code_root(&self) -> Option<&Path> {
        self.code_root.as_deref()
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn created(&self) -> &[RunDirectory] {
        &self.created
    }

    pub fn loaded(&self) -> &[RunDirectory] {
        &self.loaded
    }

    pub fn register_source(&mut self, path: impl AsRef<Path>) {
        self.sources.push(path.as_ref().to_path_buf());
    }

    /// Creates a fresh run directory named `{tag-}{timestamp}`, snapshots
    /// the registered sources, the invocation command and the dependency
    /// set into its `details` tree, and write-protects the result.
    pub fn create(&mut self, tag: Option<&str>) -> Result<RunDirectory> {
        let stamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let name = match tag {
            Some(tag) => format!("{tag}-{stamp}"),
            None => stamp,
        };
        self.create_named(&name)
    }

    fn create_named(&mut self, name: &str) -> Result<RunDirectory> {
        let code_root = self.code_root.as_ref().ok_or(ProvenanceError::CodeRootUnset)?;
        let code_root = code_root
            .canonicalize()
            .map_err(|e| ProvenanceError::fs("canonicalize", code_root, e))?;

        let run_path = self.results_root.join(name);
        if run_path.exists() {
            return Err(ProvenanceError::RunDirectoryExists(run_path));
        }

        let details = run_path.join(DETAILS_DIR);
        let code_dir = details.join(CODE_DIR);
        fs::create_dir_all(&code_dir).map_err(|e| ProvenanceError::fs("create", &code_dir, e))?;

        let snapshot = self.snapshot_sources(&code_root);
        info!(run = name, files = snapshot.len(), "snapshotting source files");
        let mut entries = Vec::with_capacity(snapshot.len());
        for (source, rel) in &snapshot {
            let target = code_dir.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| ProvenanceError::fs("create", parent, e))?;
            }
            fs::copy(source, &target).map_err(|e| ProvenanceError::fs("copy", source, e))?;
            entries.push(SnapshotEntry {
                path: rel.to_string_lossy().replace('\\', "/"),
                sha256: sha256_file(source)?,
            });
        }

        let command: Vec<String> = env::args().collect();
        let run_file = details.join(RUN_FILE);
        fs::write(&run_file, format!("{}\n", command.join(" ")))
            .map_err(|e| ProvenanceError::fs("write", &run_file, e))?;

        let requirements = installed_dependencies(&code_root)?
            .into_iter()
            .map(|(name, version)| format!("{name}=={version}\n"))
            .collect::<String>();
        let requirements_file = details.join(REQUIREMENTS_FILE);
        fs::write(&requirements_file, requirements)
            .map_err(|e| ProvenanceError::fs("write", &requirements_file, e))?;

        let manifest = SnapshotManifest {
            schema_version: "snapshot_manifest_v1".to_string(),
            created_at: Utc::now().to_rfc3339(),
            files: entries,
        };
        let manifest_file = details.join(MANIFEST_FILE);
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).map_err(|e| format_error(&manifest_file, e))?;
        fs::write(&manifest_file, manifest_bytes)
            .map_err(|e| ProvenanceError::fs("write", &manifest_file, e))?;

        if !self.loaded.is_empty() {
            let results_dir = details.join(RESULTS_DIR);
            fs::create_dir_all(&results_dir)
                .map_err(|e| ProvenanceError::fs("create", &results_dir, e))?;
            for dep in &self.loaded {
                copy_tree(&dep.details(), &results_dir.join(dep.name()))?;
            }
        }

        recursive_write_protect(&details)?;

        let directory = RunDirectory::new(run_path);
        self.created.push(directory.clone());
        Ok(directory)
    }

    /// Opens a previously created run directory (relative to the results
    /// root) as an input dependency. Existence is not checked eagerly; a
    /// missing path fails at the first read. Every directory this context
    /// already created is re-synchronized to include the new dependency.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<RunDirectory> {
        let directory = RunDirectory::new(self.results_root.join(path.as_ref()));
        info!(path = %directory.path().display(), "loading results directory");
        self.loaded.push(directory.clone());
        self.relock_created()?;
        Ok(directory)
    }

    // Every directory created so far must reflect the full loaded set, not
    // just the dependencies visible when it was created.
    fn relock_created(&self) -> Result<()> {
        for run in &self.created {
            let details = run.details();
            // details itself must be writable before results/ can be
            // recreated under it.
            set_mode(&details, DIR_FULL_ACCESS)?;
            let results_dir = details.join(RESULTS_DIR);
            if results_dir.exists() {
                recursive_unlock(&results_dir)?;
            } else {
                fs::create_dir_all(&results_dir)
                    .map_err(|e| ProvenanceError::fs("create", &results_dir, e))?;
            }
            for dep in &self.loaded {
                let target = results_dir.join(dep.name());
                if target.exists() {
                    fs::remove_dir_all(&target)
                        .map_err(|e| ProvenanceError::fs("remove", &target, e))?;
                }
                copy_tree(&dep.details(), &target)?;
            }
            recursive_write_protect(&results_dir)?;
            set_mode(&details, DIR_READ_ONLY)?;
            debug!(run = run.name(), "relocked provenance trail");
        }
        Ok(())
    }

    fn snapshot_sources(&self, code_root: &Path) -> Vec<(PathBuf, PathBuf)> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for candidate in &self.sources {
            let resolved = match candidate.canonicalize() {
                Ok(resolved) => resolved,
                Err(_) => {
                    debug!(path = %candidate.display(), "skipping unresolvable source");
                    continue;
                }
            };
            let rel = match resolved.strip_prefix(code_root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            if seen.insert(resolved.clone()) {
                out.push((resolved, rel));
            }
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct Lockfile {
    #[serde(default)]
    package: Vec<LockedPackage>,
}

#[derive(Debug, Deserialize)]
struct LockedPackage {
    name: String,
    version: String,
}

fn installed_dependencies(code_root: &Path) -> Result<Vec<(String, String)>> {
    let lock_path = code_root.join("Cargo.lock");
    let raw = match fs::read_to_string(&lock_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ProvenanceError::fs("read", &lock_path, e)),
    };
    let lockfile: Lockfile = toml::from_str(&raw).map_err(|e| format_error(&lock_path, e))?;
    Ok(lockfile
        .package
        .into_iter()
        .map(|p| (p.name, p.version))
        .collect())
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| ProvenanceError::fs("read", path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn recursive_write_protect(root: &Path) -> Result<()> {
    apply_tree_modes(root, FILE_READ_ONLY, DIR_READ_ONLY)
}

pub fn recursive_unlock(root: &Path) -> Result<()> {
    apply_tree_modes(root, FILE_WRITABLE, DIR_WRITABLE)
}

// Collect before touching anything, then chmod files, then directories,
// then the root, so the walk never descends into a directory it has
// already locked.
fn apply_tree_modes(root: &Path, file_mode: u32, dir_mode: u32) -> Result<()> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| ProvenanceError::fs("walk", root, e.into()))?;
        if entry.path() == root {
            continue;
        }
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        } else {
            files.push(entry.into_path());
        }
    }
    for path in &files {
        set_mode(path, file_mode)?;
    }
    for path in &dirs {
        set_mode(path, dir_mode)?;
    }
    set_mode(root, dir_mode)
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|e| ProvenanceError::fs("chmod", path, e))?;
    let mut perms = metadata.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(mode);
    }
    #[cfg(not(unix))]
    {
        perms.set_readonly(mode & 0o200 == 0);
    }
    fs::set_permissions(path, perms).map_err(|e| ProvenanceError::fs("chmod", path, e))
}

fn is_writable(metadata: &fs::Metadata) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        return metadata.permissions().mode() & 0o222 != 0;
    }
    #[cfg(not(unix))]
    {
        !metadata.permissions().readonly()
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    // Snapshot the walk before writing anything so a destination nested
    // under the source cannot extend the traversal.
    let mut entries = Vec::new();
    for entry in WalkDir::new(src) {
        entries.push(entry.map_err(|e| ProvenanceError::fs("walk", src, e.into()))?);
    }
    fs::create_dir_all(dst).map_err(|e| ProvenanceError::fs("create", dst, e))?;
    for entry in entries {
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| ProvenanceError::fs("create", &target, e))?;
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|e| ProvenanceError::fs("copy", entry.path(), e))?;
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub violations: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Checks the persisted-layout contract of a run directory: `details`
/// present with `run.sh` and `requirements.txt`, and nothing under
/// `details` writable.
pub fn verify_run_directory(run_dir: &Path) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let details = run_dir.join(DETAILS_DIR);
    if !details.is_dir() {
        report
            .violations
            .push(format!("missing details directory: {}", details.display()));
        return Ok(report);
    }
    for required in [RUN_FILE, REQUIREMENTS_FILE] {
        let path = details.join(required);
        if !path.is_file() {
            report
                .violations
                .push(format!("missing file: {}", path.display()));
        }
    }
    for entry in WalkDir::new(&details) {
        let entry = entry.map_err(|e| ProvenanceError::fs("walk", &details, e.into()))?;
        let metadata = entry
            .metadata()
            .map_err(|e| ProvenanceError::fs("stat", entry.path(), e.into()))?;
        report.checked += 1;
        if is_writable(&metadata) {
            report
                .violations
                .push(format!("writable path under details: {}", entry.path().display()));
        }
    }
    Ok(report)
}

#[derive(Debug)]
pub struct RunSummary {
    pub name: String,
    pub path: PathBuf,
    pub command: String,
    pub dependency_count: usize,
    pub snapshot_file_count: usize,
    pub loaded_results: Vec<String>,
    pub protected: bool,
}

pub fn summarize_run_directory(run_dir: &Path) -> Result<RunSummary> {
    let directory = RunDirectory::new(run_dir);
    let details = directory.details();
    let metadata = fs::metadata(&details).map_err(|e| ProvenanceError::fs("stat", &details, e))?;

    let run_file = details.join(RUN_FILE);
    let command = fs::read_to_string(&run_file)
        .map_err(|e| ProvenanceError::fs("read", &run_file, e))?
        .trim()
        .to_string();

    let requirements_file = details.join(REQUIREMENTS_FILE);
    let dependency_count = fs::read_to_string(&requirements_file)
        .map_err(|e| ProvenanceError::fs("read", &requirements_file, e))?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count();

    let code_dir = details.join(CODE_DIR);
    let mut snapshot_file_count = 0usize;
    if code_dir.is_dir() {
        for entry in WalkDir::new(&code_dir) {
            let entry = entry.map_err(|e| ProvenanceError::fs("walk", &code_dir, e.into()))?;
            if entry.file_type().is_file() {
                snapshot_file_count += 1;
            }
        }
    }

    let results_dir = details.join(RESULTS_DIR);
    let mut loaded_results = Vec::new();
    if results_dir.is_dir() {
        let reader =
            fs::read_dir(&results_dir).map_err(|e| ProvenanceError::fs("read", &results_dir, e))?;
        for entry in reader {
            let entry = entry.map_err(|e| ProvenanceError::fs("read", &results_dir, e))?;
            loaded_results.push(entry.file_name().to_string_lossy().to_string());
        }
        loaded_results.sort();
    }

    Ok(RunSummary {
        name: directory.name().to_string(),
        path: run_dir.to_path_buf(),
        command,
        dependency_count,
        snapshot_file_count,
        loaded_results,
        protected: !is_writable(&metadata),
    })
}

/// Packs a whole run directory into a zip archive for sharing; the input
/// tree is only read, so it may stay write-protected.
pub fn bundle_run_directory(run_dir: &Path, out: &Path) -> Result<()> {
    let file = fs::File::create(out).map_err(|e| ProvenanceError::fs("create", out, e))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for entry in WalkDir::new(run_dir) {
        let entry = entry.map_err(|e| ProvenanceError::fs("walk", run_dir, e.into()))?;
        let rel = match entry.path().strip_prefix(run_dir) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };
        let name = rel.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            writer
                .add_directory(name, options)
                .map_err(|e| zip_error(out, e))?;
        } else {
            writer.start_file(name, options).map_err(|e| zip_error(out, e))?;
            let bytes =
                fs::read(entry.path()).map_err(|e| ProvenanceError::fs("read", entry.path(), e))?;
            writer
                .write_all(&bytes)
                .map_err(|e| ProvenanceError::fs("write", out, e))?;
        }
    }
    writer.finish().map_err(|e| zip_error(out, e))?;
    Ok(())
}

fn zip_error(path: &Path, err: ZipError) -> ProvenanceError {
    ProvenanceError::fs("bundle", path, io::Error::new(io::ErrorKind::Other, err))
}
