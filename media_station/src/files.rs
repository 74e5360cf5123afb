use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;

static STRIP_UNSAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.-]").unwrap());

/// Extension given to every converted artifact.
pub const TARGET_EXTENSION: &str = "mp3";

/// Reduce a client-supplied filename to a flat name that is safe to join onto
/// a storage directory. Follows werkzeug's `secure_filename` on POSIX, except
/// that non-ASCII characters are dropped rather than transliterated
/// (`café.mov` becomes `caf.mov`). Returns an empty string when nothing
/// usable is left.
pub fn sanitize_filename(name: &str) -> String {
    let flat = name.replace('/', " ");
    let joined = flat.split_whitespace().collect::<Vec<_>>().join("_");
    let stripped = STRIP_UNSAFE.replace_all(&joined, "");
    stripped.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Resolve a stored name inside `base`, refusing anything that would not be
/// produced by [`sanitize_filename`] itself.
pub fn resolve<P: AsRef<Path>>(base: P, name: &str) -> Option<PathBuf> {
    if name.is_empty() || sanitize_filename(name) != name {
        return None;
    }
    Some(base.as_ref().join(name))
}

/// Name of the artifact produced from an uploaded file: the stem (everything
/// before the last dot) with the target extension.
pub fn converted_name(stored: &str) -> String {
    let stem = Path::new(stored)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(stored);
    format!("{}.{}", stem, TARGET_EXTENSION)
}

/// Deletes its file when dropped unless [`Scratch::keep`] was called.
#[derive(Debug)]
pub struct Scratch {
    path: PathBuf,
    armed: bool,
}

impl Scratch {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarm the guard and hand back the path.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove file");
            }
        }
    }
}

/// An upload being streamed to disk. Bytes go to a hidden `.part` sibling
/// and are renamed into place by [`IncomingFile::finish`]; dropping it
/// earlier discards them and leaves any existing file of that name alone.
pub struct IncomingFile {
    file: fs::File,
    part: Scratch,
    dest: PathBuf,
}

impl IncomingFile {
    pub async fn create<P: AsRef<Path>>(base: P, name: &str) -> Result<Self> {
        let dest = resolve(&base, name).ok_or_else(|| anyhow::anyhow!("unsafe file name"))?;
        fs::create_dir_all(base.as_ref()).await?;
        let part = Scratch::new(base.as_ref().join(format!(".{name}.part")));
        let file = fs::File::create(part.path()).await?;
        Ok(Self { file, part, dest })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await
    }

    /// Move the completed upload to its final name, replacing any existing
    /// file.
    pub async fn finish(self) -> Result<PathBuf> {
        let Self {
            mut file,
            part,
            dest,
        } = self;
        file.flush().await?;
        drop(file);
        fs::rename(part.path(), &dest).await?;
        part.keep();
        Ok(dest)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    /// Modification time in unix seconds.
    pub modified: u64,
}

/// List regular files directly under `base`, sorted by name. Hidden files,
/// which includes uploads still in flight, are left out.
pub async fn list_files<P: AsRef<Path>>(base: P) -> Result<Vec<StoredFile>> {
    let mut out = Vec::new();
    let mut entries = fs::read_dir(base.as_ref()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        out.push(StoredFile {
            name,
            size: meta.len(),
            modified,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}
