use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::{ImageFormat, RgbImage};
use redecor_contracts::artifacts::{Artifact, ArtifactKind};
use redecor_contracts::config::StorageConfig;
use uuid::Uuid;

/// Filesystem store with two public namespaces: original uploads, and
/// everything derived from them (conditioning images, outputs, receipts).
///
/// Writes go to a temp file in the target directory and are then linked into
/// place without clobbering, so an id is written at most once and readers
/// never observe half-written files.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    uploads_dir: String,
    generated_dir: String,
}

impl ArtifactStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Self::open(&config.root, &config.uploads_dir, &config.generated_dir)
    }

    pub fn open(root: impl AsRef<Path>, uploads_dir: &str, generated_dir: &str) -> Result<Self> {
        for name in [uploads_dir, generated_dir] {
            if !is_safe_name(name) {
                bail!("invalid storage namespace '{name}'");
            }
        }
        let store = Self {
            root: root.as_ref().to_path_buf(),
            uploads_dir: uploads_dir.to_string(),
            generated_dir: generated_dir.to_string(),
        };
        for dir in [
            store.namespace_dir(ArtifactKind::Upload),
            store.namespace_dir(ArtifactKind::Output),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed creating {}", dir.display()))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_namespace(&self) -> &str {
        &self.uploads_dir
    }

    pub fn generated_namespace(&self) -> &str {
        &self.generated_dir
    }

    fn namespace(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Upload => &self.uploads_dir,
            ArtifactKind::Conditioning | ArtifactKind::Output => &self.generated_dir,
        }
    }

    fn namespace_dir(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(self.namespace(kind))
    }

    /// Persists `image` as PNG. Without a hint a fresh UUID is assigned; a
    /// hint that already exists is refused rather than overwritten.
    pub fn save(
        &self,
        image: &RgbImage,
        kind: ArtifactKind,
        id_hint: Option<&str>,
    ) -> Result<Artifact> {
        let id = match id_hint {
            Some(hint) => {
                if !is_safe_name(hint) {
                    bail!("invalid artifact id '{hint}'");
                }
                hint.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };
        let file_name = format!("{id}.png");
        let dir = self.namespace_dir(kind);
        let path = dir.join(&file_name);

        let mut staged = tempfile::Builder::new()
            .prefix(".staging-")
            .suffix(".png")
            .tempfile_in(&dir)
            .with_context(|| format!("failed staging {kind} artifact in {}", dir.display()))?;
        {
            let mut writer = BufWriter::new(staged.as_file_mut());
            image
                .write_to(&mut writer, ImageFormat::Png)
                .with_context(|| format!("failed encoding {kind} artifact {id}"))?;
            writer.flush()?;
        }
        staged
            .persist_noclobber(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed persisting {kind} artifact {}", path.display()))?;

        Ok(Artifact {
            id,
            kind,
            location: format!("{}/{file_name}", self.namespace(kind)),
            path,
        })
    }

    /// Path for a JSON sidecar that sits next to `artifact`.
    pub fn sidecar_path(&self, artifact: &Artifact) -> PathBuf {
        artifact.path.with_extension("json")
    }

    /// Reads a public file for the static server. Unknown namespaces, names
    /// that could escape the namespace, and missing files all yield `None`.
    pub fn read_public(
        &self,
        namespace: &str,
        file_name: &str,
    ) -> Result<Option<(Vec<u8>, &'static str)>> {
        if namespace != self.uploads_dir && namespace != self.generated_dir {
            return Ok(None);
        }
        if !is_safe_name(file_name) || file_name.starts_with('.') {
            return Ok(None);
        }
        let content_type = match Path::new(file_name).extension().and_then(|ext| ext.to_str()) {
            Some("png") => "image/png",
            Some("json") => "application/json",
            _ => return Ok(None),
        };
        let path = self.root.join(namespace).join(file_name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some((bytes, content_type))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed reading {}", path.display())),
        }
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        && !name.contains("..")
}
