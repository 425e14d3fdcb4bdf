//! Manifest sources: where documents and substitution files come from.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use subst_shared::{Document, Node, Result, SubstError};

/// File names recognised as kustomization files, in lookup order.
const KUSTOMIZATION_FILES: [&str; 3] = ["kustomization.yaml", "kustomization.yml", "Kustomization"];

/// Extensions of files that hold manifests.
const MANIFEST_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// A loaded manifest tree.
pub trait ManifestSource: Send + Sync {
    /// Documents in source order.
    fn documents(&self) -> &[Document];

    /// Call `visit` once per constituent file, in a stable order.
    fn walk(&self, visit: &mut dyn FnMut(&Path, &[u8]) -> Result<()>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// DirectorySource
// ---------------------------------------------------------------------------

/// Manifests read from a directory, following kustomization resources when present.
#[derive(Debug)]
pub struct DirectorySource {
    files: Vec<PathBuf>,
    documents: Vec<Document>,
}

#[derive(Debug, Default, Deserialize)]
struct Kustomization {
    #[serde(default)]
    resources: Vec<String>,
}

impl DirectorySource {
    /// Load the tree under `root`. Files whose path matches `exclude` are
    /// walked but never become documents.
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub fn open(root: impl AsRef<Path>, exclude: &Regex) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(SubstError::config(format!(
                "root directory {} does not exist or is not a directory",
                root.display()
            )));
        }

        let mut collector = Collector::default();
        collector.directory(root)?;

        let mut documents = Vec::new();
        for path in collector.manifests {
            if exclude.is_match(&path.to_string_lossy()) {
                continue;
            }
            let content = std::fs::read(&path).map_err(|e| SubstError::io(&path, e))?;
            let nodes = Node::documents_from_yaml(&content).map_err(|e| {
                SubstError::config(format!("failed to load manifest {}: {e}", path.display()))
            })?;
            documents.extend(
                nodes
                    .into_iter()
                    .enumerate()
                    .map(|(index, node)| Document::new(&path, index, node)),
            );
        }

        debug!(
            files = collector.files.len(),
            documents = documents.len(),
            "loaded manifest tree"
        );

        Ok(Self {
            files: collector.files,
            documents,
        })
    }

    /// Every file visited by [`ManifestSource::walk`].
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl ManifestSource for DirectorySource {
    fn documents(&self) -> &[Document] {
        &self.documents
    }

    fn walk(&self, visit: &mut dyn FnMut(&Path, &[u8]) -> Result<()>) -> Result<()> {
        for path in &self.files {
            let content = std::fs::read(path).map_err(|e| SubstError::io(path, e))?;
            visit(path, &content)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tree collection
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Collector {
    files: Vec<PathBuf>,
    manifests: Vec<PathBuf>,
    seen_files: HashSet<PathBuf>,
    seen_manifests: HashSet<PathBuf>,
    seen_dirs: HashSet<PathBuf>,
}

impl Collector {
    fn directory(&mut self, dir: &Path) -> Result<()> {
        let canonical = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        if !self.seen_dirs.insert(canonical) {
            return Ok(());
        }
        match kustomization_file(dir) {
            Some(kustomization) => self.kustomization(dir, &kustomization),
            None => self.tree(dir),
        }
    }

    fn tree(&mut self, dir: &Path) -> Result<()> {
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                SubstError::config(format!("failed to walk {}: {e}", dir.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            self.file(&path);
            if is_manifest(&path) {
                self.manifest(path);
            }
        }
        Ok(())
    }

    fn kustomization(&mut self, dir: &Path, kustomization: &Path) -> Result<()> {
        let content =
            std::fs::read(kustomization).map_err(|e| SubstError::io(kustomization, e))?;
        let parsed: Kustomization = serde_yaml::from_slice::<Option<Kustomization>>(&content)
            .map_err(|e| {
                SubstError::config(format!("invalid kustomization {}: {e}", kustomization.display()))
            })?
            .unwrap_or_default();

        let mut local = std::fs::read_dir(dir)
            .map_err(|e| SubstError::io(dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        local.sort();
        for path in &local {
            self.file(path);
        }

        for resource in &parsed.resources {
            if resource.contains("://") {
                warn!(%resource, kustomization = %kustomization.display(), "skipping remote resource");
                continue;
            }

            let path = dir.join(resource);
            if path.is_dir() {
                self.directory(&path)?;
            } else if path.is_file() {
                self.file(&path);
                self.manifest(path);
            } else {
                return Err(SubstError::config(format!(
                    "resource {resource} listed in {} not found",
                    kustomization.display()
                )));
            }
        }
        Ok(())
    }

    fn file(&mut self, path: &Path) {
        if self.seen_files.insert(path.to_path_buf()) {
            self.files.push(path.to_path_buf());
        }
    }

    fn manifest(&mut self, path: PathBuf) {
        if is_kustomization(&path) {
            return;
        }
        if self.seen_manifests.insert(path.clone()) {
            self.manifests.push(path);
        }
    }
}

fn kustomization_file(dir: &Path) -> Option<PathBuf> {
    KUSTOMIZATION_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

fn is_kustomization(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| KUSTOMIZATION_FILES.contains(&n))
}

fn is_manifest(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| MANIFEST_EXTENSIONS.contains(&e))
}

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("subst-source-test-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn exclude() -> Regex {
        Regex::new(r"(.*subst\.ya?ml|.*\.(ejson|vars))$").unwrap()
    }

    fn names(source: &DirectorySource) -> Vec<String> {
        source
            .documents()
            .iter()
            .map(|d| d.node.get_path("metadata.name").and_then(Node::as_str).unwrap_or("?").to_string())
            .collect()
    }

    #[test]
    fn missing_root_is_a_config_error() {
        let err = DirectorySource::open("/definitely/not/here", &exclude()).unwrap_err();
        assert!(matches!(err, SubstError::Config { .. }));
    }

    #[test]
    fn walks_plain_tree_in_name_order() {
        let tmp = temp_dir();
        write(&tmp, "b/service.yaml", "kind: Service\nmetadata: {name: svc}\n");
        write(&tmp, "a/deploy.yml", "kind: Deployment\nmetadata: {name: web}\n---\n---\nkind: ConfigMap\nmetadata: {name: cfg}\n");
        write(&tmp, "a/subst.yaml", "app: {name: demo}\n");
        write(&tmp, "README.md", "not a manifest");

        let source = DirectorySource::open(&tmp, &exclude()).unwrap();

        assert_eq!(names(&source), ["web", "cfg", "svc"]);
        assert_eq!(source.files().len(), 4);
        assert_eq!(source.documents()[1].index, 1);

        let mut visited = Vec::new();
        source
            .walk(&mut |path: &Path, _: &[u8]| {
                visited.push(path.strip_prefix(&tmp).unwrap().to_path_buf());
                Ok(())
            })
            .unwrap();
        assert_eq!(
            visited,
            ["README.md", "a/deploy.yml", "a/subst.yaml", "b/service.yaml"].map(PathBuf::from)
        );

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn follows_kustomization_resources() {
        let tmp = temp_dir();
        write(
            &tmp,
            "kustomization.yaml",
            "resources:\n  - z-deploy.yaml\n  - base\n  - https://example.com/remote.yaml\n",
        );
        write(&tmp, "z-deploy.yaml", "kind: Deployment\nmetadata: {name: first}\n");
        write(&tmp, "ignored.yaml", "kind: ConfigMap\nmetadata: {name: unlisted}\n");
        write(&tmp, "subst.yaml", "app: {name: demo}\n");
        write(&tmp, "base/kustomization.yml", "resources: [svc.yaml]\n");
        write(&tmp, "base/svc.yaml", "kind: Service\nmetadata: {name: second}\n");
        write(&tmp, "unrelated/cm.yaml", "kind: ConfigMap\nmetadata: {name: elsewhere}\n");

        let source = DirectorySource::open(&tmp, &exclude()).unwrap();

        assert_eq!(names(&source), ["first", "second"]);
        assert!(source.files().contains(&tmp.join("subst.yaml")));
        assert!(source.files().contains(&tmp.join("base/svc.yaml")));
        assert!(!source.files().contains(&tmp.join("unrelated/cm.yaml")));

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn missing_kustomization_resource_fails() {
        let tmp = temp_dir();
        write(&tmp, "kustomization.yaml", "resources: [gone.yaml]\n");

        let err = DirectorySource::open(&tmp, &exclude()).unwrap_err();
        assert!(err.to_string().contains("gone.yaml"));

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn unparsable_manifest_fails_loading() {
        let tmp = temp_dir();
        write(&tmp, "broken.yaml", "kind: [unclosed\n");

        let err = DirectorySource::open(&tmp, &exclude()).unwrap_err();
        assert!(matches!(err, SubstError::Config { .. }));

        std::fs::remove_dir_all(&tmp).ok();
    }
}
