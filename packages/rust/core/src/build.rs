//! Build orchestration: load tree → bootstrap substitutions → apply concurrently.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, instrument, warn};

use subst_decrypt::DecryptorChain;
use subst_engine::{Environment, Substitutions};
use subst_shared::{BuildConfig, Document, Node, Result, SubstError};

use crate::source::{DirectorySource, ManifestSource};

/// Number of concurrent apply workers.
pub const WORKER_COUNT: usize = 8;

/// Summary of one apply run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Documents resolved and kept.
    pub applied: usize,
    /// Documents dropped after a decrypt, parse or resolution failure.
    pub dropped: usize,
}

/// Outcome of one document, sent from a worker to the collector.
struct Outcome {
    position: usize,
    name: String,
    result: Result<Node>,
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// One substitution run over a manifest tree.
pub struct Build {
    config: BuildConfig,
    source: Box<dyn ManifestSource>,
    substitutions: Option<Arc<Substitutions>>,
    manifests: Vec<Node>,
}

impl Build {
    /// Load the manifest tree under `config.root_directory`.
    #[instrument(skip_all, fields(root = %config.root_directory.display()))]
    pub fn new(config: BuildConfig) -> Result<Self> {
        let exclude = config.file_regex()?;
        let source = DirectorySource::open(&config.root_directory, &exclude)?;
        Ok(Self::with_source(config, Box::new(source)))
    }

    /// Use an already loaded manifest source.
    pub fn with_source(config: BuildConfig, source: Box<dyn ManifestSource>) -> Self {
        Self {
            config,
            source,
            substitutions: None,
            manifests: Vec::new(),
        }
    }

    /// Discover substitution files and bootstrap the mapping against the
    /// process environment.
    pub async fn build_substitutions(&mut self) -> Result<()> {
        let env = Environment::from_process(&self.config.env_regex()?);
        self.build_substitutions_with(&env).await
    }

    /// Discover substitution files and bootstrap the mapping against `env`.
    ///
    /// The decryptor chain lives for this call only.
    #[instrument(skip_all, fields(root = %self.config.root_directory.display()))]
    pub async fn build_substitutions_with(&mut self, env: &Environment) -> Result<()> {
        let mut substitutions = Substitutions::from_config(&self.config)?;

        {
            let chain = DecryptorChain::build(&self.config).await?;
            self.source
                .walk(&mut |path: &Path, content: &[u8]| substitutions.walk(path, content, &chain))?;
        }

        substitutions.bootstrap(env)?;

        if substitutions.is_empty() {
            debug!("no substitutions found");
        } else {
            debug!(files = substitutions.files().len(), "loaded substitutions");
        }

        self.substitutions = Some(Arc::new(substitutions));
        Ok(())
    }

    /// Apply the bootstrapped mapping to every document.
    ///
    /// Without a non-empty mapping this returns immediately and no workers
    /// are started. Failing documents are logged and dropped.
    #[instrument(skip_all, fields(documents = self.source.documents().len()))]
    pub async fn build(&mut self) -> Result<BuildReport> {
        let Some(substitutions) = self.substitutions.clone().filter(|s| !s.is_empty()) else {
            debug!("no substitutions to apply");
            self.manifests.clear();
            return Ok(BuildReport::default());
        };

        let documents = self.source.documents();
        let total = documents.len();
        if total == 0 {
            self.manifests.clear();
            return Ok(BuildReport::default());
        }

        let chain = Arc::new(DecryptorChain::build(&self.config).await?);

        let (task_tx, task_rx) = mpsc::channel::<(usize, Document)>(total);
        for (position, document) in documents.iter().enumerate() {
            task_tx
                .try_send((position, document.clone()))
                .map_err(|e| SubstError::config(format!("task queue rejected document: {e}")))?;
        }
        drop(task_tx);

        let tasks = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Outcome>();

        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for worker in 0..WORKER_COUNT {
            let tasks = Arc::clone(&tasks);
            let results = result_tx.clone();
            let chain = Arc::clone(&chain);
            let substitutions = Arc::clone(&substitutions);

            workers.push(tokio::spawn(async move {
                let mut handled = 0usize;
                loop {
                    let next = { tasks.lock().await.recv().await };
                    let Some((position, document)) = next else {
                        break;
                    };
                    let outcome = Outcome {
                        position,
                        name: document.display_name(),
                        result: apply(&chain, &substitutions, &document),
                    };
                    handled += 1;
                    if results.send(outcome).is_err() {
                        break;
                    }
                }
                debug!(worker, handled, "worker done");
            }));
        }
        drop(result_tx);

        let mut report = BuildReport::default();
        let mut applied = Vec::with_capacity(total);
        while let Some(outcome) = result_rx.recv().await {
            match outcome.result {
                Ok(node) => {
                    report.applied += 1;
                    applied.push((outcome.position, node));
                }
                Err(e) => {
                    report.dropped += 1;
                    warn!(document = %outcome.name, error = %e, "dropping document");
                }
            }
        }

        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "apply worker failed");
            }
        }

        applied.sort_by_key(|(position, _)| *position);
        self.manifests = applied.into_iter().map(|(_, node)| node).collect();

        info!(
            applied = report.applied,
            dropped = report.dropped,
            "applied substitutions"
        );
        Ok(report)
    }

    /// Resolved documents from the last [`Build::build`] run.
    pub fn manifests(&self) -> &[Node] {
        &self.manifests
    }

    /// The bootstrapped mapping, once [`Build::build_substitutions`] ran.
    pub fn substitutions(&self) -> Option<&Substitutions> {
        self.substitutions.as_deref()
    }

    pub fn documents(&self) -> &[Document] {
        self.source.documents()
    }
}

/// Decrypt if some decryptor claims the document, then resolve it.
fn apply(chain: &DecryptorChain, substitutions: &Substitutions, document: &Document) -> Result<Node> {
    let bytes = document.node.to_json_vec()?;
    match chain.open(&bytes)? {
        Some(plain) => substitutions.eval(&Node::from_yaml_slice(&plain)?),
        None => substitutions.eval(&document.node),
    }
}
