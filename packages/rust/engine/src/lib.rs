//! Substitution mapping: collection, bootstrap and evaluation.
//!
//! Substitution files are merged in the order they are walked, then the
//! merged mapping is resolved against itself once (with the environment
//! fallback enabled). Documents are evaluated against the resolved mapping.

mod env;
mod merge;
pub mod reference;
mod resolve;

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, instrument};

use subst_decrypt::DecryptorChain;
use subst_shared::{BuildConfig, Node, Result, SubstError};

pub use env::Environment;
pub use merge::deep_merge;

use resolve::Resolver;

/// The substitution mapping and the pattern selecting the files that feed it.
#[derive(Debug)]
pub struct Substitutions {
    file_regex: Regex,
    mapping: Node,
    files: Vec<PathBuf>,
    bootstrapped: bool,
}

impl Substitutions {
    pub fn new(file_regex: Regex) -> Self {
        Self {
            file_regex,
            mapping: Node::default(),
            files: Vec::new(),
            bootstrapped: false,
        }
    }

    /// Pattern taken from the runtime config.
    pub fn from_config(config: &BuildConfig) -> Result<Self> {
        Ok(Self::new(config.file_regex()?))
    }

    pub fn is_substitution_file(&self, path: &Path) -> bool {
        self.file_regex.is_match(&path.to_string_lossy())
    }

    /// Visit one file of the tree. Non-substitution files are ignored.
    ///
    /// Encrypted files are opened through `chain` before being merged.
    pub fn walk(&mut self, path: &Path, content: &[u8], chain: &DecryptorChain) -> Result<()> {
        if !self.is_substitution_file(path) {
            return Ok(());
        }

        let plain = chain.open(content).map_err(|e| at(path, e))?;
        let bytes = plain.as_deref().unwrap_or(content);
        let documents = Node::documents_from_yaml(bytes).map_err(|e| at(path, e))?;

        for document in documents {
            self.merge(path, document)?;
        }
        debug!(path = %path.display(), encrypted = plain.is_some(), "merged substitution file");
        self.files.push(path.to_path_buf());
        Ok(())
    }

    /// Merge one parsed document into the mapping; later writers win.
    pub fn merge(&mut self, origin: &Path, document: Node) -> Result<()> {
        if document.as_mapping().is_none() {
            return Err(at(
                origin,
                SubstError::parse("substitution document must be a mapping"),
            ));
        }
        deep_merge(&mut self.mapping, document);
        self.bootstrapped = false;
        Ok(())
    }

    /// Resolve the mapping against itself, consulting `env` for missing paths.
    #[instrument(skip_all, fields(files = self.files.len()))]
    pub fn bootstrap(&mut self, env: &Environment) -> Result<()> {
        let resolved = Resolver::new(&self.mapping, Some(env)).resolve(&self.mapping)?;
        self.mapping = resolved;
        self.bootstrapped = true;
        Ok(())
    }

    /// Resolve every placeholder in `node` against the mapping.
    ///
    /// The mapping must have been bootstrapped; no environment fallback
    /// happens here.
    pub fn eval(&self, node: &Node) -> Result<Node> {
        if !self.bootstrapped && !self.is_empty() {
            return Err(SubstError::config("substitutions evaluated before bootstrap"));
        }
        Resolver::new(&self.mapping, None).resolve(node)
    }

    pub fn mapping(&self) -> &Node {
        &self.mapping
    }

    /// Substitution files merged so far, in merge order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.as_mapping().is_none_or(|m| m.is_empty())
    }
}

fn at(path: &Path, err: SubstError) -> SubstError {
    match err {
        SubstError::Parse { message } => {
            SubstError::parse(format!("{}: {message}", path.display()))
        }
        SubstError::Decrypt { message } => {
            SubstError::decrypt(format!("{}: {message}", path.display()))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use subst_decrypt::{SealedDecryptor, seal_document};
    use subst_shared::AppConfig;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn substitutions() -> Substitutions {
        Substitutions::from_config(&BuildConfig::new(".", &AppConfig::default())).unwrap()
    }

    fn yaml(s: &str) -> Node {
        Node::from_yaml_slice(s.as_bytes()).unwrap()
    }

    fn no_env() -> Environment {
        Environment::default()
    }

    #[test]
    fn only_matching_files_are_merged() {
        let chain = DecryptorChain::new();
        let mut subst = substitutions();

        subst.walk(Path::new("base/subst.yaml"), b"app: {name: demo}\n", &chain).unwrap();
        subst.walk(Path::new("base/deploy.yaml"), b"kind: Deployment\n", &chain).unwrap();

        assert_eq!(subst.files(), [PathBuf::from("base/subst.yaml")]);
        assert_eq!(subst.mapping().get_path("app.name"), Some(&Node::string("demo")));
        assert!(subst.mapping().get_path("kind").is_none());
    }

    #[test]
    fn later_files_win() {
        let chain = DecryptorChain::new();
        let mut subst = substitutions();

        subst.walk(Path::new("a/subst.yaml"), b"x: 1\nkeep: yes-a\n", &chain).unwrap();
        subst.walk(Path::new("b/subst.yaml"), b"x: 2\n", &chain).unwrap();
        subst.bootstrap(&no_env()).unwrap();

        assert_eq!(subst.mapping().get_path("x"), Some(&Node::from(2_i64)));
        assert_eq!(subst.mapping().get_path("keep"), Some(&Node::string("yes-a")));
    }

    #[test]
    fn multi_document_files_merge_in_order() {
        let chain = DecryptorChain::new();
        let mut subst = substitutions();
        subst
            .walk(Path::new("subst.yml"), b"a: 1\n---\na: 2\nb: 3\n", &chain)
            .unwrap();

        assert_eq!(subst.mapping().get_path("a"), Some(&Node::from(2_i64)));
        assert_eq!(subst.mapping().get_path("b"), Some(&Node::from(3_i64)));
    }

    #[test]
    fn non_mapping_substitution_file_is_rejected() {
        let chain = DecryptorChain::new();
        let mut subst = substitutions();
        let err = subst
            .walk(Path::new("list.vars"), b"- a\n- b\n", &chain)
            .unwrap_err();
        assert!(matches!(err, SubstError::Parse { ref message } if message.contains("list.vars")));
    }

    #[test]
    fn encrypted_substitution_files_are_opened() {
        let mut chain = DecryptorChain::new();
        chain.register(Arc::new(SealedDecryptor::new(false, &[KEY.into()]).unwrap()));

        let sealed = seal_document(&yaml("db: {password: hunter2}\n"), KEY).unwrap();
        let content = sealed.to_json_vec().unwrap();

        let mut subst = substitutions();
        subst.walk(Path::new("secrets.ejson"), &content, &chain).unwrap();
        subst.bootstrap(&no_env()).unwrap();

        assert_eq!(
            subst.eval(&yaml("p: ((db.password))\n")).unwrap().get_path("p"),
            Some(&Node::string("hunter2"))
        );
    }

    #[test]
    fn bootstrap_resolves_internal_references() {
        let mut subst = substitutions();
        subst
            .merge(
                Path::new("subst.yaml"),
                yaml("app: {name: demo}\nimage: \"registry/((app.name)):1.0\"\n"),
            )
            .unwrap();
        subst.bootstrap(&no_env()).unwrap();

        assert_eq!(
            subst.mapping().get_path("image"),
            Some(&Node::string("registry/demo:1.0"))
        );
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let mut subst = substitutions();
        subst
            .merge(
                Path::new("subst.yaml"),
                yaml(concat!(
                    "app: {name: demo, replicas: 2}\n",
                    "image: \"registry/((app.name)):1.0\"\n",
                    "current: ((app))\n",
                )),
            )
            .unwrap();

        subst.bootstrap(&no_env()).unwrap();
        let once = subst.mapping().clone();
        subst.bootstrap(&no_env()).unwrap();

        assert_eq!(subst.mapping(), &once);
        assert_eq!(once.get_path("current.replicas"), Some(&Node::from(2_i64)));
    }

    #[test]
    fn bootstrap_follows_aliases_referenced_from_their_target() {
        let mut subst = substitutions();
        subst
            .merge(
                Path::new("subst.yaml"),
                yaml(concat!(
                    "cur: ((envs.prod))\n",
                    "envs:\n",
                    "  prod: {region: eu, url: \"https://((cur.region)).example\"}\n",
                )),
            )
            .unwrap();
        subst.bootstrap(&no_env()).unwrap();

        assert_eq!(
            subst.mapping().get_path("envs.prod.url"),
            Some(&Node::string("https://eu.example"))
        );
        assert_eq!(subst.mapping().get_path("cur.region"), Some(&Node::string("eu")));
    }

    #[test]
    fn bootstrap_cycle_is_fatal() {
        let mut subst = substitutions();
        subst
            .merge(Path::new("subst.yaml"), yaml("a: ((b))\nb: ((a))\n"))
            .unwrap();
        let err = subst.bootstrap(&no_env()).unwrap_err();
        assert!(matches!(err, SubstError::CyclicReference { .. }));
    }

    #[test]
    fn environment_only_during_bootstrap() {
        let re = Regex::new("^ARGOCD_ENV_.*$").unwrap();
        let env = Environment::from_vars(&re, [("ARGOCD_ENV_CLUSTER", "prod")]);

        let mut subst = substitutions();
        subst
            .merge(Path::new("subst.yaml"), yaml("cluster: ((ARGOCD_ENV_CLUSTER))\n"))
            .unwrap();
        subst.bootstrap(&env).unwrap();

        assert_eq!(subst.mapping().get_path("cluster"), Some(&Node::string("prod")));

        let err = subst.eval(&yaml("c: ((ARGOCD_ENV_CLUSTER))\n")).unwrap_err();
        assert!(matches!(err, SubstError::UnresolvedReference { .. }));
    }

    #[test]
    fn eval_is_idempotent_on_resolved_output() {
        let mut subst = substitutions();
        subst
            .merge(Path::new("subst.yaml"), yaml("app: {name: demo, replicas: 2}\n"))
            .unwrap();
        subst.bootstrap(&no_env()).unwrap();

        let doc = yaml("metadata: {name: ((app.name))}\nspec: {replicas: ((app.replicas))}\n");
        let once = subst.eval(&doc).unwrap();
        let twice = subst.eval(&once).unwrap();

        assert_eq!(once, twice);
        assert_eq!(once.get_path("metadata.name"), Some(&Node::string("demo")));
        assert_eq!(once.get_path("spec.replicas"), Some(&Node::from(2_i64)));
    }

    #[test]
    fn eval_before_bootstrap_is_rejected() {
        let mut subst = substitutions();
        subst.merge(Path::new("subst.yaml"), yaml("a: 1\n")).unwrap();
        assert!(subst.eval(&yaml("v: ((a))\n")).is_err());
    }

    #[test]
    fn empty_until_something_is_merged() {
        let subst = substitutions();
        assert!(subst.is_empty());
        assert!(subst.files().is_empty());
    }
}
