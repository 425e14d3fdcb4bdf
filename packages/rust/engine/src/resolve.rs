//! Reference resolution against a substitution mapping.

use std::collections::HashMap;

use subst_shared::{Mapping, Node, Result, Scalar, SubstError};

use crate::env::Environment;
use crate::reference::{self, Part, Template};

/// Resolves placeholders in a tree against `mapping`.
///
/// `stack` holds the paths currently being resolved, so a path seen twice on
/// it is a cycle. `aliases` does the same for aliases being followed while a
/// path is located. Resolved paths are memoized for the resolver's lifetime.
pub(crate) struct Resolver<'a> {
    mapping: &'a Node,
    env: Option<&'a Environment>,
    stack: Vec<String>,
    aliases: Vec<String>,
    cache: HashMap<String, Node>,
}

impl<'a> Resolver<'a> {
    /// `env` enables the environment fallback for paths absent from `mapping`.
    pub(crate) fn new(mapping: &'a Node, env: Option<&'a Environment>) -> Self {
        Self {
            mapping,
            env,
            stack: Vec::new(),
            aliases: Vec::new(),
            cache: HashMap::new(),
        }
    }

    pub(crate) fn resolve(&mut self, node: &Node) -> Result<Node> {
        match node {
            Node::Scalar(Scalar::String(s)) => self.resolve_string(s),
            Node::Scalar(_) => Ok(node.clone()),
            Node::Sequence(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<Vec<_>>>()
                .map(Node::Sequence),
            Node::Mapping(entries) => {
                let mut out = Mapping::new();
                for (key, value) in entries {
                    out.insert(key.clone(), self.resolve(value)?);
                }
                Ok(Node::Mapping(out))
            }
        }
    }

    fn resolve_string(&mut self, s: &str) -> Result<Node> {
        match reference::parse(s) {
            Template::Plain => Ok(Node::string(s)),
            Template::Whole(path) => self.resolve_path(path),
            Template::Interpolated(parts) => {
                let mut out = String::with_capacity(s.len());
                for part in parts {
                    match part {
                        Part::Text(text) => out.push_str(text),
                        Part::Reference(path) => match self.resolve_path(path)? {
                            Node::Scalar(scalar) => out.push_str(&scalar.render()),
                            _ => {
                                return Err(SubstError::Interpolation {
                                    path: path.to_string(),
                                });
                            }
                        },
                    }
                }
                Ok(Node::string(out))
            }
        }
    }

    fn resolve_path(&mut self, path: &str) -> Result<Node> {
        if let Some(hit) = self.cache.get(path) {
            return Ok(hit.clone());
        }

        if let Some(pos) = self.stack.iter().position(|p| p == path) {
            let mut chain = self.stack[pos..].to_vec();
            chain.push(path.to_string());
            return Err(SubstError::CyclicReference { chain });
        }

        self.stack.push(path.to_string());
        let result = self.lookup(path);
        self.stack.pop();

        let value = result?;
        self.cache.insert(path.to_string(), value.clone());
        Ok(value)
    }

    fn lookup(&mut self, path: &str) -> Result<Node> {
        match self.locate(path, false)? {
            Some((location, _)) if location != path => return self.resolve_path(&location),
            Some((_, raw)) => return self.resolve(raw),
            None => {}
        }

        if let Some(value) = self.env.and_then(|env| env.get(path)) {
            return self.resolve_string(value);
        }

        Err(SubstError::UnresolvedReference {
            path: path.to_string(),
        })
    }

    /// Find the node `path` names, rewriting any prefix that is a whole
    /// reference to the path it points at. Only paths are rewritten here;
    /// the aliased values are resolved later through [`Self::resolve_path`].
    ///
    /// With `follow_leaf`, the final node is rewritten too when it is an
    /// alias. Returns the rewritten path and its raw node.
    fn locate(&mut self, path: &str, follow_leaf: bool) -> Result<Option<(String, &'a Node)>> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut node = self.mapping;

        for depth in 0..=segments.len() {
            let at_leaf = depth == segments.len();
            if depth > 0 && (!at_leaf || follow_leaf) {
                if let Some(Template::Whole(target)) = node.as_str().map(reference::parse) {
                    let alias = segments[..depth].join(".");
                    let Some((base, target_node)) = self.follow_alias(alias, target)? else {
                        return Ok(None);
                    };
                    if at_leaf {
                        return Ok(Some((base, target_node)));
                    }
                    let rewritten = format!("{base}.{}", segments[depth..].join("."));
                    return self.locate(&rewritten, follow_leaf);
                }
            }
            if at_leaf {
                break;
            }
            match node.child(segments[depth]) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }

        Ok(Some((path.to_string(), node)))
    }

    fn follow_alias(&mut self, alias: String, target: &str) -> Result<Option<(String, &'a Node)>> {
        if let Some(pos) = self.aliases.iter().position(|a| *a == alias) {
            let mut chain = self.aliases[pos..].to_vec();
            chain.push(alias);
            return Err(SubstError::CyclicReference { chain });
        }

        self.aliases.push(alias);
        let located = self.locate(target, true);
        self.aliases.pop();
        located
    }
}
