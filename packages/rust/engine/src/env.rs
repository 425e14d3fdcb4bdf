use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

/// Environment variables eligible as substitution sources.
#[derive(Clone, Default)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Snapshot the process environment, keeping names matching `pattern`.
    pub fn from_process(pattern: &Regex) -> Self {
        Self::from_vars(pattern, std::env::vars())
    }

    /// Keep the pairs whose name matches `pattern`.
    pub fn from_vars<I, K, V>(pattern: &Regex, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| pattern.is_match(k))
            .collect();
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

// Values may carry credentials; only names are printed.
impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.vars.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_by_pattern() {
        let re = Regex::new("^ARGOCD_ENV_.*$").unwrap();
        let env = Environment::from_vars(
            &re,
            [
                ("ARGOCD_ENV_CLUSTER", "prod"),
                ("HOME", "/root"),
                ("MY_ARGOCD_ENV_X", "no"),
            ],
        );

        assert_eq!(env.len(), 1);
        assert_eq!(env.get("ARGOCD_ENV_CLUSTER"), Some("prod"));
        assert_eq!(env.get("HOME"), None);
    }

    #[test]
    fn debug_hides_values() {
        let re = Regex::new(".*").unwrap();
        let env = Environment::from_vars(&re, [("TOKEN", "s3cr3t")]);
        let shown = format!("{env:?}");
        assert!(shown.contains("TOKEN"));
        assert!(!shown.contains("s3cr3t"));
    }
}
