use crate::error::{Error, Result};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static pattern")
    })
}

/// Variables visible to manifest interpolation: a chart's `.env` (and
/// `.env.<profile>` when given) layered over the process environment.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    file: BTreeMap<String, String>,
    loaded: Vec<String>,
}

impl Vars {
    /// Load `.env` and optional `.env.<profile>` from the chart root.
    /// The process environment is never modified.
    pub fn load(root: &Path, profile: Option<&str>) -> Result<Self> {
        let mut vars = Vars::default();

        vars.merge_file(root, ".env")?;
        if let Some(profile) = profile.map(str::trim).filter(|p| !p.is_empty()) {
            vars.merge_file(root, &format!(".env.{profile}"))?;
        }
        Ok(vars)
    }

    fn merge_file(&mut self, root: &Path, name: &str) -> Result<()> {
        let path = root.join(name);
        if !path.exists() {
            return Ok(());
        }
        let iter = dotenvy::from_path_iter(&path).map_err(|e| Error::ManifestSyntax {
            path: path.clone(),
            location: None,
            message: e.to_string(),
        })?;
        for item in iter {
            let (key, value) = item.map_err(|e| Error::ManifestSyntax {
                path: path.clone(),
                location: None,
                message: e.to_string(),
            })?;
            self.file.insert(key, value);
        }
        self.loaded.push(name.to_string());
        Ok(())
    }

    /// Names of the env files that were found, in load order.
    pub fn loaded_files(&self) -> &[String] {
        &self.loaded
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.file
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|v| !v.is_empty())
    }

    /// Replace `${NAME}` and `${NAME:-default}` occurrences. Unset names
    /// without a default expand to the empty string.
    pub fn expand(&self, input: &str) -> String {
        if !input.contains("${") {
            return input.to_string();
        }
        var_pattern()
            .replace_all(input, |caps: &Captures<'_>| {
                self.get(&caps[1])
                    .or_else(|| caps.get(2).map(|d| d.as_str().to_string()))
                    .unwrap_or_default()
            })
            .into_owned()
    }

    pub fn expand_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.expand(v)))
            .collect()
    }
}
