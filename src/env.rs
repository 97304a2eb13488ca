use std::collections::BTreeMap;
use std::path::Path;

/// Key/value source for settings: a parsed `.env` file layered over the process environment.
///
/// The process environment wins over `.env`, matching how the values are set in
/// container deployments. Keys are matched exactly first and then upper-cased.
#[derive(Clone, Default)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
    skip_process_env: bool,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env")
            .field("dotenv_keys", &keys)
            .field("skip_process_env", &self.skip_process_env)
            .finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
            skip_process_env: false,
        }
    }

    /// Like [`Env::parse_dotenv`] but never consults the process environment.
    pub fn isolated(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
            skip_process_env: true,
        }
    }

    /// Loads `path` if it exists; a missing file yields an empty dotenv layer.
    pub fn from_dotenv_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => Ok(Self::parse_dotenv(&contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let upper = key.to_ascii_uppercase();
        let candidates = [key, upper.as_str()];
        let process_candidates = if self.skip_process_env {
            &candidates[..0]
        } else {
            &candidates[..]
        };
        for candidate in process_candidates.iter().copied() {
            if let Some(value) = std::env::var(candidate)
                .ok()
                .filter(|value| !value.trim().is_empty())
            {
                return Some(value);
            }
        }
        self.dotenv
            .get(key)
            .or_else(|| self.dotenv.get(&upper))
            .cloned()
    }
}

pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = raw_key.trim();
        if key.is_empty() {
            continue;
        }

        let raw_value = raw_value.trim();
        let value = raw_value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| raw_value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(raw_value);

        if value.trim().is_empty() {
            continue;
        }

        out.insert(key.to_string(), value.to_string());
    }

    out
}
