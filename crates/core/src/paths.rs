//! Realm url helpers.
//!
//! Every resource in a realm is identified by an absolute url under the realm
//! url. Card instances are `.json` documents, card definitions are executable
//! modules (`.gts`, `.ts`, ...). Dependencies may reference a module with or
//! without its extension, so entries also carry an extension-trimmed alias.

use url::Url;

/// File extensions that mark a resource as an executable module.
pub const EXECUTABLE_EXTENSIONS: &[&str] = &[".js", ".gjs", ".ts", ".gts"];

/// Whether the url names an executable module (type declarations excluded).
pub fn has_executable_extension(url: &str) -> bool {
    EXECUTABLE_EXTENSIONS.iter().any(|ext| url.ends_with(ext)) && !url.ends_with(".d.ts")
}

/// Strip a trailing executable extension, if any.
pub fn trim_executable_extension(url: &str) -> &str {
    for ext in EXECUTABLE_EXTENSIONS {
        if let Some(trimmed) = url.strip_suffix(ext) {
            return trimmed;
        }
    }
    url
}

/// Extension-trimmed identity used for dependency matching.
pub fn file_alias(url: &str) -> String {
    let trimmed = trim_executable_extension(url);
    trimmed.strip_suffix(".json").unwrap_or(trimmed).to_string()
}

pub fn is_json(url: &str) -> bool {
    url.ends_with(".json")
}

pub fn is_css(url: &str) -> bool {
    url.ends_with(".css")
}

/// Only card documents and modules take part in indexing and invalidation.
pub fn is_indexable(url: &str) -> bool {
    is_json(url) || has_executable_extension(url)
}

/// Ensure an instance url carries its `.json` document suffix.
pub fn ensure_json_suffix(url: &str) -> String {
    if is_json(url) { url.to_string() } else { format!("{url}.json") }
}

/// Resolve `url` against `relative_to` and drop any query string or fragment.
pub fn canonical_url(url: &str, relative_to: Option<&str>) -> String {
    let parsed = match relative_to.and_then(|base| Url::parse(base).ok()) {
        Some(base) => base.join(url),
        None => Url::parse(url),
    };
    match parsed {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => {
            let stripped = url.split('#').next().unwrap_or(url);
            stripped.split('?').next().unwrap_or(stripped).to_string()
        }
    }
}

/// Maps between realm-relative local paths and absolute resource urls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmPaths {
    url: Url,
}

impl RealmPaths {
    /// Create realm paths for a realm url. A missing trailing slash is added.
    pub fn new(realm_url: &str) -> Result<Self, url::ParseError> {
        let mut url = Url::parse(realm_url)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn in_realm(&self, url: &str) -> bool {
        url.starts_with(self.url.as_str())
    }

    /// Realm-relative path of `url`, or `None` when it lives in another realm.
    pub fn local(&self, url: &str) -> Option<String> {
        let canonical = canonical_url(url, None);
        canonical
            .strip_prefix(self.url.as_str())
            .map(|local| local.trim_start_matches('/').to_string())
    }

    pub fn file_url(&self, local: &str) -> String {
        match self.url.join(local.trim_start_matches('/')) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}{}", self.url, local.trim_start_matches('/')),
        }
    }

    /// Url of the directory that contains `url` (the realm url for top-level files).
    pub fn directory_of(&self, url: &str) -> String {
        match url.rfind('/') {
            Some(idx) if idx + 1 >= self.url.as_str().len() => url[..=idx].to_string(),
            _ => self.url.to_string(),
        }
    }
}
