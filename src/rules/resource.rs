//! External rule resources: domain-set and rule-set files referenced from
//! the rule list by URL or path.
//!
//! Downloading is the host's job; this module only maps a resource URL to
//! its local cache name and parses the file contents.

use std::fs;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::error::{ProxyError, Result};

/// Maximum nesting depth for rule-sets that reference further rule-sets.
pub(crate) const MAX_RESOURCE_DEPTH: usize = 8;

/// Local cache file name for an external resource: the filename part for
/// `file://` URLs, otherwise the SHA-1 hex of the URL.
pub fn resource_local_name(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("file://") {
        return rest.rsplit('/').next().unwrap_or(rest).to_string();
    }
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Reads resource files from the host-chosen cache directory.
#[derive(Debug, Clone)]
pub struct ResourceLoader {
    base_dir: PathBuf,
}

impl ResourceLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Where the resource named by `expression` lives on disk.
    pub fn local_path(&self, expression: &str) -> PathBuf {
        if expression.contains("://") {
            return self.base_dir.join(resource_local_name(expression));
        }
        let path = Path::new(expression);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn read(&self, expression: &str) -> Result<String> {
        let path = self.local_path(expression);
        fs::read_to_string(&path).map_err(|e| {
            ProxyError::Resource(format!(
                "failed to read resource {} ({}): {}",
                expression,
                path.display(),
                e
            ))
        })
    }
}

#[derive(Debug, Clone)]
struct DomainSetEntry {
    name: String,
    /// Set by a leading `.` in the source line: the name itself or any
    /// subdomain matches.
    include_subdomains: bool,
}

/// A loaded domain-set resource: one entry per line, `#`/`;` comments.
#[derive(Debug, Clone, Default)]
pub struct DomainSet {
    entries: Vec<DomainSetEntry>,
}

impl DomainSet {
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let (name, include_subdomains) = match line.strip_prefix('.') {
                Some(rest) => (rest, true),
                None => (line, false),
            };
            if name.is_empty() {
                continue;
            }
            entries.push(DomainSetEntry {
                name: name.to_lowercase(),
                include_subdomains,
            });
        }
        Self { entries }
    }

    pub fn matches(&self, host: &str) -> bool {
        self.entries.iter().any(|entry| {
            if host == entry.name {
                return true;
            }
            entry.include_subdomains
                && host
                    .strip_suffix(entry.name.as_str())
                    .is_some_and(|head| head.ends_with('.'))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_name_file_url() {
        assert_eq!(
            resource_local_name("file:///opt/rules/ads.list"),
            "ads.list"
        );
        assert_eq!(resource_local_name("file://ads.list"), "ads.list");
    }

    #[test]
    fn test_local_name_sha1() {
        // SHA-1("abc")
        assert_eq!(
            resource_local_name("abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        let name = resource_local_name("https://example.com/rules.list");
        assert_eq!(name.len(), 40);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, resource_local_name("https://example.com/other.list"));
    }

    #[test]
    fn test_loader_paths() {
        let loader = ResourceLoader::new("/var/cache/rules");
        assert_eq!(
            loader.local_path("file:///srv/x/ads.list"),
            PathBuf::from("/var/cache/rules/ads.list")
        );
        assert_eq!(
            loader.local_path("https://example.com/r.list"),
            PathBuf::from("/var/cache/rules")
                .join(resource_local_name("https://example.com/r.list"))
        );
        assert_eq!(
            loader.local_path("/etc/tapgate/local.list"),
            PathBuf::from("/etc/tapgate/local.list")
        );
        assert_eq!(
            loader.local_path("local.list"),
            PathBuf::from("/var/cache/rules/local.list")
        );
    }

    #[test]
    fn test_loader_missing_file() {
        let loader = ResourceLoader::new("/nonexistent");
        assert!(loader.read("missing.list").is_err());
    }

    #[test]
    fn test_domain_set_parse_and_match() {
        let set = DomainSet::parse(
            "# ad hosts\n\
             ; alt comment style\n\
             .apple.com\n\
             example.org\n\
             \n\
             .Tracker.NET\n",
        );
        assert_eq!(set.len(), 3);

        // Subdomain entries match self and children on a dotted boundary
        assert!(set.matches("apple.com"));
        assert!(set.matches("store.apple.com"));
        assert!(!set.matches("fakeapple.com"));

        // Plain entries are exact
        assert!(set.matches("example.org"));
        assert!(!set.matches("www.example.org"));

        // Entries are lowercased at load
        assert!(set.matches("pixel.tracker.net"));
    }

    #[test]
    fn test_domain_set_empty() {
        let set = DomainSet::parse("# nothing\n;\n");
        assert!(set.is_empty());
        assert!(!set.matches("example.com"));
    }
}
