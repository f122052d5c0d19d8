//! OCI image reference parsing.
//!
//! Parses image references like `myhost:5000/foo/bar:v2` into structured components.

use boxroot_core::error::{BoxError, Result};
use sha2::{Digest, Sha256};

/// Registry used when the reference names none (Docker Hub API endpoint).
pub const DEFAULT_REGISTRY: &str = "https://registry-1.docker.io";

/// Host names that mean Docker Hub.
const HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry base URL including scheme (e.g., "https://ghcr.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "foo/bar")
    pub repository: String,
    /// Tag (e.g., "latest", "v2")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `alpine` → https://registry-1.docker.io/library/alpine:latest
    /// - `myuser/myimage:v1` → https://registry-1.docker.io/myuser/myimage:v1
    /// - `myhost:5000/foo/bar:v2` → https://myhost:5000/foo/bar:v2
    /// - `http://mirror.local/foo:1` → http://mirror.local/foo:1
    /// - `docker://ghcr.io/org/image@sha256:abc...`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let reference = reference.strip_prefix("docker://").unwrap_or(reference);
        if reference.is_empty() {
            return Err(BoxError::OciImageError("Empty image reference".to_string()));
        }

        let (scheme, rest) = if let Some(rest) = reference.strip_prefix("https://") {
            (Some("https"), rest)
        } else if let Some(rest) = reference.strip_prefix("http://") {
            (Some("http"), rest)
        } else {
            (None, reference)
        };

        // Split off digest first (@ separator)
        let (name_tag, digest) = match rest.rfind('@') {
            Some(at_pos) => {
                let digest_part = &rest[at_pos + 1..];
                if !digest_part.contains(':') {
                    return Err(BoxError::OciImageError(format!(
                        "Invalid digest format in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (&rest[..at_pos], Some(digest_part.to_string()))
            }
            None => (rest, None),
        };

        // The tag only owns the last colon when it comes after the last slash,
        // so "host:5000/repo" keeps its port.
        let (name, tag) = match (name_tag.rfind(':'), name_tag.rfind('/')) {
            (Some(colon), slash) if slash.map_or(true, |s| colon > s) => (
                &name_tag[..colon],
                Some(name_tag[colon + 1..].to_string()),
            ),
            _ => (name_tag, None),
        };

        if tag.as_deref() == Some("") {
            return Err(BoxError::OciImageError(format!(
                "Empty tag in reference '{}'",
                reference
            )));
        }

        let (registry, repository) = Self::split_registry_repository(name, scheme.is_some())?;
        let registry = match (scheme, registry) {
            (Some(scheme), host) => format!("{}://{}", scheme, host),
            (None, host) if host.contains("://") => host,
            (None, host) => format!("https://{}", host),
        };

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str, explicit_registry: bool) -> Result<(String, String)> {
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if explicit_registry
                || first.contains('.')
                || first.contains(':')
                || first == "localhost"
            {
                let repo = name[slash_pos + 1..].trim_matches('/');
                if repo.is_empty() {
                    return Err(BoxError::OciImageError(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                // Hub aliases do not serve the v2 API themselves
                if !explicit_registry && HUB_ALIASES.contains(&first) {
                    return Ok((DEFAULT_REGISTRY.to_string(), hub_repository(repo)));
                }
                return Ok((first.to_string(), repo.to_string()));
            }
        } else if explicit_registry {
            return Err(BoxError::OciImageError(format!(
                "Missing repository after registry in reference '{}'",
                name
            )));
        }

        if name.is_empty() {
            return Err(BoxError::OciImageError(
                "Empty repository in reference".to_string(),
            ));
        }

        Ok((DEFAULT_REGISTRY.to_string(), hub_repository(name)))
    }

    /// Tag or digest used in `/v2/<repo>/manifests/<ref>`; the digest wins.
    pub fn tag_or_digest(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Registry host without scheme (e.g., "myhost:5000").
    pub fn registry_host(&self) -> &str {
        self.registry
            .split_once("://")
            .map(|(_, host)| host)
            .unwrap_or(&self.registry)
    }

    /// Last repository path segment, used for human-readable file names.
    pub fn short_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// Get the full reference string (registry host, repository, tag, digest).
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry_host(), self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// First 16 hex chars of the SHA256 of the full reference.
    ///
    /// Keys the rootfs cache entry and the OCI layout directory, so `alpine`
    /// and `docker.io/library/alpine:latest` share one entry.
    pub fn cache_key(&self) -> String {
        let digest = Sha256::digest(self.full_reference().as_bytes());
        hex::encode(digest)[..16].to_string()
    }
}

/// Single name like "nginx" → "library/nginx" on Docker Hub.
fn hub_repository(name: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, Some("1.25".to_string()));
    }

    #[test]
    fn test_parse_user_repo() {
        let r = ImageReference::parse("myuser/myimage").unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.repository, "myuser/myimage");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("myhost:5000/foo/bar:v2").unwrap();
        assert_eq!(r.registry, "https://myhost:5000");
        assert_eq!(r.repository, "foo/bar");
        assert_eq!(r.tag, Some("v2".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port_no_tag() {
        let r = ImageReference::parse("myhost:5000/foo").unwrap();
        assert_eq!(r.registry, "https://myhost:5000");
        assert_eq!(r.repository, "foo");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = ImageReference::parse("ghcr.io/org/sub/image:v1").unwrap();
        assert_eq!(r.registry, "https://ghcr.io");
        assert_eq!(r.repository, "org/sub/image");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_mirror_path_with_dotted_segments() {
        let r = ImageReference::parse(
            "swr.cn-north-4.myhuaweicloud.com/ddn-k8s/docker.io/jeessy/ddns-go:v6.9.1",
        )
        .unwrap();
        assert_eq!(r.registry, "https://swr.cn-north-4.myhuaweicloud.com");
        assert_eq!(r.repository, "ddn-k8s/docker.io/jeessy/ddns-go");
        assert_eq!(r.tag, Some("v6.9.1".to_string()));
    }

    #[test]
    fn test_parse_explicit_scheme() {
        let r = ImageReference::parse("http://mirror/foo:1").unwrap();
        assert_eq!(r.registry, "http://mirror");
        assert_eq!(r.repository, "foo");
        assert_eq!(r.tag, Some("1".to_string()));
    }

    #[test]
    fn test_parse_docker_prefix() {
        let r = ImageReference::parse("docker://alpine:3.19").unwrap();
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag, Some("3.19".to_string()));
    }

    #[test]
    fn test_parse_localhost_registry() {
        let r = ImageReference::parse("localhost/myimage:test").unwrap();
        assert_eq!(r.registry, "https://localhost");
        assert_eq!(r.repository, "myimage");
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse("ghcr.io/org/image@sha256:abcdef").unwrap();
        assert_eq!(r.repository, "org/image");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, Some("sha256:abcdef".to_string()));
        assert_eq!(r.tag_or_digest(), "sha256:abcdef");
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("ghcr.io/org/image:v1@sha256:abcdef").unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.digest, Some("sha256:abcdef".to_string()));
        assert_eq!(r.tag_or_digest(), "sha256:abcdef");
    }

    #[test]
    fn test_parse_errors() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("   ").is_err());
        assert!(ImageReference::parse("nginx@invaliddigest").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
        assert!(ImageReference::parse("https://ghcr.io").is_err());
    }

    #[test]
    fn test_registry_host_and_short_name() {
        let r = ImageReference::parse("myhost:5000/foo/bar:v2").unwrap();
        assert_eq!(r.registry_host(), "myhost:5000");
        assert_eq!(r.short_name(), "bar");
    }

    #[test]
    fn test_display() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(format!("{}", r), "registry-1.docker.io/library/nginx:1.25");
    }

    #[test]
    fn test_cache_key_shared_by_equivalent_references() {
        let a = ImageReference::parse("alpine").unwrap();
        let b = ImageReference::parse("library/alpine:latest").unwrap();
        let c = ImageReference::parse("alpine:3.19").unwrap();
        let d = ImageReference::parse("docker.io/library/alpine").unwrap();
        let e = ImageReference::parse("index.docker.io/alpine:latest").unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), d.cache_key());
        assert_eq!(a.cache_key(), e.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
        assert_eq!(a.cache_key().len(), 16);
    }
}
