//! Parsing of `host/repo:tag` and `host/repo@sha256:...` image references.

use crate::error::{BuildError, Result};
use crate::oci::Digest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub host: String,
    pub repo: String,
    pub reference: Reference,
}

impl ImageReference {
    pub fn as_reference_str(&self) -> String {
        match &self.reference {
            Reference::Tag(tag) => tag.clone(),
            Reference::Digest(digest) => digest.canonical(),
        }
    }
}

/// True if the first path segment looks like a registry authority (contains
/// a `.` or `:`, or is exactly `localhost`) rather than a Docker Hub
/// library/user namespace component.
fn looks_like_host(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}

pub fn host_of(full_reference: &str) -> &str {
    let without_digest = full_reference.split('@').next().unwrap_or(full_reference);
    match without_digest.split_once('/') {
        Some((first_segment, _rest)) if looks_like_host(first_segment) => first_segment,
        _ => "docker.io",
    }
}

/// Parse `[host/]repo[:tag|@digest]` into its constituent parts. A missing
/// host defaults to `docker.io`; a missing tag defaults to `latest`.
pub fn parse(full_reference: &str) -> Result<ImageReference> {
    if full_reference.is_empty() {
        return Err(BuildError::InvalidConfig("empty image reference".to_string()));
    }

    let (without_digest, digest_part) = match full_reference.split_once('@') {
        Some((rest, digest)) => (rest, Some(digest)),
        None => (full_reference, None),
    };

    let has_host = without_digest
        .split('/')
        .next()
        .is_some_and(looks_like_host);

    let (host, rest) = if has_host {
        without_digest
            .split_once('/')
            .ok_or_else(|| BuildError::InvalidConfig(format!("invalid reference: {full_reference}")))?
    } else {
        ("docker.io", without_digest)
    };

    let (repo, tag) = match rest.rsplit_once(':') {
        // A colon after the last '/' is a tag; a colon that's part of a port
        // number in `host:port/repo` never reaches here since we already
        // split off the host above.
        Some((repo, tag)) if !repo.is_empty() => (repo, Some(tag)),
        _ => (rest, None),
    };

    let reference = match digest_part {
        Some(digest_str) => Reference::Digest(Digest::parse(digest_str)?),
        None => Reference::Tag(tag.unwrap_or("latest").to_string()),
    };

    if repo.is_empty() {
        return Err(BuildError::InvalidConfig(format!("invalid reference: {full_reference}")));
    }

    Ok(ImageReference {
        host: host.to_string(),
        repo: repo.to_string(),
        reference,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_repo_tag() {
        let r = parse("ghcr.io/org/demo:v1").unwrap();
        assert_eq!(r.host, "ghcr.io");
        assert_eq!(r.repo, "org/demo");
        assert_eq!(r.reference, Reference::Tag("v1".to_string()));
    }

    #[test]
    fn defaults_host_and_tag() {
        let r = parse("demo").unwrap();
        assert_eq!(r.host, "docker.io");
        assert_eq!(r.repo, "demo");
        assert_eq!(r.reference, Reference::Tag("latest".to_string()));
    }

    #[test]
    fn parses_digest_reference() {
        let hex = "b".repeat(64);
        let r = parse(&format!("docker.io/library/python@sha256:{hex}")).unwrap();
        assert_eq!(r.repo, "library/python");
        assert_eq!(r.reference, Reference::Digest(Digest::new(hex)));
    }

    #[test]
    fn host_of_recognizes_localhost_and_port() {
        assert_eq!(host_of("localhost:5000/demo:latest"), "localhost:5000");
        assert_eq!(host_of("demo:latest"), "docker.io");
    }
}
