//! Container image reference parsing.
//!
//! Action images must be valid, normalizable references of the familiar
//! `[registry/]path[:tag][@digest]` shape. Bare names are anchored to
//! `docker.io/library/` the way container tooling does, so that the plan
//! a worker receives is unambiguous about where an image comes from.

const DEFAULT_DOMAIN: &str = "docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
const MAX_NAME_LENGTH: usize = 255;
const MAX_TAG_LENGTH: usize = 128;

/// A parsed, normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub domain: String,
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl Reference {
    /// The fully-qualified name without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Parse an image reference and normalize it, returning a reason string
/// on failure.
pub fn parse_normalized(input: &str) -> Result<Reference, String> {
    if input.is_empty() {
        return Err("reference is empty".to_string());
    }

    // Digest comes after '@' and is never ambiguous.
    let (rest, digest) = match input.split_once('@') {
        Some((rest, digest)) => {
            validate_digest(digest)?;
            (rest, Some(digest.to_string()))
        }
        None => (input, None),
    };

    // The tag separator is the last ':' with no '/' after it; anything
    // before a '/' is a registry port, not a tag.
    let (name, tag) = match rest.rfind(':') {
        Some(i) if !rest[i + 1..].contains('/') => {
            let tag = &rest[i + 1..];
            validate_tag(tag)?;
            (&rest[..i], Some(tag.to_string()))
        }
        _ => (rest, None),
    };

    if name.is_empty() {
        return Err("repository name is empty".to_string());
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(format!(
            "repository name must not exceed {} characters",
            MAX_NAME_LENGTH
        ));
    }

    // A leading component is a registry domain only when it could not be
    // a repository path element: it contains '.' or ':' or is localhost.
    let (domain, mut path) = match name.split_once('/') {
        Some((first, remainder))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            validate_domain(first)?;
            (first.to_string(), remainder.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };

    if domain == DEFAULT_DOMAIN && !path.contains('/') {
        path = format!("{}{}", OFFICIAL_REPO_PREFIX, path);
    }

    validate_path(&path)?;

    Ok(Reference {
        domain,
        path,
        tag,
        digest,
    })
}

fn validate_domain(domain: &str) -> Result<(), String> {
    let (host, port) = match domain.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (domain, None),
    };
    if host.is_empty() {
        return Err("registry host is empty".to_string());
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(format!("invalid registry host: {}", host));
    }
    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid registry port: {}", port));
        }
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<(), String> {
    if path.chars().any(|c| c.is_ascii_uppercase()) {
        return Err("repository name must be lowercase".to_string());
    }
    for component in path.split('/') {
        if component.is_empty() {
            return Err("repository name has an empty path component".to_string());
        }
        let ok_chars = component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        let ok_ends = component.starts_with(|c: char| c.is_ascii_alphanumeric())
            && component.ends_with(|c: char| c.is_ascii_alphanumeric());
        if !ok_chars || !ok_ends {
            return Err(format!("invalid repository path component: {}", component));
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() || tag.len() > MAX_TAG_LENGTH {
        return Err(format!("invalid tag: {}", tag));
    }
    let mut chars = tag.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return Err(format!("invalid tag: {}", tag));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(format!("invalid tag: {}", tag));
    }
    Ok(())
}

fn validate_digest(digest: &str) -> Result<(), String> {
    let (algorithm, hex) = digest
        .split_once(':')
        .ok_or_else(|| format!("invalid digest: {}", digest))?;
    let algo_ok = !algorithm.is_empty()
        && algorithm.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-'));
    let hex_ok = hex.len() >= 32 && hex.chars().all(|c| c.is_ascii_hexdigit());
    if !algo_ok || !hex_ok {
        return Err(format!("invalid digest: {}", digest));
    }
    Ok(())
}
