//! App name and hostname validation.

use crate::{Error, Result};

pub const DEFAULT_HOST_SUFFIX: &str = "localhost";

pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| Error::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("app name cannot be empty"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("app name must use lowercase letters, numbers, or dashes"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("app name cannot start or end with a dash"));
    }
    Ok(())
}

/// Lowercases and validates a user supplied hostname.
pub fn normalize_host(raw: &str) -> Result<String> {
    let host = raw.trim().to_ascii_lowercase();
    let invalid = |reason| Error::InvalidHost {
        host: raw.to_string(),
        reason,
    };

    if host.is_empty() {
        return Err(invalid("host cannot be empty"));
    }
    if host.contains("://") {
        return Err(invalid("host must be a hostname without scheme"));
    }
    if host.contains('/') {
        return Err(invalid("host must not include a path"));
    }
    if host.contains(':') {
        return Err(invalid("host must not include a port"));
    }
    for label in host.split('.') {
        if label.is_empty() {
            return Err(invalid("host format is invalid"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("host labels cannot start or end with '-'"));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(invalid(
                "host can use lowercase letters, numbers, dots, and dashes",
            ));
        }
    }
    Ok(host)
}

/// Resolves the routed hostname for an app: `<name>.localhost` unless a custom
/// host is given.
pub fn host_for_app(name: &str, custom: Option<&str>) -> Result<String> {
    match custom.map(str::trim).filter(|h| !h.is_empty()) {
        Some(custom) => normalize_host(custom),
        None => Ok(format!("{name}.{DEFAULT_HOST_SUFFIX}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert!(validate_name("api").is_ok());
        assert!(validate_name("my-app-2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-api").is_err());
        assert!(validate_name("api-").is_err());
        assert!(validate_name("Api").is_err());
        assert!(validate_name("api_v2").is_err());
    }

    #[test]
    fn default_host() {
        assert_eq!(host_for_app("api", None).unwrap(), "api.localhost");
        assert_eq!(host_for_app("api", Some("  ")).unwrap(), "api.localhost");
    }

    #[test]
    fn custom_host_is_normalized() {
        assert_eq!(
            host_for_app("web", Some(" Web.Dev.Test ")).unwrap(),
            "web.dev.test"
        );
        assert_eq!(normalize_host("localhost").unwrap(), "localhost");
    }

    #[test]
    fn custom_host_rejections() {
        for bad in [
            "api-.dev.test",
            "-api.dev.test",
            "https://api.dev.test",
            "api.dev.test/path",
            "api.dev.test:8080",
            ".api.test",
            "api.test.",
            "api..test",
            "api_x.test",
        ] {
            assert!(
                matches!(normalize_host(bad), Err(Error::InvalidHost { .. })),
                "{bad} should be rejected"
            );
        }
    }
}
