// ABOUTME: Input validation for names, domains, ports, images and relative data paths
// ABOUTME: Everything that ends up in instance names, file names or proxy rules is checked here

use crate::error::{Result, SandboxError};
use regex::Regex;
use std::path::{Component, Path};
use std::sync::LazyLock;

static SANDBOX_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,62}$").expect("valid sandbox name regex"));

static USER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{1,30}$").expect("valid user name regex"));

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9.-]*[a-z0-9])?\.[a-z]{2,}$").expect("valid domain regex")
});

static IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._/:@-]{0,254}$").expect("valid image regex")
});

/// `<owner>-<name>` as found in sidecar instance names.
static FULL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_-]+-[a-z][a-z0-9_-]*$").expect("valid full name regex")
});

pub fn validate_sandbox_name(name: &str) -> Result<()> {
    if !SANDBOX_NAME.is_match(name) {
        return Err(SandboxError::Validation(format!(
            "Invalid sandbox name '{}': use lowercase letters, digits, '-' or '_', starting with a letter (max 63)",
            name
        )));
    }
    Ok(())
}

/// Snapshot names share the sandbox naming rules, plus the generated `YYYYMMDD-HHMMSS` form.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    let generated = name.len() == 15
        && name.chars().enumerate().all(|(i, c)| {
            if i == 8 {
                c == '-'
            } else {
                c.is_ascii_digit()
            }
        });
    if generated || SANDBOX_NAME.is_match(name) {
        return Ok(());
    }
    Err(SandboxError::Validation(format!(
        "Invalid snapshot name '{}'",
        name
    )))
}

pub fn validate_user_name(name: &str) -> Result<()> {
    if !USER_NAME.is_match(name) {
        return Err(SandboxError::Validation(format!(
            "Invalid user name '{}'",
            name
        )));
    }
    Ok(())
}

/// Lowercases and checks a routed domain.
pub fn normalize_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().to_lowercase();
    if domain.len() > 253 || !DOMAIN.is_match(&domain) || domain.contains("..") {
        return Err(SandboxError::Validation(format!(
            "Invalid domain '{}'",
            domain
        )));
    }
    Ok(domain)
}

pub fn validate_port(port: u32) -> Result<u16> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| SandboxError::Validation(format!("Port {} is out of range (1-65535)", port)))
}

pub fn validate_image(image: &str) -> Result<()> {
    if !IMAGE.is_match(image) {
        return Err(SandboxError::Validation(format!(
            "Invalid image reference '{}'",
            image
        )));
    }
    Ok(())
}

/// A data path must be relative and must not climb out with `..`.
pub fn validate_data_path(data_path: &str) -> Result<()> {
    let path = Path::new(data_path);
    let invalid = data_path.is_empty()
        || data_path.contains('\0')
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if invalid {
        return Err(SandboxError::Validation(format!(
            "Invalid data path '{}': must be relative without '..'",
            data_path
        )));
    }
    Ok(())
}

pub fn is_valid_full_name(full_name: &str) -> bool {
    FULL_NAME.is_match(full_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("dev", true)]
    #[case("a", true)]
    #[case("my_box-2", true)]
    #[case("Dev", false)]
    #[case("2dev", false)]
    #[case("dev box", false)]
    #[case("", false)]
    #[case("a123456789012345678901234567890123456789012345678901234567890123", false)]
    fn test_sandbox_names(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_sandbox_name(name).is_ok(), ok);
    }

    #[rstest]
    #[case("alice", true)]
    #[case("a", false)]
    #[case("bob-2", true)]
    #[case("_bob", false)]
    fn test_user_names(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_user_name(name).is_ok(), ok);
    }

    #[rstest]
    #[case("D.Example.com", Some("d.example.com"))]
    #[case("app.sandcastle.dev", Some("app.sandcastle.dev"))]
    #[case("localhost", None)]
    #[case("-bad.example.com", None)]
    #[case("a..b.com", None)]
    #[case("app.example.c", None)]
    fn test_domains(#[case] input: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_domain(input).ok().as_deref(), expected);
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(65535, true)]
    #[case(65536, false)]
    fn test_ports(#[case] port: u32, #[case] ok: bool) {
        assert_eq!(validate_port(port).is_ok(), ok);
    }

    #[rstest]
    #[case("projects", true)]
    #[case("projects/web", true)]
    #[case("../etc", false)]
    #[case("a/../../b", false)]
    #[case("/abs", false)]
    #[case("", false)]
    fn test_data_paths(#[case] path: &str, #[case] ok: bool) {
        assert_eq!(validate_data_path(path).is_ok(), ok);
    }

    #[test]
    fn test_snapshot_names_accept_generated_form() {
        assert!(validate_snapshot_name("20260301-120000").is_ok());
        assert!(validate_snapshot_name("before-upgrade").is_ok());
        assert!(validate_snapshot_name("../x").is_err());
    }

    #[test]
    fn test_full_name_shape() {
        assert!(is_valid_full_name("alice-dev"));
        assert!(!is_valid_full_name("alice"));
        assert!(!is_valid_full_name("../alice-dev"));
    }
}
