pub const IMAGE_REPOSITORY: &str = "quay.io/k8tz/k8tz";

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Version plus the abbreviated commit when the build exports `K8TZ_GIT_COMMIT`.
pub fn version_with_metadata() -> String {
    match option_env!("K8TZ_GIT_COMMIT") {
        Some(commit) if !commit.is_empty() => {
            let short: String = commit.chars().take(14).collect();
            format!("{}+{short}", version())
        }
        _ => version().to_string(),
    }
}

pub fn image() -> String {
    format!("{IMAGE_REPOSITORY}:{}", version())
}

pub fn display_version() -> String {
    format!(
        "k8tz v{} {}/{}",
        version_with_metadata(),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
