use std::cmp::Ordering;

use crate::datastore::PackageVersion;

mod registry;

pub use registry::RegistryService;

fn precedence(a: &PackageVersion, b: &PackageVersion) -> Ordering {
    match (
        semver::Version::parse(&a.version),
        semver::Version::parse(&b.version),
    ) {
        // Build metadata never affects precedence; equal-precedence versions
        // tie-break on the newest publish time.
        (Ok(va), Ok(vb)) => va
            .cmp_precedence(&vb)
            .then(a.published_at.cmp(&b.published_at)),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.published_at.cmp(&b.published_at),
    }
}

fn is_stable(version: &PackageVersion) -> bool {
    semver::Version::parse(&version.version)
        .map(|v| v.pre.is_empty())
        .unwrap_or(false)
}

/// Picks the `latest` version for a listing document.
///
/// Preference order: greatest non-retracted stable version, then greatest
/// non-retracted pre-release, then greatest overall. Retraction never hides a
/// version from the document, it only disqualifies it from `latest` while
/// alternatives exist.
pub fn select_latest(versions: &[PackageVersion]) -> Option<&PackageVersion> {
    versions
        .iter()
        .filter(|v| !v.is_retracted && is_stable(v))
        .max_by(|a, b| precedence(a, b))
        .or_else(|| {
            versions
                .iter()
                .filter(|v| !v.is_retracted)
                .max_by(|a, b| precedence(a, b))
        })
        .or_else(|| versions.iter().max_by(|a, b| precedence(a, b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn version(v: &str, retracted: bool, age_minutes: i64) -> PackageVersion {
        PackageVersion {
            package_name: "foo".to_string(),
            version: v.to_string(),
            pubspec: serde_json::json!({"name": "foo", "version": v}),
            archive_key: format!("hosted-packages/foo/{v}/aa.tar.gz"),
            archive_sha256: "aa".repeat(32),
            upstream_archive_url: None,
            published_at: Utc::now() - Duration::minutes(age_minutes),
            is_retracted: retracted,
            retracted_at: None,
            retraction_message: None,
            download_count: 0,
        }
    }

    #[test]
    fn stable_beats_newer_prerelease() {
        let versions = vec![
            version("1.0.0", false, 60),
            version("2.0.0-beta.1", false, 1),
        ];
        assert_eq!(select_latest(&versions).unwrap().version, "1.0.0");
    }

    #[test]
    fn prerelease_wins_when_no_stable_exists() {
        let versions = vec![
            version("1.0.0-alpha.1", false, 60),
            version("1.0.0-beta.2", false, 1),
        ];
        assert_eq!(select_latest(&versions).unwrap().version, "1.0.0-beta.2");
    }

    #[test]
    fn retracted_versions_lose_unless_nothing_else_exists() {
        let versions = vec![version("2.0.0", true, 1), version("1.0.0", false, 60)];
        assert_eq!(select_latest(&versions).unwrap().version, "1.0.0");

        let only_retracted = vec![version("1.0.0", true, 1)];
        assert_eq!(select_latest(&only_retracted).unwrap().version, "1.0.0");
    }

    #[test]
    fn build_metadata_ties_break_by_publish_time() {
        let versions = vec![
            version("1.0.0+build.1", false, 60),
            version("1.0.0+build.2", false, 1),
        ];
        assert_eq!(
            select_latest(&versions).unwrap().version,
            "1.0.0+build.2",
            "equal precedence resolves to the newest publish"
        );
    }

    #[test]
    fn empty_input_has_no_latest() {
        assert!(select_latest(&[]).is_none());
    }
}
