//! Validation of uploaded package archives.
//!
//! An archive is a gzip-compressed tar with `pubspec.yaml` at its root. The
//! walk rejects anything that could escape an unpack directory: parent or
//! absolute paths, links, and device entries.

use std::io::Read;
use std::path::Component;

use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use tar::EntryType;
use thiserror::Error;

/// `^[a-z_][a-z0-9_]*$`, at most 64 characters.
static PACKAGE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("valid regex"));

const MAX_NAME_LEN: usize = 64;

pub fn is_valid_package_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN && PACKAGE_NAME.is_match(name)
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("uploaded data is not gzip-compressed")]
    NotGzip,

    #[error("uploaded data is not a valid tar archive: {0}")]
    InvalidTar(String),

    #[error("archive entry `{0}` has an unsafe path")]
    UnsafePath(String),

    #[error("archive entry `{0}` has an unsupported type")]
    UnsupportedEntry(String),

    #[error("archive does not contain pubspec.yaml at its root")]
    MissingManifest,

    #[error("pubspec.yaml is not valid YAML: {0}")]
    InvalidManifest(String),

    #[error("pubspec.yaml is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid package name `{0}`")]
    InvalidName(String),

    #[error("invalid version `{0}`: {1}")]
    InvalidVersion(String, String),
}

/// The validated contents of an uploaded archive.
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub name: String,
    pub version: semver::Version,
    /// The version string exactly as written in the manifest; pre-release and
    /// build metadata are preserved verbatim.
    pub version_raw: String,
    /// The manifest converted to canonical JSON.
    pub pubspec: serde_json::Value,
    pub description: Option<String>,
}

/// Decodes and validates an archive, returning its manifest.
pub fn validate_archive(bytes: &[u8]) -> Result<ArchiveInfo, ArchiveError> {
    if bytes.len() < 2 || bytes[0] != 0x1f || bytes[1] != 0x8b {
        return Err(ArchiveError::NotGzip);
    }

    let decoder = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    let mut manifest: Option<Vec<u8>> = None;

    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::InvalidTar(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::InvalidTar(e.to_string()))?;
        let display_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory => {}
            _ => return Err(ArchiveError::UnsupportedEntry(display_path)),
        }

        if entry.path_bytes().first() == Some(&b'/') {
            return Err(ArchiveError::UnsafePath(display_path));
        }
        let path = entry
            .path()
            .map_err(|_| ArchiveError::UnsafePath(display_path.clone()))?
            .into_owned();
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(ArchiveError::UnsafePath(display_path)),
            }
        }

        let is_root_manifest = {
            let mut normals = path
                .components()
                .filter(|c| matches!(c, Component::Normal(_)));
            normals.next() == Some(Component::Normal("pubspec.yaml".as_ref()))
                && normals.next().is_none()
        };
        if is_root_manifest {
            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .map_err(|e| ArchiveError::InvalidTar(e.to_string()))?;
            manifest = Some(contents);
        }
    }

    let manifest = manifest.ok_or(ArchiveError::MissingManifest)?;
    parse_manifest(&manifest)
}

fn parse_manifest(bytes: &[u8]) -> Result<ArchiveInfo, ArchiveError> {
    let pubspec: serde_json::Value = serde_yaml::from_slice(bytes)
        .map_err(|e| ArchiveError::InvalidManifest(e.to_string()))?;
    if !pubspec.is_object() {
        return Err(ArchiveError::InvalidManifest(
            "manifest is not a mapping".to_string(),
        ));
    }

    let name = pubspec
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or(ArchiveError::MissingField("name"))?
        .to_string();
    if !is_valid_package_name(&name) {
        return Err(ArchiveError::InvalidName(name));
    }

    let version_raw = pubspec
        .get("version")
        .and_then(|v| v.as_str())
        .ok_or(ArchiveError::MissingField("version"))?
        .to_string();
    let version = semver::Version::parse(&version_raw)
        .map_err(|e| ArchiveError::InvalidVersion(version_raw.clone(), e.to_string()))?;

    let description = pubspec
        .get("description")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(ArchiveInfo {
        name,
        version,
        version_raw,
        pubspec,
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    pub(crate) fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        let tar = builder.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &tar).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn accepts_a_minimal_package() {
        let archive = tarball(&[
            ("pubspec.yaml", b"name: foo\nversion: 1.0.0\n"),
            ("lib/foo.dart", b"void main() {}\n"),
        ]);
        let info = validate_archive(&archive).unwrap();
        assert_eq!(info.name, "foo");
        assert_eq!(info.version_raw, "1.0.0");
        assert_eq!(info.version, semver::Version::new(1, 0, 0));
        assert_eq!(info.pubspec["name"], "foo");
    }

    #[test]
    fn preserves_prerelease_and_build_metadata() {
        let archive = tarball(&[(
            "pubspec.yaml",
            b"name: foo\nversion: 2.0.0-beta.1+build.5\ndescription: a test package\n",
        )]);
        let info = validate_archive(&archive).unwrap();
        assert_eq!(info.version_raw, "2.0.0-beta.1+build.5");
        assert_eq!(info.description.as_deref(), Some("a test package"));
    }

    #[test]
    fn rejects_non_gzip_data() {
        assert!(matches!(
            validate_archive(b"plain text"),
            Err(ArchiveError::NotGzip)
        ));
        assert!(matches!(validate_archive(b""), Err(ArchiveError::NotGzip)));
    }

    #[test]
    fn rejects_missing_manifest() {
        let archive = tarball(&[("lib/foo.dart", b"")]);
        assert!(matches!(
            validate_archive(&archive),
            Err(ArchiveError::MissingManifest)
        ));
    }

    #[test]
    fn manifest_must_be_at_the_root() {
        let archive = tarball(&[("sub/pubspec.yaml", b"name: foo\nversion: 1.0.0\n")]);
        assert!(matches!(
            validate_archive(&archive),
            Err(ArchiveError::MissingManifest)
        ));
    }

    // `tar::Builder` refuses to write `..` and absolute paths itself, so a
    // hostile archive has to be forged at the header-byte level.
    fn tarball_with_raw_path(path: &[u8], data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..path.len()].copy_from_slice(path);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, data).unwrap();
        let tar = builder.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &tar).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        let archive = tarball_with_raw_path(b"../evil.txt", b"boom");
        assert!(matches!(
            validate_archive(&archive),
            Err(ArchiveError::UnsafePath(_))
        ));
    }

    #[test]
    fn rejects_absolute_paths() {
        let archive = tarball_with_raw_path(b"/etc/crontab", b"boom");
        assert!(matches!(
            validate_archive(&archive),
            Err(ArchiveError::UnsafePath(_))
        ));
    }

    #[test]
    fn rejects_symlink_entries() {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"name: foo\nversion: 1.0.0\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "pubspec.yaml", &data[..])
            .unwrap();

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(EntryType::Symlink);
        link.set_size(0);
        link.set_cksum();
        builder
            .append_link(&mut link, "lib/link.dart", "/etc/passwd")
            .unwrap();
        let tar = builder.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &tar).unwrap();
        let archive = encoder.finish().unwrap();

        assert!(matches!(
            validate_archive(&archive),
            Err(ArchiveError::UnsupportedEntry(_))
        ));
    }

    #[test]
    fn rejects_bad_names_and_versions() {
        let archive = tarball(&[("pubspec.yaml", b"name: Foo\nversion: 1.0.0\n")]);
        assert!(matches!(
            validate_archive(&archive),
            Err(ArchiveError::InvalidName(_))
        ));

        let archive = tarball(&[("pubspec.yaml", b"name: foo\nversion: one\n")]);
        assert!(matches!(
            validate_archive(&archive),
            Err(ArchiveError::InvalidVersion(..))
        ));

        let archive = tarball(&[("pubspec.yaml", b"version: 1.0.0\n")]);
        assert!(matches!(
            validate_archive(&archive),
            Err(ArchiveError::MissingField("name"))
        ));
    }

    #[test]
    fn package_name_rules() {
        assert!(is_valid_package_name("foo"));
        assert!(is_valid_package_name("_private"));
        assert!(is_valid_package_name("http_client2"));
        assert!(!is_valid_package_name("Foo"));
        assert!(!is_valid_package_name("2fast"));
        assert!(!is_valid_package_name("has-dash"));
        assert!(!is_valid_package_name(""));
        assert!(!is_valid_package_name(&"a".repeat(65)));
    }
}
