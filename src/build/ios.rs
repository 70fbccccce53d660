//! iOS build discovery
//!
//! iOS builds are `.ipa` archives. The bundle identifier is read from the
//! `Info.plist` inside the archive's `Payload/<Name>.app` directory.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::catalog::candidate_directories;
use super::naming::parse_build_name;
use super::{Build, BuildArtifact, BuildFlags, BuildSource, Platform};
use crate::common::{Error, Result};

static INFO_PLIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Payload/[^/]+\.app/Info\.plist$").expect("static regex"));
static BUNDLE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<key>CFBundleIdentifier</key>\s*<string>([^<]+)</string>").expect("static regex")
});

/// Extract the bundle identifier from an XML property list
pub fn bundle_id_from_plist(plist: &str) -> Option<String> {
    BUNDLE_ID
        .captures(plist)
        .map(|c| c[1].trim().to_string())
}

/// Read the bundle identifier from an IPA
pub fn read_bundle_id(ipa: &Path) -> Result<String> {
    let file = File::open(ipa)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| Error::manifest(ipa, &e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::manifest(ipa, &e.to_string()))?;
        if !INFO_PLIST.is_match(entry.name()) {
            continue;
        }

        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        let text = String::from_utf8_lossy(&bytes);
        return bundle_id_from_plist(&text).ok_or_else(|| {
            Error::manifest(ipa, "Info.plist has no CFBundleIdentifier (binary plists are not supported)")
        });
    }

    Err(Error::manifest(ipa, "no Payload/*.app/Info.plist entry"))
}

/// Finds `.ipa` packages
pub struct IosBuildSource;

impl IosBuildSource {
    fn build_from_ipa(&self, project: &str, dir: &Path, ipa: &Path) -> Result<Option<Build>> {
        let file_name = ipa
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(parsed) = parse_build_name(project, &file_name) else {
            return Ok(None);
        };

        let bundle_id = read_bundle_id(ipa)?;

        Ok(Some(Build {
            platform: Platform::IOS,
            configuration: parsed.configuration,
            role: parsed.role,
            shared: parsed.shared,
            flags: BuildFlags::PACKAGED | BuildFlags::CAN_REPLACE_COMMAND_LINE | parsed.flags(),
            package_name: bundle_id,
            artifact: BuildArtifact {
                package_path: ipa.to_path_buf(),
                files: Default::default(),
            },
            source_dir: dir.to_path_buf(),
            source: self.build_name(),
        }))
    }
}

impl BuildSource for IosBuildSource {
    fn build_name(&self) -> &'static str {
        "IosBuildSource"
    }

    fn can_support_platform(&self, platform: Platform) -> bool {
        platform == Platform::IOS
    }

    fn get_builds_at_path(&self, project: &str, path: &Path, max_recursion: usize) -> Vec<Build> {
        let mut builds = Vec::new();

        for dir in candidate_directories(path, Platform::IOS, max_recursion) {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let ipa = entry.path();
                if !ipa
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case("ipa"))
                    .unwrap_or(false)
                {
                    continue;
                }
                match self.build_from_ipa(project, &dir, &ipa) {
                    Ok(Some(build)) => builds.push(build),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Skipping {}: {}", ipa.display(), e),
                }
            }
        }

        builds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>CFBundleName</key>
    <string>Orion</string>
    <key>CFBundleIdentifier</key>
    <string>com.epicgames.orion</string>
</dict>
</plist>"#;

    #[test]
    fn test_bundle_id_from_plist() {
        assert_eq!(
            bundle_id_from_plist(PLIST).as_deref(),
            Some("com.epicgames.orion")
        );
        assert_eq!(bundle_id_from_plist("<plist/>"), None);
    }

    #[test]
    fn test_read_bundle_id_from_ipa() {
        let dir = tempfile::tempdir().unwrap();
        let ipa = dir.path().join("OrionClient-IOS-Test.ipa");

        let file = File::create(&ipa).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("Payload/OrionClient.app/Info.plist", options)
            .unwrap();
        zip.write_all(PLIST.as_bytes()).unwrap();
        zip.finish().unwrap();

        assert_eq!(read_bundle_id(&ipa).unwrap(), "com.epicgames.orion");
    }

    #[test]
    fn test_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let ipa = dir.path().join("broken.ipa");
        std::fs::write(&ipa, b"not a zip").unwrap();
        assert!(matches!(
            read_bundle_id(&ipa).unwrap_err(),
            Error::Manifest { .. }
        ));
    }
}
