// SPDX-License-Identifier: MIT
//! C3 — Packager.
//!
//! Pure transform from a file sequence + build plan into the driver-neutral
//! package every [`crate::drivers::ProviderDriver`] consumes: a path→digest
//! map and a path→bytes map, iteration-stable.

use crate::error::{ErrorKind, OrchestratorError};
use crate::planner::BuildPlan;
use crate::snapshot::ProjectFile;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Driver-neutral package. `BTreeMap` gives the required stable iteration
/// order for free.
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub digest_by_path: BTreeMap<String, String>,
    pub content_by_path: BTreeMap<String, Vec<u8>>,
}

/// Validates an already-normalized path (no leading `/` — [`normalize`]
/// strips that before calling this).
fn validate_path(path: &str) -> Result<(), OrchestratorError> {
    if path.split('/').any(|seg| seg == "..") {
        return Err(OrchestratorError::new(
            ErrorKind::InvalidSnapshot,
            format!("path traversal rejected: {path}"),
        ));
    }
    if path.as_bytes().contains(&0) {
        return Err(OrchestratorError::new(
            ErrorKind::InvalidSnapshot,
            format!("NUL byte in path: {path}"),
        ));
    }
    Ok(())
}

/// Normalize a source path (which may carry a leading `/`) into the
/// packaged, driver-facing form, then validate the result.
fn normalize(path: &str) -> Result<String, OrchestratorError> {
    let trimmed = path.trim_start_matches('/').to_string();
    validate_path(&trimmed)?;
    Ok(trimmed)
}

/// Content digest, SHA-1 hex — the packager's default when a driver doesn't
/// name a different hash. Content-digest-style drivers (Netlify-shaped) key
/// their manifests and upload paths off this exact digest, so a driver
/// needing a different algorithm takes bytes in and a hex string out,
/// the same shape, rather than changing this function.
fn content_digest(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Package a file sequence against a resolved build plan. `plan` is
/// currently unused by the digesting step itself but is part of the
/// contract so a future per-framework packaging rule (e.g. excluding an
/// output directory) has a stable seam to hang off; kept as a parameter
/// rather than dropped, since every driver call site already has it handy.
pub fn package(files: &[ProjectFile], _plan: &BuildPlan) -> Result<Package, OrchestratorError> {
    let mut pkg = Package::default();
    for file in files {
        if file.is_dir {
            continue;
        }
        let path = normalize(&file.path)?;
        let digest = content_digest(&file.content);
        pkg.digest_by_path.insert(path.clone(), digest);
        pkg.content_by_path.insert(path, file.content.clone());
    }
    Ok(pkg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str) -> ProjectFile {
        ProjectFile::file(path, content, "text/plain")
    }

    #[test]
    fn strips_leading_slash_and_skips_dirs() {
        let files = vec![
            file("/index.html", "<h1>Hi</h1>"),
            ProjectFile {
                is_dir: true,
                ..ProjectFile::file("/assets", "", "")
            },
        ];
        let pkg = package(&files, &BuildPlan::default()).unwrap();
        assert_eq!(pkg.content_by_path.len(), 1);
        assert!(pkg.content_by_path.contains_key("index.html"));
    }

    #[test]
    fn rejects_path_traversal() {
        let files = vec![file("/../etc/passwd", "x")];
        let err = package(&files, &BuildPlan::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidSnapshot);
    }

    #[test]
    fn rejects_nul_byte() {
        let files = vec![file("/bad\0path", "x")];
        let err = package(&files, &BuildPlan::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidSnapshot);
    }

    #[test]
    fn is_deterministic_and_order_stable() {
        let files = vec![file("/b.txt", "2"), file("/a.txt", "1")];
        let pkg = package(&files, &BuildPlan::default()).unwrap();
        let paths: Vec<&String> = pkg.content_by_path.keys().collect();
        assert_eq!(paths, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn round_trip_reproduces_content_byte_for_byte() {
        let files = vec![file("/index.html", "<h1>Hi</h1>"), file("/app.js", "console.log(1)")];
        let pkg = package(&files, &BuildPlan::default()).unwrap();
        for f in &files {
            let path = f.path.trim_start_matches('/');
            assert_eq!(pkg.content_by_path.get(path).unwrap(), &f.content);
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_safe_path() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(/[a-z]{1,8}){0,2}\\.[a-z]{2,4}"
    }

    proptest! {
        // Package ∘ Unpackage (the identity function here, since Package
        // already holds raw bytes keyed by normalized path) reproduces the
        // input file set byte-for-byte excluding directories.
        #[test]
        fn package_round_trip_preserves_bytes(
            paths_and_bodies in prop::collection::vec((arb_safe_path(), ".{0,64}"), 1..8)
        ) {
            let mut seen = std::collections::HashSet::new();
            let files: Vec<ProjectFile> = paths_and_bodies
                .into_iter()
                .filter(|(p, _)| seen.insert(p.clone()))
                .map(|(p, body)| ProjectFile::file(format!("/{p}"), body, "text/plain"))
                .collect();

            let pkg = package(&files, &BuildPlan::default()).unwrap();
            for f in &files {
                let normalized = f.path.trim_start_matches('/');
                prop_assert_eq!(pkg.content_by_path.get(normalized), Some(&f.content));
            }
            prop_assert_eq!(pkg.content_by_path.len(), files.len());
        }
    }
}
