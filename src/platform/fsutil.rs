//! Small filesystem utilities.

use globset::{Glob, GlobSet, GlobSetBuilder};

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{SimError, SimResult};

pub const DEFAULT_SCENARIO_GLOBS: [&str; 3] =
    ["scenarios/**/*.yaml", "scenarios/**/*.yml", "scenarios/**/*.json"];

/// Files under `root` whose root-relative path matches any pattern, sorted.
pub fn find_matching_files(root: &Path, patterns: &[String]) -> SimResult<Vec<PathBuf>> {
    let set = compile_globset(patterns)?;
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let msg = e.to_string();
            SimError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other(msg)),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let p = entry.path();
        let rel = p.strip_prefix(root).unwrap_or(p);
        if set.is_match(rel) {
            out.push(p.to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}

fn compile_globset(patterns: &[String]) -> SimResult<GlobSet> {
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        let g = Glob::new(p)
            .map_err(|e| SimError::InvalidArgument(format!("invalid glob {p:?}: {e}")))?;
        b.add(g);
    }
    b.build()
        .map_err(|e| SimError::InvalidArgument(format!("invalid globset: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_relative_to_root_and_sorts() {
        let root = std::env::temp_dir().join(format!("dfasim-fsutil-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("scenarios/nested")).expect("dirs");
        for name in ["scenarios/b.yaml", "scenarios/nested/a.json", "scenarios/notes.txt"] {
            std::fs::write(root.join(name), "x").expect("write");
        }
        let patterns: Vec<String> = DEFAULT_SCENARIO_GLOBS.iter().map(|s| s.to_string()).collect();
        let found = find_matching_files(&root, &patterns).expect("walk");
        assert_eq!(
            found,
            vec![root.join("scenarios/b.yaml"), root.join("scenarios/nested/a.json")]
        );
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let err = find_matching_files(Path::new("."), &["a[".to_string()]).expect_err("must fail");
        assert!(err.to_string().contains("invalid glob"));
    }
}
