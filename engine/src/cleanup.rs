use std::path::Path;

use crate::segment::is_owned_by;

/// Deletes every file in the segment directory `dir` that does not belong to
/// one of the `keep` track ids. Subdirectories are left alone.
///
/// Returns the number of files removed. A missing directory counts as empty.
pub fn delete_unreferenced(dir: &Path, keep: &[String]) -> anyhow::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => anyhow::bail!("failed to read_dir({}): {e}", dir.display()),
    };

    let mut removed = 0;
    for ent in entries {
        let ent = ent.map_err(|e| anyhow::anyhow!("failed to read_dir entry: {e}"))?;
        let path = ent.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if keep.iter().any(|id| is_owned_by(name, id)) {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            // Another sweep got there first.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("cleanup: could not remove {}: {e}", path.display()),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"x").unwrap();
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn keeps_only_referenced_tracks() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a-0.ts", "a-1.ts", "a.m3u8", "b-0.ts", "b.m3u8", "ab-0.ts"] {
            touch(dir.path(), name);
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let removed = delete_unreferenced(dir.path(), &["a".to_string()]).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(listing(dir.path()), ["a-0.ts", "a-1.ts", "a.m3u8", "nested"]);
    }

    #[test]
    fn empty_keep_list_clears_directory() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "x-0.ts");
        touch(dir.path(), "x.m3u8");
        assert_eq!(delete_unreferenced(dir.path(), &[]).unwrap(), 2);
        assert!(listing(dir.path()).is_empty());
    }

    #[test]
    fn missing_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(delete_unreferenced(&dir.path().join("gone"), &[]).unwrap(), 0);
    }
}
