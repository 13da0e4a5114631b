//! Enumeration of upload candidates on the locally mounted volume.

use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

use super::models::HarvestCandidate;

/// OS clutter hosts drop on removable media.
const IGNORED_NAMES: &[&str] = &["desktop.ini", "Thumbs.db"];

/// Hidden names (and everything under hidden directories) and OS clutter
/// are never uploaded.
pub fn is_eligible_name(name: &str) -> bool {
    !name.starts_with('.')
        && !IGNORED_NAMES
            .iter()
            .any(|ignored| name.eq_ignore_ascii_case(ignored))
}

/// Regular files under `root`, sorted by path. A missing root yields none.
pub fn enumerate_candidates(root: &Path) -> io::Result<Vec<HarvestCandidate>> {
    let mut candidates = Vec::new();
    match scan(root, Path::new(""), &mut candidates) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        other => other?,
    }
    candidates.sort_by(|a, b| a.absolute_path.cmp(&b.absolute_path));
    Ok(candidates)
}

fn scan(
    dir: &Path,
    relative_dir: &Path,
    candidates: &mut Vec<HarvestCandidate>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        let name = entry.file_name();
        if !is_eligible_name(&name.to_string_lossy()) {
            continue;
        }

        // Don't follow symlinks off the volume
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            if let Err(e) = scan(&path, &relative_dir.join(&name), candidates) {
                warn!(path = %path.display(), error = %e, "Skipping unreadable directory");
            }
        } else if metadata.is_file() {
            candidates.push(HarvestCandidate {
                absolute_path: path,
                relative_dir: relative_dir.to_path_buf(),
                size_bytes: metadata.len(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn test_eligible_names() {
        assert!(is_eligible_name("scan_001.pdf"));
        assert!(!is_eligible_name(".DS_Store"));
        assert!(!is_eligible_name(".Trashes"));
        assert!(!is_eligible_name("desktop.ini"));
        assert!(!is_eligible_name("Desktop.ini"));
        assert!(!is_eligible_name("Thumbs.db"));
    }

    #[test]
    fn test_enumerate_skips_hidden_and_clutter() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("reports/2024")).unwrap();
        fs::create_dir_all(root.join(".Spotlight-V100/Store")).unwrap();
        fs::create_dir_all(root.join("System Volume Information")).unwrap();

        fs::write(root.join("a.txt"), b"hello").unwrap();
        fs::write(root.join("reports/2024/q1.csv"), vec![0u8; 2048]).unwrap();
        fs::write(root.join(".hidden"), b"x").unwrap();
        fs::write(root.join("Thumbs.db"), b"x").unwrap();
        fs::write(root.join("reports/desktop.ini"), b"x").unwrap();
        fs::write(root.join(".Spotlight-V100/Store/index"), b"x").unwrap();

        let candidates = enumerate_candidates(root).unwrap();

        assert_eq!(
            candidates,
            vec![
                HarvestCandidate {
                    absolute_path: root.join("a.txt"),
                    relative_dir: PathBuf::new(),
                    size_bytes: 5,
                },
                HarvestCandidate {
                    absolute_path: root.join("reports/2024/q1.csv"),
                    relative_dir: PathBuf::from("reports/2024"),
                    size_bytes: 2048,
                },
            ]
        );
    }

    #[test]
    fn test_missing_root_is_empty() {
        let temp = tempdir().unwrap();
        let candidates = enumerate_candidates(&temp.path().join("outbox")).unwrap();
        assert!(candidates.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed() {
        let temp = tempdir().unwrap();
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).unwrap();

        assert!(enumerate_candidates(temp.path()).unwrap().is_empty());
    }
}
