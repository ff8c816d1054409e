use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::TrainingError;

/// Returns `base/name` if unused, otherwise `base/{name}{n}` with `n` one past
/// the largest existing suffix (`exp`, `exp2`, `exp3`, ...).
pub fn increment_path(base: &Path, name: &str) -> Result<PathBuf, TrainingError> {
    let candidate = base.join(name);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let mut highest = 1usize;
    let entries = fs::read_dir(base).map_err(|err| {
        TrainingError::runtime(format!("failed to list {}: {err}", base.display()))
    })?;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(suffix) = file_name.to_str().and_then(|n| n.strip_prefix(name)) else {
            continue;
        };
        if let Ok(n) = suffix.parse::<usize>() {
            highest = highest.max(n);
        }
    }
    Ok(base.join(format!("{name}{}", highest + 1)))
}

/// Resolves and creates the run directory.
pub fn create_run_dir(base: &Path, name: &str) -> Result<PathBuf, TrainingError> {
    fs::create_dir_all(base).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", base.display()))
    })?;
    let dir = increment_path(base, name)?;
    fs::create_dir(&dir).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", dir.display()))
    })?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_past_existing_runs() {
        let dir = tempfile::tempdir().unwrap();
        let first = create_run_dir(dir.path(), "exp").unwrap();
        let second = create_run_dir(dir.path(), "exp").unwrap();
        let third = create_run_dir(dir.path(), "exp").unwrap();
        assert_eq!(first, dir.path().join("exp"));
        assert_eq!(second, dir.path().join("exp2"));
        assert_eq!(third, dir.path().join("exp3"));
    }

    #[test]
    fn ignores_unrelated_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("exp")).unwrap();
        fs::create_dir(dir.path().join("exp7")).unwrap();
        fs::create_dir(dir.path().join("exp_old")).unwrap();
        fs::create_dir(dir.path().join("other9")).unwrap();
        assert_eq!(
            increment_path(dir.path(), "exp").unwrap(),
            dir.path().join("exp8")
        );
        assert_eq!(
            increment_path(dir.path(), "fresh").unwrap(),
            dir.path().join("fresh")
        );
    }
}
