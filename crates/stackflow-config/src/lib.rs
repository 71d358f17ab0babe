pub mod error;

pub use error::*;

use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the stack file directly
pub const CONFIG_PATH_ENV: &str = "STACKFLOW_CONFIG_PATH";

/// Project-local directory holding stack files, state and the apply lock
pub const PROJECT_DIR: &str = ".stackflow";

/// Candidate names, highest priority first
pub const STACK_FILE_NAMES: [&str; 4] = [
    "stack.local.kdl",
    ".stack.local.kdl",
    "stack.kdl",
    ".stack.kdl",
];

/// Where a stack file was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackFileSource {
    Env,
    CurrentDir,
    ProjectDir,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFile {
    pub path: PathBuf,
    pub source: StackFileSource,
}

/// Per-user StackFlow config directory (`~/.config/stackflow`), created on demand
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("stackflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Find the stack file for the current directory.
///
/// Search order:
/// 1. `STACKFLOW_CONFIG_PATH`
/// 2. current directory: stack.local.kdl, .stack.local.kdl, stack.kdl, .stack.kdl
/// 3. `./.stackflow/`, same order
/// 4. `~/.config/stackflow/stack.kdl`
pub fn find_stack_file() -> Result<StackFile> {
    let current_dir = std::env::current_dir()?;
    find_stack_file_from(&current_dir)
}

/// Same as [`find_stack_file`], rooted at `dir`
pub fn find_stack_file_from(dir: &Path) -> Result<StackFile> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV)
        && !config_path.is_empty()
    {
        let path = PathBuf::from(config_path);
        if !path.is_file() {
            return Err(ConfigError::ConfigPathMissing(path));
        }
        debug!(path = %path.display(), "Stack file from environment");
        return Ok(StackFile {
            path,
            source: StackFileSource::Env,
        });
    }

    if let Some(path) = first_existing(dir) {
        return Ok(StackFile {
            path,
            source: StackFileSource::CurrentDir,
        });
    }

    let project_dir = dir.join(PROJECT_DIR);
    if project_dir.is_dir()
        && let Some(path) = first_existing(&project_dir)
    {
        return Ok(StackFile {
            path,
            source: StackFileSource::ProjectDir,
        });
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("stackflow").join("stack.kdl");
        if global.is_file() {
            return Ok(StackFile {
                path: global,
                source: StackFileSource::Global,
            });
        }
    }

    Err(ConfigError::StackFileNotFound)
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    STACK_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// `.stackflow/` next to the stack file, unless the file already lives there
pub fn project_dir_for(stack_file: &Path) -> PathBuf {
    let parent = stack_file.parent().unwrap_or_else(|| Path::new("."));
    if parent.file_name().and_then(|n| n.to_str()) == Some(PROJECT_DIR) {
        parent.to_path_buf()
    } else {
        parent.join(PROJECT_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn find_in(dir: &Path) -> Result<StackFile> {
        temp_env::with_var_unset(CONFIG_PATH_ENV, || find_stack_file_from(dir))
    }

    #[test]
    fn test_get_config_dir() {
        let config_dir = get_config_dir().unwrap();
        assert!(config_dir.ends_with("stackflow"));
        assert!(config_dir.exists());
    }

    #[test]
    #[serial]
    fn test_find_stack_file_in_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("stack.kdl"), "// test").unwrap();

        let found = find_in(temp_dir.path()).unwrap();
        assert!(found.path.ends_with("stack.kdl"));
        assert_eq!(found.source, StackFileSource::CurrentDir);
    }

    #[test]
    #[serial]
    fn test_local_file_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("stack.kdl"), "// shared").unwrap();
        fs::write(temp_dir.path().join(".stack.local.kdl"), "// local").unwrap();

        let found = find_in(temp_dir.path()).unwrap();
        assert!(found.path.ends_with(".stack.local.kdl"));
    }

    #[test]
    #[serial]
    fn test_find_stack_file_in_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let project_dir = temp_dir.path().join(PROJECT_DIR);
        fs::create_dir(&project_dir).unwrap();
        fs::write(project_dir.join("stack.kdl"), "// nested").unwrap();

        let found = find_in(temp_dir.path()).unwrap();
        assert!(found.path.ends_with(".stackflow/stack.kdl"));
        assert_eq!(found.source, StackFileSource::ProjectDir);
        assert_eq!(project_dir_for(&found.path), project_dir);
    }

    #[test]
    #[serial]
    fn test_env_var_takes_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("stack.kdl"), "// ignored").unwrap();
        let custom = temp_dir.path().join("custom.kdl");
        fs::write(&custom, "// custom").unwrap();

        let found = temp_env::with_var(CONFIG_PATH_ENV, Some(&custom), || {
            find_stack_file_from(temp_dir.path())
        })
        .unwrap();
        assert_eq!(found.path, custom);
        assert_eq!(found.source, StackFileSource::Env);
    }

    #[test]
    #[serial]
    fn test_env_var_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let missing = temp_dir.path().join("nope.kdl");

        let result = temp_env::with_var(CONFIG_PATH_ENV, Some(&missing), || {
            find_stack_file_from(temp_dir.path())
        });
        assert!(matches!(result, Err(ConfigError::ConfigPathMissing(_))));
    }

    #[test]
    #[serial]
    fn test_find_stack_file_from_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        fs::write(temp_dir.path().join("stack.kdl"), "// cwd").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();
        let result = temp_env::with_var_unset(CONFIG_PATH_ENV, find_stack_file);
        std::env::set_current_dir(original_dir).unwrap();

        assert!(result.unwrap().path.ends_with("stack.kdl"));
    }

    #[test]
    fn test_project_dir_for_plain_file() {
        assert_eq!(
            project_dir_for(Path::new("/work/app/stack.kdl")),
            PathBuf::from("/work/app/.stackflow")
        );
    }
}
