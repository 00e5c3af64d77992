use crate::RuntimeError;
use braintrace_schema::SpawnCommand;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolve the executable for `command`.
///
/// Candidates (the program, then its fallbacks) are tried in order. A
/// candidate containing a path separator is taken relative to the config's
/// base directory. A bare name is looked up in the configured search paths,
/// the directory of the running executable, and finally `PATH`.
pub fn locate_program(command: &SpawnCommand) -> Result<PathBuf, RuntimeError> {
    let mut searched = Vec::new();
    for candidate in command.candidates() {
        if let Some(found) = locate_candidate(candidate, command, &mut searched) {
            debug!("resolved '{candidate}' to {}", found.display());
            return Ok(found);
        }
    }
    Err(RuntimeError::ProgramNotFound {
        program: command.program.clone(),
        searched,
    })
}

fn locate_candidate(
    candidate: &str,
    command: &SpawnCommand,
    searched: &mut Vec<PathBuf>,
) -> Option<PathBuf> {
    let path = Path::new(candidate);
    if path.is_absolute() || path.components().count() > 1 {
        return check(command.base_dir.join(path), searched);
    }

    let file_name = executable_name(candidate);
    command
        .search_paths
        .iter()
        .cloned()
        .chain(exe_dir())
        .chain(path_dirs())
        .find_map(|dir| check(dir.join(&file_name), searched))
}

fn check(path: PathBuf, searched: &mut Vec<PathBuf>) -> Option<PathBuf> {
    if is_executable(&path) {
        Some(path)
    } else {
        searched.push(path);
        None
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        format!("{name}.exe")
    } else {
        name.to_owned()
    }
}

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn path_dirs() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default()
}
