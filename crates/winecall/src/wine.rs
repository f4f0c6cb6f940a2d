//! Wine prefix handling and path translation.

use std::fs::{self, File};
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use winecall_abi::Arch;

use crate::config::SessionConfig;
use crate::error::{Result, WinecallError};

/// Environment every Wine command of a session runs in.
#[derive(Debug, Clone)]
pub struct WineEnvironment {
    arch: Arch,
    prefix: PathBuf,
    native_drive: char,
}

impl WineEnvironment {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            arch: config.arch,
            prefix: config.wine_prefix(),
            native_drive: config.native_drive,
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// A command with `WINEARCH` and `WINEPREFIX` set for this session.
    pub fn command(&self, program: &str) -> Command {
        let mut command = Command::new(program);
        command
            .env("WINEARCH", self.arch.as_str())
            .env("WINEPREFIX", &self.prefix);
        command
    }

    /// Creates the prefix with `wineboot -i` unless it already exists.
    pub fn ensure_prefix(&self) -> Result<()> {
        if self.prefix.is_dir() {
            return Ok(());
        }
        if let Some(parent) = self.prefix.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                WinecallError::Startup(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        log::info!("creating Wine prefix {}", self.prefix.display());
        let status = self
            .command("wineboot")
            .arg("-i")
            .stdin(Stdio::null())
            .status()
            .map_err(|e| WinecallError::Startup(format!("cannot run wineboot: {e}")))?;
        if !status.success() {
            return Err(WinecallError::Startup(format!(
                "wineboot -i failed with {status}"
            )));
        }
        Ok(())
    }

    /// Directory the wineserver of this prefix keeps its lock and socket in.
    pub fn server_dir(&self) -> Result<PathBuf> {
        let metadata = fs::metadata(&self.prefix).map_err(|e| {
            WinecallError::Startup(format!("cannot stat {}: {e}", self.prefix.display()))
        })?;
        // SAFETY: getuid has no preconditions.
        let uid = unsafe { libc::getuid() };
        Ok(PathBuf::from("/tmp")
            .join(format!(".wine-{uid}"))
            .join(format!("server-{:x}-{:x}", metadata.dev(), metadata.ino())))
    }

    /// Polls until the wineserver holds its lock file.
    pub fn wait_for_wineserver(&self, timeout: Duration, poll: Duration) -> Result<()> {
        let lock = self.server_dir()?.join("lock");
        log::debug!("waiting for wineserver lock at {}", lock.display());
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if lock_is_held(&lock) {
                log::debug!(
                    "wineserver is up after {:.2}s ({attempts} attempts)",
                    started.elapsed().as_secs_f64()
                );
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(WinecallError::Startup(format!(
                    "wineserver did not lock {} within {:.1}s",
                    lock.display(),
                    timeout.as_secs_f64()
                )));
            }
            thread::sleep(poll);
        }
    }

    pub fn translate_path(&self, path: &Path) -> Result<String> {
        translate_path(path, self.native_drive)
    }

    pub fn wine_to_unix(&self, path: &str) -> Result<PathBuf> {
        wine_to_unix(path, self.native_drive, &self.prefix)
    }
}

/// Maps a unix path to the Wine drive that exposes the unix root:
/// `/a/b` becomes `Z:\a\b`. Relative paths are resolved against the
/// current directory first.
pub fn translate_path(path: &Path, drive: char) -> Result<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut parts: Vec<String> = Vec::new();
    for component in absolute.components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    WinecallError::Config(format!("{} is not valid UTF-8", path.display()))
                })?;
                parts.push(part.to_string());
            }
        }
    }
    Ok(format!(
        "{}:\\{}",
        drive.to_ascii_uppercase(),
        parts.join("\\")
    ))
}

/// Maps an absolute Wine path back to the unix file it names. The native
/// drive maps onto the unix root; any other drive letter resolves through
/// the prefix's `dosdevices` links. Both separators are accepted, as is
/// the NT `\??\` prefix.
pub fn wine_to_unix(path: &str, drive: char, prefix: &Path) -> Result<PathBuf> {
    let trimmed = path.strip_prefix("\\??\\").unwrap_or(path);
    let mut chars = trimmed.chars();
    let (letter, rest) = match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => (letter, chars.as_str()),
        _ => {
            return Err(WinecallError::Config(format!(
                "{path} is not an absolute Wine path"
            )))
        }
    };
    if !rest.is_empty() && !rest.starts_with(['\\', '/']) {
        return Err(WinecallError::Config(format!(
            "{path} is relative to the current directory of drive {letter}:"
        )));
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in rest.split(['\\', '/']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }

    let mut unix = if letter.eq_ignore_ascii_case(&drive) {
        PathBuf::from("/")
    } else {
        prefix
            .join("dosdevices")
            .join(format!("{}:", letter.to_ascii_lowercase()))
    };
    unix.extend(parts);
    Ok(unix)
}

/// True when some process holds a write lock on `path`.
fn lock_is_held(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    // SAFETY: an all-zero flock is a valid value to fill in.
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    // SAFETY: the descriptor is open for the duration of the call and
    // `lock` is a valid flock.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &mut lock) };
    rc == 0 && lock.l_type != libc::F_UNLCK as libc::c_short
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_absolute_path() {
        assert_eq!(
            translate_path(Path::new("/a/b"), 'Z').unwrap(),
            "Z:\\a\\b"
        );
        assert_eq!(
            translate_path(Path::new("/home/user/lib/demo.dll"), 'z').unwrap(),
            "Z:\\home\\user\\lib\\demo.dll"
        );
        assert_eq!(translate_path(Path::new("/"), 'Z').unwrap(), "Z:\\");
        assert_eq!(
            translate_path(Path::new("/a/./b/../c"), 'Z').unwrap(),
            "Z:\\a\\c"
        );
    }

    #[test]
    fn test_wine_to_unix_native_drive() {
        let prefix = Path::new("/p");
        assert_eq!(
            wine_to_unix("Z:\\home\\user\\demo.dll", 'Z', prefix).unwrap(),
            PathBuf::from("/home/user/demo.dll")
        );
        assert_eq!(
            wine_to_unix("z:/a/./b/../c", 'Z', prefix).unwrap(),
            PathBuf::from("/a/c")
        );
        assert_eq!(wine_to_unix("Z:\\", 'Z', prefix).unwrap(), PathBuf::from("/"));
        assert_eq!(wine_to_unix("Y:", 'y', prefix).unwrap(), PathBuf::from("/"));
        assert_eq!(
            wine_to_unix("\\??\\Z:\\tmp\\x.dll", 'Z', prefix).unwrap(),
            PathBuf::from("/tmp/x.dll")
        );
    }

    #[test]
    fn test_wine_to_unix_other_drives_use_dosdevices() {
        let prefix = Path::new("/home/user/.wine");
        assert_eq!(
            wine_to_unix("C:\\windows\\system32\\kernel32.dll", 'Z', prefix).unwrap(),
            PathBuf::from("/home/user/.wine/dosdevices/c:/windows/system32/kernel32.dll")
        );
    }

    #[test]
    fn test_wine_to_unix_rejects_non_absolute_paths() {
        let prefix = Path::new("/p");
        for path in ["demo.dll", "\\lib\\demo.dll", "Z:demo.dll", "1:\\a", ""] {
            assert!(
                matches!(wine_to_unix(path, 'Z', prefix), Err(WinecallError::Config(_))),
                "{path}"
            );
        }
    }

    #[test]
    fn test_paths_survive_a_round_trip() {
        let prefix = Path::new("/p");
        for path in ["/", "/opt/lib/demo.dll", "/home/user/My Libraries/a b.dll"] {
            let foreign = translate_path(Path::new(path), 'Z').unwrap();
            assert_eq!(wine_to_unix(&foreign, 'z', prefix).unwrap(), PathBuf::from(path));
        }
    }

    #[test]
    fn test_translate_relative_path() {
        let translated = translate_path(Path::new("demo.dll"), 'Z').unwrap();
        assert!(translated.starts_with("Z:\\"));
        assert!(translated.ends_with("\\demo.dll"));
    }

    #[test]
    fn test_command_environment() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            arch: Arch::Win32,
            dir: dir.path().to_path_buf(),
            ..SessionConfig::default()
        };
        let wine = WineEnvironment::new(&config);
        assert_eq!(wine.prefix(), dir.path().join("win32-wine"));
        let command = wine.command("wine");
        let envs: Vec<_> = command.get_envs().collect();
        assert!(envs.contains(&(
            std::ffi::OsStr::new("WINEARCH"),
            Some(std::ffi::OsStr::new("win32"))
        )));
        assert!(envs.iter().any(|(key, _)| *key == "WINEPREFIX"));
    }

    #[test]
    fn test_server_dir_uses_prefix_identity() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            dir: dir.path().to_path_buf(),
            ..SessionConfig::default()
        };
        let wine = WineEnvironment::new(&config);
        assert!(wine.server_dir().is_err());

        fs::create_dir_all(wine.prefix()).unwrap();
        let server_dir = wine.server_dir().unwrap();
        let name = server_dir.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("server-"));
        assert!(server_dir.starts_with("/tmp"));
    }

    #[test]
    fn test_unlocked_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("lock");
        assert!(!lock_is_held(&lock));
        fs::write(&lock, b"").unwrap();
        assert!(!lock_is_held(&lock));
    }
}
