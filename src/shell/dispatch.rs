//! Submission dispatch
//!
//! Decides what a submitted command means for the session before it goes to
//! the remote shell: a directory change to confirm first, a file transfer
//! handled locally, a full-screen program to hand the terminal to, or a
//! plain command to forward.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::parser;
use super::path;
use crate::error::DispatchError;
use crate::transfer::{Direction, TransferRequest};

/// Command words the session treats specially.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Words skipped when looking for the command (`sudo vim` is `vim`).
    pub privilege_wrappers: Vec<String>,
    /// Programs that take over the whole terminal.
    pub fullscreen_programs: Vec<String>,
    pub upload_commands: Vec<String>,
    pub download_commands: Vec<String>,
    /// Typed as a command, sends Ctrl-C to the remote shell.
    pub interrupt_command: String,
    /// Commands that change the remote tree and trigger a refresh.
    pub mutating_commands: Vec<String>,
    pub refresh_delay_ms: u64,
    /// Per-command refresh delay overrides.
    pub refresh_delays_ms: HashMap<String, u64>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            privilege_wrappers: words(&["sudo", "doas"]),
            fullscreen_programs: words(&[
                "vi", "vim", "nvim", "view", "vimdiff", "nano", "pico", "emacs", "less", "more",
                "most", "man", "top", "htop", "btop", "atop", "tmux", "screen", "mc", "ncdu",
            ]),
            upload_commands: words(&["upload", "rz"]),
            download_commands: words(&["download", "sz"]),
            interrupt_command: "^C".to_string(),
            mutating_commands: words(&[
                "rm", "rmdir", "mv", "cp", "mkdir", "touch", "ln", "tar", "unzip", "git", "wget",
            ]),
            refresh_delay_ms: 500,
            refresh_delays_ms: [("tar", 1500), ("unzip", 1500), ("git", 1000), ("wget", 2000)]
                .into_iter()
                .map(|(cmd, ms)| (cmd.to_string(), ms))
                .collect(),
        }
    }
}

impl DispatchSettings {
    pub fn refresh_delay(&self, command: &str) -> Duration {
        let ms = self
            .refresh_delays_ms
            .get(command)
            .copied()
            .unwrap_or(self.refresh_delay_ms);
        Duration::from_millis(ms)
    }

    fn is_fullscreen(&self, word: &str) -> bool {
        let name = path::basename(word);
        self.fullscreen_programs.iter().any(|p| p == name)
    }
}

/// Remote directories to re-read after a delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refresh {
    pub paths: Vec<String>,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Confirm `target` remotely, then forward the command.
    ChangeDirectory { target: String },
    Transfer(TransferRequest),
    /// Forward and hand the terminal to `program`.
    FullScreen { program: String },
    /// Send Ctrl-C instead of the text.
    Interrupt,
    Forward { refresh: Option<Refresh> },
}

/// Where relative paths in a command are anchored.
#[derive(Debug, Clone, Copy)]
pub struct Location<'a> {
    pub cwd: &'a str,
    pub previous: Option<&'a str>,
    pub home: Option<&'a str>,
    /// Local directory for transfer sources and destinations.
    pub local_dir: &'a Path,
}

/// Index of the command word in `words`, skipping privilege wrappers and
/// their options.
pub fn primary_word(words: &[String], wrappers: &[String]) -> Option<usize> {
    let mut idx = 0;
    while idx < words.len() {
        if !wrappers.iter().any(|w| *w == words[idx]) {
            return Some(idx);
        }
        idx += 1;
        // wrapper options, e.g. `sudo -u deploy -E vim`
        while idx < words.len() && words[idx].starts_with('-') {
            let takes_value = matches!(words[idx].as_str(), "-u" | "-g" | "-C" | "-h" | "-p" | "-r" | "-t");
            idx += if takes_value { 2 } else { 1 };
        }
    }
    None
}

/// Classifies a submitted command (as sent on the wire).
pub fn classify(
    text: &str,
    location: &Location<'_>,
    settings: &DispatchSettings,
) -> Result<Dispatch, DispatchError> {
    let forward = Dispatch::Forward { refresh: None };
    let Ok(words) = parser::first_command(text) else {
        return Ok(forward);
    };
    let Some(primary) = primary_word(&words, &settings.privilege_wrappers) else {
        return Ok(forward);
    };
    let command = words[primary].as_str();
    let args = &words[primary + 1..];

    if command == settings.interrupt_command {
        return Ok(Dispatch::Interrupt);
    }
    if command == "cd" {
        return change_directory(args, location).map(|target| Dispatch::ChangeDirectory { target });
    }
    if settings.upload_commands.iter().any(|c| c == command) {
        return upload(args, location).map(Dispatch::Transfer);
    }
    if settings.download_commands.iter().any(|c| c == command) {
        return download(args, location).map(Dispatch::Transfer);
    }
    if settings.is_fullscreen(command) {
        return Ok(Dispatch::FullScreen {
            program: command.to_string(),
        });
    }
    if settings.mutating_commands.iter().any(|c| c == command) {
        return Ok(Dispatch::Forward {
            refresh: Some(Refresh {
                paths: affected_directories(args, location),
                delay: settings.refresh_delay(command),
            }),
        });
    }
    Ok(forward)
}

fn operands(args: &[String]) -> impl Iterator<Item = &String> {
    args.iter().filter(|a| !a.starts_with('-') || a.as_str() == "-")
}

fn change_directory(args: &[String], location: &Location<'_>) -> Result<String, DispatchError> {
    let target = operands(args).next().map(String::as_str).unwrap_or("~");
    if target == "-" {
        return location
            .previous
            .map(str::to_string)
            .ok_or(DispatchError::NoPreviousDirectory);
    }
    Ok(path::resolve(location.cwd, location.home, target))
}

fn upload(args: &[String], location: &Location<'_>) -> Result<TransferRequest, DispatchError> {
    let mut operands = operands(args);
    let local = operands.next().ok_or(DispatchError::MissingArgument {
        usage: "upload LOCAL_FILE [REMOTE_PATH]",
    })?;
    let local_path = local_path(local, location.local_dir);
    let name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| local.clone());

    let remote_path = match operands.next() {
        None => path::join(location.cwd, &name),
        Some(dest) if dest.ends_with('/') || matches!(dest.as_str(), "." | ".." | "~") => {
            path::join(&path::resolve(location.cwd, location.home, dest), &name)
        }
        Some(dest) => path::resolve(location.cwd, location.home, dest),
    };

    Ok(TransferRequest {
        direction: Direction::Upload,
        local_path,
        remote_path,
    })
}

fn download(args: &[String], location: &Location<'_>) -> Result<TransferRequest, DispatchError> {
    let mut operands = operands(args);
    let remote = operands.next().ok_or(DispatchError::MissingArgument {
        usage: "download REMOTE_FILE [LOCAL_PATH]",
    })?;
    let remote_path = path::resolve(location.cwd, location.home, remote);
    let name = path::basename(&remote_path).to_string();

    let local_path = match operands.next() {
        None => location.local_dir.join(&name),
        Some(dest) if dest.ends_with('/') || dest == "." => local_path(dest, location.local_dir).join(&name),
        Some(dest) => local_path(dest, location.local_dir),
    };

    Ok(TransferRequest {
        direction: Direction::Download,
        local_path,
        remote_path,
    })
}

fn local_path(arg: &str, local_dir: &Path) -> PathBuf {
    if arg == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = arg.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    local_dir.join(arg)
}

/// Parent directories of the command's operands, or the working directory
/// when it names none.
fn affected_directories(args: &[String], location: &Location<'_>) -> Vec<String> {
    let mut dirs: Vec<String> = Vec::new();
    for arg in operands(args).filter(|a| !a.contains("://")) {
        let dir = path::parent(&path::resolve(location.cwd, location.home, arg));
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    if dirs.is_empty() {
        dirs.push(location.cwd.to_string());
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> Location<'static> {
        Location {
            cwd: "/srv/app",
            previous: Some("/tmp"),
            home: Some("/home/ops"),
            local_dir: Path::new("/work"),
        }
    }

    fn classify_default(text: &str) -> Result<Dispatch, DispatchError> {
        classify(text, &location(), &DispatchSettings::default())
    }

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_primary_word_skips_wrappers() {
        let wrappers = words(&["sudo", "doas"]);
        assert_eq!(primary_word(&words(&["ls"]), &wrappers), Some(0));
        assert_eq!(primary_word(&words(&["sudo", "vim", "x"]), &wrappers), Some(1));
        assert_eq!(
            primary_word(&words(&["sudo", "-u", "deploy", "-E", "vim"]), &wrappers),
            Some(4)
        );
        assert_eq!(primary_word(&words(&["sudo"]), &wrappers), None);
        assert_eq!(primary_word(&[], &wrappers), None);
    }

    #[test]
    fn test_cd_targets() {
        assert_eq!(
            classify_default("cd ..").unwrap(),
            Dispatch::ChangeDirectory { target: "/srv".into() }
        );
        assert_eq!(
            classify_default("cd").unwrap(),
            Dispatch::ChangeDirectory { target: "/home/ops".into() }
        );
        assert_eq!(
            classify_default("cd -").unwrap(),
            Dispatch::ChangeDirectory { target: "/tmp".into() }
        );
        assert_eq!(
            classify_default("cd 'my dir' && ls").unwrap(),
            Dispatch::ChangeDirectory { target: "/srv/app/my dir".into() }
        );
    }

    #[test]
    fn test_cd_dash_without_previous() {
        let mut loc = location();
        loc.previous = None;
        assert_eq!(
            classify("cd -", &loc, &DispatchSettings::default()),
            Err(DispatchError::NoPreviousDirectory)
        );
    }

    #[test]
    fn test_fullscreen_through_sudo() {
        assert_eq!(
            classify_default("sudo vim /etc/hosts").unwrap(),
            Dispatch::FullScreen { program: "vim".into() }
        );
        assert_eq!(
            classify_default("/usr/bin/htop").unwrap(),
            Dispatch::FullScreen { program: "/usr/bin/htop".into() }
        );
    }

    #[test]
    fn test_interrupt_pseudo_command() {
        assert_eq!(classify_default("^C").unwrap(), Dispatch::Interrupt);
    }

    #[test]
    fn test_upload_destinations() {
        let Dispatch::Transfer(request) = classify_default("upload build/app.tar.gz").unwrap() else {
            panic!("expected a transfer");
        };
        assert_eq!(request.direction, Direction::Upload);
        assert_eq!(request.local_path, PathBuf::from("/work/build/app.tar.gz"));
        assert_eq!(request.remote_path, "/srv/app/app.tar.gz");

        let Dispatch::Transfer(request) = classify_default("rz notes.txt /tmp/").unwrap() else {
            panic!("expected a transfer");
        };
        assert_eq!(request.remote_path, "/tmp/notes.txt");

        let Dispatch::Transfer(request) = classify_default("upload notes.txt ../n.txt").unwrap() else {
            panic!("expected a transfer");
        };
        assert_eq!(request.remote_path, "/srv/n.txt");
    }

    #[test]
    fn test_download_destinations() {
        let Dispatch::Transfer(request) = classify_default("download logs/app.log").unwrap() else {
            panic!("expected a transfer");
        };
        assert_eq!(request.direction, Direction::Download);
        assert_eq!(request.remote_path, "/srv/app/logs/app.log");
        assert_eq!(request.local_path, PathBuf::from("/work/app.log"));

        let Dispatch::Transfer(request) = classify_default("sz /etc/hosts out/").unwrap() else {
            panic!("expected a transfer");
        };
        assert_eq!(request.local_path, PathBuf::from("/work/out/hosts"));
    }

    #[test]
    fn test_transfer_without_arguments() {
        assert!(matches!(
            classify_default("upload"),
            Err(DispatchError::MissingArgument { .. })
        ));
        assert!(matches!(
            classify_default("sz"),
            Err(DispatchError::MissingArgument { .. })
        ));
    }

    #[test]
    fn test_mutating_commands_refresh_parents() {
        assert_eq!(
            classify_default("rm -rf build /var/tmp/x").unwrap(),
            Dispatch::Forward {
                refresh: Some(Refresh {
                    paths: vec!["/srv/app".into(), "/var/tmp".into()],
                    delay: Duration::from_millis(500),
                }),
            }
        );
        assert_eq!(
            classify_default("git pull").unwrap(),
            Dispatch::Forward {
                refresh: Some(Refresh {
                    paths: vec!["/srv/app".into()],
                    delay: Duration::from_millis(1000),
                }),
            }
        );
    }

    #[test]
    fn test_plain_and_unparsable_commands_forward() {
        assert_eq!(classify_default("ls -la").unwrap(), Dispatch::Forward { refresh: None });
        assert_eq!(classify_default("echo 'open").unwrap(), Dispatch::Forward { refresh: None });
        assert_eq!(classify_default("").unwrap(), Dispatch::Forward { refresh: None });
    }
}
