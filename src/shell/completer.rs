//! Tab completion
//!
//! Works out what the word under the cursor is and where candidates come
//! from. Command names complete from a fixed list; paths complete from a
//! remote directory listing which the session requests asynchronously.

use super::path;
use crate::transport::{DirEntry, EntryKind};

/// Commands offered when completing the first word of a command.
pub const DEFAULT_COMMANDS: &[&str] = &[
    "apt", "apt-get", "awk", "cat", "cd", "chmod", "chown", "clear", "cp", "crontab", "curl",
    "df", "diff", "docker", "du", "echo", "env", "exit", "export", "find", "free", "git", "grep",
    "gzip", "head", "history", "htop", "ip", "journalctl", "kill", "less", "ln", "ls", "lsof",
    "man", "mkdir", "more", "mount", "mv", "nano", "netstat", "nohup", "ping", "ps", "pwd",
    "rm", "rmdir", "rsync", "scp", "sed", "service", "sort", "ss", "sudo", "systemctl", "tail",
    "tar", "top", "touch", "uname", "uniq", "unzip", "vi", "vim", "wc", "wget", "whoami", "xargs",
    "yum", "zip",
];

/// Words after which a new command starts.
const COMMAND_SEPARATORS: &[&str] = &["|", "||", "&&", ";", "&", "then", "do", "else"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Command,
    Path,
}

/// The word being completed and where to look for candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub line: usize,
    /// Column where the word starts.
    pub token_start: usize,
    /// Column of the cursor, the end of the word.
    pub cursor: usize,
    pub token: String,
    pub target: Target,
    /// Remote directory to list for a path.
    pub directory: String,
    /// Leading part of the word kept in front of every candidate (`src/`).
    pub dir_prefix: String,
    /// Part of the word matched against names.
    pub name_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// What the candidate list shows.
    pub display: String,
    /// Text that replaces the word.
    pub replacement: String,
    /// Complete word; a space follows it when it is the only match.
    pub terminal: bool,
}

/// Where the word under the cursor lives.
#[derive(Debug, Clone, Copy)]
pub struct CompletionContext<'a> {
    pub cwd: &'a str,
    pub home: Option<&'a str>,
    pub privilege_wrappers: &'a [String],
}

/// Classifies the word ending at the cursor.
///
/// `earlier` is the text of previous buffer lines, `line_before` the text
/// of the cursor's line left of the cursor.
pub fn analyze(
    earlier: &str,
    line_before: &str,
    line: usize,
    context: &CompletionContext<'_>,
) -> CompletionRequest {
    let token_start_byte = line_before
        .rfind(char::is_whitespace)
        .map(|idx| idx + line_before[idx..].chars().next().map_or(1, char::len_utf8))
        .unwrap_or(0);
    let token = line_before[token_start_byte..].to_string();
    let cursor = line_before.chars().count();
    let token_start = cursor - token.chars().count();

    let before_token = format!("{} {}", earlier, &line_before[..token_start_byte]);
    let target = if starts_command(&before_token, context.privilege_wrappers) && !token.contains('/') {
        Target::Command
    } else {
        Target::Path
    };

    let (dir_prefix, name_prefix) = match token.rfind('/') {
        Some(idx) => (token[..=idx].to_string(), token[idx + 1..].to_string()),
        None => (String::new(), token.clone()),
    };
    let directory = if dir_prefix.is_empty() {
        context.cwd.to_string()
    } else {
        path::resolve(context.cwd, context.home, &dir_prefix)
    };

    CompletionRequest {
        line,
        token_start,
        cursor,
        token,
        target,
        directory,
        dir_prefix,
        name_prefix,
    }
}

/// The next word typed after `before` is a command name.
fn starts_command(before: &str, wrappers: &[String]) -> bool {
    let mut last = None;
    for word in before.split_whitespace() {
        // `ls;` or `a|` end a command too
        if word.ends_with(';') || word.ends_with('|') || word.ends_with('&') {
            last = Some(";");
            continue;
        }
        last = Some(word);
    }
    match last {
        None => true,
        Some(word) => {
            COMMAND_SEPARATORS.contains(&word) || wrappers.iter().any(|w| w == word)
        }
    }
}

pub fn complete_commands(request: &CompletionRequest, commands: &[String]) -> Vec<Candidate> {
    let mut matches: Vec<&String> = commands
        .iter()
        .filter(|cmd| cmd.starts_with(&request.token))
        .collect();
    matches.sort();
    matches.dedup();
    matches
        .into_iter()
        .map(|cmd| Candidate {
            display: cmd.clone(),
            replacement: cmd.clone(),
            terminal: true,
        })
        .collect()
}

/// Candidates from a listing of `request.directory`. Hidden entries are only
/// offered when the typed name starts with a dot.
pub fn complete_entries(request: &CompletionRequest, entries: &[DirEntry]) -> Vec<Candidate> {
    let show_hidden = request.name_prefix.starts_with('.');
    let mut candidates: Vec<Candidate> = entries
        .iter()
        .filter(|entry| entry.name.starts_with(&request.name_prefix))
        .filter(|entry| show_hidden || !entry.name.starts_with('.'))
        .map(|entry| {
            let is_dir = entry.kind == EntryKind::Dir;
            let suffix = if is_dir { "/" } else { "" };
            Candidate {
                display: format!("{}{}", entry.name, suffix),
                replacement: format!("{}{}{}", request.dir_prefix, escape_word(&entry.name), suffix),
                terminal: !is_dir,
            }
        })
        .collect();
    candidates.sort_by(|a, b| a.display.cmp(&b.display));
    candidates
}

/// Backslash-escapes characters the shell would split or expand.
fn escape_word(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_whitespace() || "'\"\\$`&|;<>()*?[]!#".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Longest common prefix of the candidates' replacements.
pub fn common_prefix(candidates: &[Candidate]) -> String {
    let Some(first) = candidates.first() else {
        return String::new();
    };
    let mut prefix: Vec<char> = first.replacement.chars().collect();
    for candidate in &candidates[1..] {
        let common = prefix
            .iter()
            .zip(candidate.replacement.chars())
            .take_while(|(a, b)| **a == *b)
            .count();
        prefix.truncate(common);
    }
    prefix.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(wrappers: &'a [String]) -> CompletionContext<'a> {
        CompletionContext {
            cwd: "/home/dev",
            home: Some("/home/dev"),
            privilege_wrappers: wrappers,
        }
    }

    fn entry(name: &str, kind: EntryKind) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            kind,
        }
    }

    fn commands() -> Vec<String> {
        DEFAULT_COMMANDS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_word_is_command() {
        let request = analyze("", "sys", 0, &context(&[]));
        assert_eq!(request.target, Target::Command);
        assert_eq!(request.token, "sys");
        assert_eq!(request.token_start, 0);
        let candidates = complete_commands(&request, &commands());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].replacement, "systemctl");
    }

    #[test]
    fn test_after_wrapper_or_pipe_is_command() {
        let wrappers = vec!["sudo".to_string()];
        assert_eq!(analyze("", "sudo sys", 0, &context(&wrappers)).target, Target::Command);
        assert_eq!(analyze("", "ls | gr", 0, &context(&[])).target, Target::Command);
        assert_eq!(analyze("", "ls; gr", 0, &context(&[])).target, Target::Command);
    }

    #[test]
    fn test_argument_is_path() {
        let request = analyze("", "cat src/ma", 0, &context(&[]));
        assert_eq!(request.target, Target::Path);
        assert_eq!(request.token_start, 4);
        assert_eq!(request.cursor, 10);
        assert_eq!(request.directory, "/home/dev/src");
        assert_eq!(request.dir_prefix, "src/");
        assert_eq!(request.name_prefix, "ma");
    }

    #[test]
    fn test_earlier_lines_count_as_context() {
        let request = analyze("ls -la", "sr", 1, &context(&[]));
        assert_eq!(request.target, Target::Path);
        assert_eq!(request.token_start, 0);
    }

    #[test]
    fn test_columns_are_characters() {
        let request = analyze("", "cat 目录/f", 0, &context(&[]));
        assert_eq!(request.token_start, 4);
        assert_eq!(request.cursor, 8);
    }

    #[test]
    fn test_entries_filter_and_suffix() {
        let request = analyze("", "cd s", 0, &context(&[]));
        let entries = vec![
            entry("src", EntryKind::Dir),
            entry("setup.sh", EntryKind::File),
            entry(".secret", EntryKind::File),
            entry("target", EntryKind::Dir),
        ];
        let candidates = complete_entries(&request, &entries);
        let displays: Vec<&str> = candidates.iter().map(|c| c.display.as_str()).collect();
        assert_eq!(displays, vec!["setup.sh", "src/"]);
        assert!(!candidates[1].terminal);
        assert_eq!(common_prefix(&candidates), "s");
    }

    #[test]
    fn test_hidden_entries_with_dot_prefix() {
        let request = analyze("", "cat .b", 0, &context(&[]));
        let entries = vec![entry(".bashrc", EntryKind::File), entry("bin", EntryKind::Dir)];
        let candidates = complete_entries(&request, &entries);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].replacement, ".bashrc");
    }

    #[test]
    fn test_replacement_escapes_spaces() {
        let request = analyze("", "cat docs/my", 0, &context(&[]));
        let entries = vec![entry("my notes.txt", EntryKind::File)];
        let candidates = complete_entries(&request, &entries);
        assert_eq!(candidates[0].replacement, "docs/my\\ notes.txt");
    }

    #[test]
    fn test_common_prefix() {
        let candidates: Vec<Candidate> = ["docker", "docker-compose", "dockerd"]
            .iter()
            .map(|s| Candidate {
                display: s.to_string(),
                replacement: s.to_string(),
                terminal: true,
            })
            .collect();
        assert_eq!(common_prefix(&candidates), "docker");
        assert_eq!(common_prefix(&[]), "");
    }
}
