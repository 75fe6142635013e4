//! Remote path handling
//!
//! Remote paths are always POSIX strings, independent of the local OS, so
//! they are handled as `&str` rather than `std::path::Path`.
//!
//! Accepts:
//! - /var/log          (absolute)
//! - ../src, ./a       (relative to the working directory)
//! - ~, ~/Documents    (home directory, when known)

/// Collapses `.`, `..` and repeated separators in an absolute path.
/// `..` at the root stays at the root.
pub fn normalize(path: &str) -> String {
    collapse("/", path.trim_start_matches('/'))
}

fn collapse(root: &str, rest: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in rest.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    if parts.is_empty() {
        // "/" stays "/", "~/" becomes "~"
        return match root.trim_end_matches('/') {
            "" => root.to_string(),
            bare => bare.to_string(),
        };
    }
    format!("{}{}", root, parts.join("/"))
}

/// Appends `name` to `base` with exactly one separator.
pub fn join(base: &str, name: &str) -> String {
    if name.starts_with('/') {
        return name.to_string();
    }
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Resolves `target` against `cwd` the way `cd` would.
///
/// With an unknown home directory, `~` forms are only tidied up and kept
/// relative to `~` so the remote shell can expand them.
pub fn resolve(cwd: &str, home: Option<&str>, target: &str) -> String {
    if target == "~" || target.starts_with("~/") {
        let rest = &target[1..];
        return match home {
            Some(home) => normalize(&join(home, rest.trim_start_matches('/'))),
            None => collapse("~/", rest.trim_start_matches('/')),
        };
    }
    if target.starts_with('/') {
        normalize(target)
    } else {
        normalize(&join(cwd, target))
    }
}

/// Directory containing `path`. The root is its own parent.
pub fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None if path.starts_with('/') => "/".to_string(),
        None => ".".to_string(),
    }
}

/// Last component of `path`, ignoring a trailing separator.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Shows `path` relative to `home` as `~` when it lies inside it.
pub fn shorten_home(path: &str, home: Option<&str>) -> String {
    match home {
        Some(home) if home != "/" && !home.is_empty() => {
            if path == home {
                "~".to_string()
            } else if let Some(rest) = path.strip_prefix(home).and_then(|r| r.strip_prefix('/')) {
                format!("~/{rest}")
            } else {
                path.to_string()
            }
        }
        _ => path.to_string(),
    }
}

/// Quotes `path` for a POSIX shell. A leading `~` or `~/` stays outside
/// the quotes so the shell still expands it.
pub fn quote(path: &str) -> String {
    if path == "~" {
        return "~".to_string();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if rest.is_empty() {
            return "~/".to_string();
        }
        return format!("~/{}", shell_escape(rest));
    }
    shell_escape(path)
}

fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
