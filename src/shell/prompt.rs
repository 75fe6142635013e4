//! Prompt rendering per remote system flavor
//!
//! The prompt is drawn locally, so its display width has to be known exactly
//! for cursor arithmetic. Every flavor carries its own width formula which is
//! kept in sync with what [`PromptRenderer::render`] produces (see the tests).

use std::fmt;
use std::str::FromStr;

use colored::Colorize;
use serde::Deserialize;

use super::path;
use super::width::str_width;
use crate::error::ConfigError;

/// Prompt layout family of the remote system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemFlavor {
    /// `user@host:~/dir$ `
    #[default]
    Ubuntu,
    /// `[user@host dir]$ `
    #[serde(alias = "rhel", alias = "fedora")]
    CentOs,
    /// Two rows, `┌──(user㉿host)-[~/dir]` then `└─$ `
    Kali,
    /// `host:~/dir$ `
    Alpine,
}

impl FromStr for SystemFlavor {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ubuntu" | "debian" => Ok(Self::Ubuntu),
            "centos" | "rhel" | "fedora" => Ok(Self::CentOs),
            "kali" => Ok(Self::Kali),
            "alpine" | "busybox" => Ok(Self::Alpine),
            _ => Err(ConfigError::UnknownFlavor(s.to_string())),
        }
    }
}

impl fmt::Display for SystemFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ubuntu => "ubuntu",
            Self::CentOs => "centos",
            Self::Kali => "kali",
            Self::Alpine => "alpine",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct PromptRenderer {
    flavor: SystemFlavor,
    user: String,
    host: String,
}

impl PromptRenderer {
    pub fn new(flavor: SystemFlavor, user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            flavor,
            user: user.into(),
            host: host.into(),
        }
    }

    pub fn flavor(&self) -> SystemFlavor {
        self.flavor
    }

    fn sigil(&self) -> char {
        if self.user == "root" {
            '#'
        } else {
            '$'
        }
    }

    /// Rows the prompt occupies. The cursor sits on the last one.
    pub fn rows(&self) -> usize {
        match self.flavor {
            SystemFlavor::Kali => 2,
            _ => 1,
        }
    }

    /// Styled prompt text for `cwd`.
    pub fn render(&self, cwd: &str, home: Option<&str>) -> String {
        let dir = path::shorten_home(cwd, home);
        let sigil = self.sigil();
        match self.flavor {
            SystemFlavor::Ubuntu => format!(
                "{}:{}{} ",
                format!("{}@{}", self.user, self.host).bright_green().bold(),
                dir.bright_blue().bold(),
                sigil
            ),
            SystemFlavor::CentOs => {
                format!("[{}@{} {}]{} ", self.user, self.host, short_dir(&dir), sigil)
            }
            SystemFlavor::Kali => format!(
                "{}{}{}{}{}\r\n{}{} ",
                "┌──(".green(),
                format!("{}㉿{}", self.user, self.host).bright_blue().bold(),
                ")-[".green(),
                dir.bold(),
                "]".green(),
                "└─".green(),
                sigil.to_string().bright_blue().bold()
            ),
            SystemFlavor::Alpine => format!("{}:{}{} ", self.host, dir, sigil),
        }
    }

    /// Display width of the row the cursor ends up on.
    pub fn width(&self, cwd: &str, home: Option<&str>) -> usize {
        let dir = path::shorten_home(cwd, home);
        match self.flavor {
            // user@host:dir$␠
            SystemFlavor::Ubuntu => str_width(&self.user) + 1 + str_width(&self.host) + 1 + str_width(&dir) + 2,
            // [user@host dir]$␠
            SystemFlavor::CentOs => {
                1 + str_width(&self.user) + 1 + str_width(&self.host) + 1 + str_width(short_dir(&dir)) + 1 + 2
            }
            // └─$␠
            SystemFlavor::Kali => 4,
            // host:dir$␠
            SystemFlavor::Alpine => str_width(&self.host) + 1 + str_width(&dir) + 2,
        }
    }
}

/// Last component of a displayed directory, as the bash `\W` escape shows it.
fn short_dir(dir: &str) -> &str {
    if dir == "/" || dir == "~" {
        dir
    } else {
        path::basename(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::width::visible_width;

    fn last_row(rendered: &str) -> &str {
        rendered.rsplit("\r\n").next().unwrap_or(rendered)
    }

    /// `rendered` without its CSI styling, whether or not colour is on.
    fn plain(rendered: &str) -> String {
        let mut out = String::new();
        let mut chars = rendered.chars();
        while let Some(c) = chars.next() {
            if c == '\x1b' {
                let _ = chars.next(); // '['
                for seq_char in chars.by_ref() {
                    if matches!(seq_char as u32, 0x40..=0x7E) {
                        break;
                    }
                }
                continue;
            }
            out.push(c);
        }
        out
    }

    #[test]
    fn test_width_matches_rendering() {
        let dirs = ["/root", "/root/src", "/", "/srv/数据", "/home/admin/projects/app"];
        for flavor in [
            SystemFlavor::Ubuntu,
            SystemFlavor::CentOs,
            SystemFlavor::Kali,
            SystemFlavor::Alpine,
        ] {
            for user in ["root", "deploy"] {
                let prompt = PromptRenderer::new(flavor, user, "web-01");
                for dir in dirs {
                    let rendered = prompt.render(dir, Some("/root"));
                    assert_eq!(
                        visible_width(last_row(&rendered)),
                        prompt.width(dir, Some("/root")),
                        "{flavor} {user} {dir}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_ubuntu_layout() {
        let prompt = PromptRenderer::new(SystemFlavor::Ubuntu, "deploy", "web-01");
        assert_eq!(plain(&prompt.render("/home/deploy/app", Some("/home/deploy"))), "deploy@web-01:~/app$ ");
        let root = PromptRenderer::new(SystemFlavor::Ubuntu, "root", "web-01");
        assert_eq!(plain(&root.render("/etc", Some("/root"))), "root@web-01:/etc# ");
        assert_eq!(plain("\x1b[1;32mroot\x1b[0m:~# "), "root:~# ");
    }

    #[test]
    fn test_centos_shows_last_component() {
        let prompt = PromptRenderer::new(SystemFlavor::CentOs, "root", "db");
        assert_eq!(prompt.render("/var/lib/mysql", Some("/root")), "[root@db mysql]# ");
        assert_eq!(prompt.render("/root", Some("/root")), "[root@db ~]# ");
    }

    #[test]
    fn test_kali_has_two_rows() {
        let prompt = PromptRenderer::new(SystemFlavor::Kali, "kali", "kali");
        assert_eq!(prompt.rows(), 2);
        assert_eq!(prompt.width("/tmp", None), 4);
    }

    #[test]
    fn test_flavor_from_str() {
        assert_eq!("CentOS".parse::<SystemFlavor>().unwrap(), SystemFlavor::CentOs);
        assert_eq!("debian".parse::<SystemFlavor>().unwrap(), SystemFlavor::Ubuntu);
        assert!("plan9".parse::<SystemFlavor>().is_err());
    }
}
