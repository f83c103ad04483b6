//! Sudo/systemd-safe filesystem locations.
//!
//! `$HOME` points at `/root` when the server is launched through sudo or a
//! privilege-elevated service manager, which would scatter caches and the
//! history database under root's home. Resolution order: `SUDO_USER`, then
//! `LOGNAME`/`USER`, then the password database for the effective UID, then
//! `$HOME` as the final fallback. XDG variables override the derived
//! config/data/cache roots.

use std::path::PathBuf;

/// Resolve the real user's home directory.
pub fn real_home() -> PathBuf {
    if let Some(user) = std::env::var_os("SUDO_USER") {
        if let Some(dir) = passwd_home(&user.to_string_lossy()) {
            return dir;
        }
    }

    for var in ["LOGNAME", "USER"] {
        if let Ok(user) = std::env::var(var) {
            if !user.is_empty() && user != "root" {
                if let Some(dir) = passwd_home(&user) {
                    return dir;
                }
            }
        }
    }

    if let Some(dir) = passwd_home_for_uid(effective_uid()) {
        return dir;
    }

    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// `$XDG_CONFIG_HOME/meshforge` or `~/.config/meshforge`.
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config").join("meshforge")
}

/// `$XDG_DATA_HOME/meshforge` or `~/.local/share/meshforge`: caches and the
/// node history database.
pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share").join("meshforge")
}

/// `$XDG_CACHE_HOME/meshforge` or `~/.cache/meshforge`.
pub fn cache_dir() -> PathBuf {
    xdg_dir("XDG_CACHE_HOME", ".cache").join("meshforge")
}

fn xdg_dir(var: &str, home_relative: &str) -> PathBuf {
    match std::env::var_os(var) {
        Some(v) if !v.is_empty() => PathBuf::from(v),
        _ => real_home().join(home_relative),
    }
}

fn effective_uid() -> u32 {
    // /proc/self/status carries "Uid: real effective saved fs".
    if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("Uid:") {
                let mut fields = rest.split_whitespace();
                let _real = fields.next();
                if let Some(euid) = fields.next().and_then(|v| v.parse().ok()) {
                    return euid;
                }
            }
        }
    }
    0
}

fn passwd_home(user: &str) -> Option<PathBuf> {
    passwd_lookup(|name, _uid| name == user)
}

fn passwd_home_for_uid(uid: u32) -> Option<PathBuf> {
    passwd_lookup(|name, entry_uid| entry_uid == Some(uid) && name != "root")
}

fn passwd_lookup(matches: impl Fn(&str, Option<u32>) -> bool) -> Option<PathBuf> {
    let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
    for line in passwd.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 6 {
            continue;
        }
        let uid = fields[2].parse::<u32>().ok();
        if matches(fields[0], uid) && !fields[5].is_empty() {
            return Some(PathBuf::from(fields[5]));
        }
    }
    None
}
