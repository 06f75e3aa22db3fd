//! Daemon configuration.
//!
//! The config file is a flat list of `key = value` lines with `#` comments.
//! Unknown keys are warned about and skipped so old daemons tolerate new
//! configs. A missing file leaves the built-in defaults in force.

use std::fs;
use std::io;
use std::path::Path;

/// Default configuration file location.
pub const DEFAULT_CFG_PATH: &str = "/etc/turnstiled.conf";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("line {0}: expected `key = value`")]
    Malformed(usize),

    #[error("line {0}: invalid value for `{1}`")]
    BadValue(usize, String),

    #[error("bad rundir template `{0}`")]
    BadTemplate(String),
}

/// Runtime configuration, populated from the config file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Program name of the service manager to exec.
    pub backend: String,
    /// Skip the backend entirely; logins succeed immediately.
    pub disable: bool,
    /// Whether this daemon creates and owns per-user rundirs.
    pub manage_rdir: bool,
    /// Rundir template; `%u` expands to the UID, `%g` to the GID.
    pub rdir_path: String,
    /// Seconds to wait for the service manager to boot (0 disables).
    pub login_timeout: u64,
    /// Always keep the service manager alive with no sessions.
    pub linger: bool,
    /// Never keep it alive; overrides `linger` and the linger files.
    pub linger_never: bool,
    /// DBus-export flag forwarded to clients in the ready reply.
    pub export_dbus: bool,
    /// Service-file search directories; relative entries resolve under
    /// the user's home directory.
    pub srv_paths: Vec<String>,
    /// Per-user boot service directory, relative to the home directory.
    pub boot_path: String,
    /// System-wide boot service directory (absolute).
    pub sys_boot_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: "dinit".into(),
            disable: false,
            manage_rdir: false,
            rdir_path: "/run/user/%u".into(),
            login_timeout: 60,
            linger: false,
            linger_never: false,
            export_dbus: true,
            srv_paths: vec![".config/dinit.d".into()],
            boot_path: ".config/dinit.d/boot.d".into(),
            sys_boot_path: "/usr/lib/dinit.d/boot.d".into(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let mut cfg = Config::default();
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!("config: {} not found, using defaults", path.display());
                return Ok(cfg);
            }
            Err(e) => return Err(e.into()),
        };
        cfg.apply(&content)?;
        Ok(cfg)
    }

    /// Apply `key = value` lines on top of the current values.
    pub fn apply(&mut self, content: &str) -> Result<(), ConfigError> {
        // The first srv_paths line replaces the default list; later ones
        // append to it.
        let mut srv_paths_set = false;

        for (n, raw) in content.lines().enumerate() {
            let lineno = n + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Malformed(lineno));
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "backend" => self.backend = value.to_string(),
                "disable" => self.disable = parse_bool(value, key, lineno)?,
                "manage_rdir" => self.manage_rdir = parse_bool(value, key, lineno)?,
                "rdir_path" => self.rdir_path = value.to_string(),
                "login_timeout" => {
                    self.login_timeout = value
                        .parse()
                        .map_err(|_| ConfigError::BadValue(lineno, key.into()))?;
                }
                "linger" => self.linger = parse_bool(value, key, lineno)?,
                "linger_never" => self.linger_never = parse_bool(value, key, lineno)?,
                "export_dbus" => self.export_dbus = parse_bool(value, key, lineno)?,
                "srv_paths" => {
                    if !srv_paths_set {
                        self.srv_paths.clear();
                        srv_paths_set = true;
                    }
                    self.srv_paths
                        .extend(value.split_whitespace().map(|s| s.to_string()));
                }
                "boot_path" => self.boot_path = value.to_string(),
                "sys_boot_path" => self.sys_boot_path = value.to_string(),
                _ => log::warn!("config: unknown option `{}` on line {}", key, lineno),
            }
        }

        // `backend = none` is shorthand for disabling it.
        if self.backend == "none" {
            self.disable = true;
        }
        Ok(())
    }
}

fn parse_bool(value: &str, key: &str, lineno: usize) -> Result<bool, ConfigError> {
    match value {
        "1" | "yes" | "true" => Ok(true),
        "0" | "no" | "false" => Ok(false),
        _ => Err(ConfigError::BadValue(lineno, key.into())),
    }
}

/// Expand a rundir template for a login.
///
/// `%u` expands to the UID, `%g` to the GID and `%%` to a literal percent;
/// any other `%` sequence is an error. An empty template expands to the
/// empty string, which means the login has no rundir.
pub fn expand_rundir(template: &str, uid: u32, gid: u32) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len() + 8);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('u') => out.push_str(&uid.to_string()),
            Some('g') => out.push_str(&gid.to_string()),
            Some('%') => out.push('%'),
            _ => return Err(ConfigError::BadTemplate(template.to_string())),
        }
    }
    Ok(out)
}
