//! Load config from file and environment.

use anyhow::Context as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Node configuration. File: ~/.config/peerlink/config.toml or /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_LISTEN_PORT, PEERLINK_ADVERTISE_HOST, PEERLINK_SHARED_DIR,
/// PEERLINK_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port (default 4000, 0 picks a free port).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Host part of the address this node advertises to peers.
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,
    /// Files offered to searches and downloads.
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,
    /// Where downloads are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Bytes per file chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Largest frame accepted from a peer.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    /// Frames queued per link before senders wait.
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,
}

fn default_listen_port() -> u16 {
    4000
}
fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}
fn default_shared_dir() -> PathBuf {
    PathBuf::from("uploads")
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_chunk_size() -> usize {
    8192
}
fn default_max_frame_len() -> u32 {
    16 * 1024 * 1024
}
fn default_send_queue_depth() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            advertise_host: default_advertise_host(),
            shared_dir: default_shared_dir(),
            download_dir: default_download_dir(),
            chunk_size: default_chunk_size(),
            max_frame_len: default_max_frame_len(),
            send_queue_depth: default_send_queue_depth(),
        }
    }
}

impl Config {
    /// Apply overrides looked up by variable name.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(p) = lookup("PEERLINK_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.listen_port = p;
        }
        if let Some(h) = lookup("PEERLINK_ADVERTISE_HOST") {
            self.advertise_host = h;
        }
        if let Some(d) = lookup("PEERLINK_SHARED_DIR") {
            self.shared_dir = PathBuf::from(d);
        }
        if let Some(d) = lookup("PEERLINK_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(d);
        }
    }
}

/// Load config: merge default, then config file (explicit path, or the first that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => {
            let s = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str::<Config>(&s)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => load_file().unwrap_or_default(),
    };
    c.apply_env(|name| std::env::var(name).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "ignoring bad config"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_fill_missing_fields() {
        let c: Config = toml::from_str("listen_port = 5000").unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.advertise_host, "127.0.0.1");
        assert_eq!(c.shared_dir, PathBuf::from("uploads"));
        assert_eq!(c.download_dir, PathBuf::from("downloads"));
        assert_eq!(c.chunk_size, 8192);
        assert_eq!(c.max_frame_len, 16 * 1024 * 1024);
        assert_eq!(c.send_queue_depth, 64);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let vars: HashMap<&str, &str> = [
            ("PEERLINK_LISTEN_PORT", "4100"),
            ("PEERLINK_ADVERTISE_HOST", "10.0.0.5"),
            ("PEERLINK_SHARED_DIR", "/srv/share"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(c.listen_port, 4100);
        assert_eq!(c.advertise_host, "10.0.0.5");
        assert_eq!(c.shared_dir, PathBuf::from("/srv/share"));
        assert_eq!(c.download_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn bad_port_in_env_ignored() {
        let mut c = Config::default();
        c.apply_env(|name| (name == "PEERLINK_LISTEN_PORT").then(|| "http".to_string()));
        assert_eq!(c.listen_port, 4000);
    }

    #[test]
    fn explicit_path_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerlink.toml");
        std::fs::write(&path, "chunk_size = 1024\nshared_dir = \"share\"\n").unwrap();
        let c = load(Some(&path)).unwrap();
        assert_eq!(c.chunk_size, 1024);
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
