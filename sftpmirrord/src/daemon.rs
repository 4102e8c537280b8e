use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sftpmirror_core::{SftpConfig, SftpConnector};

use crate::sync::local_watcher::start_notify_watcher;
use crate::sync::worker::{SyncHandle, SyncOptions, SyncService};

const DEFAULT_WATCH_DIR_NAME: &str = "Mirror";
const DEFAULT_REMOTE_ROOT: &str = "/";
const DEFAULT_PORT: u64 = 22;
const DEFAULT_REFRESH_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_QUEUE_CAPACITY: u64 = 10;
const DEFAULT_MAX_ATTEMPTS: u64 = 3;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub remote_root: String,
    pub watch_root: PathBuf,
    pub refresh_interval: Duration,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub enable_watcher: bool,
    pub known_hosts: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let host = std::env::var("SFTPMIRROR_HOST").context("SFTPMIRROR_HOST is not set")?;
        let user = std::env::var("SFTPMIRROR_USER").context("SFTPMIRROR_USER is not set")?;
        let password =
            std::env::var("SFTPMIRROR_PASSWORD").context("SFTPMIRROR_PASSWORD is not set")?;
        let port = u16::try_from(read_u64_env("SFTPMIRROR_PORT", DEFAULT_PORT))
            .context("SFTPMIRROR_PORT is out of range")?;
        let remote_root = std::env::var("SFTPMIRROR_REMOTE_ROOT")
            .unwrap_or_else(|_| DEFAULT_REMOTE_ROOT.to_string());
        let watch_root = std::env::var("SFTPMIRROR_WATCH_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_WATCH_DIR_NAME));
        let refresh_interval = Duration::from_secs(read_u64_env(
            "SFTPMIRROR_REFRESH_SECS",
            DEFAULT_REFRESH_SECS,
        ));
        let connect_timeout = Duration::from_secs(read_u64_env(
            "SFTPMIRROR_CONNECT_TIMEOUT_SECS",
            DEFAULT_CONNECT_TIMEOUT_SECS,
        ));
        let queue_capacity =
            read_u64_env("SFTPMIRROR_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY) as usize;
        let max_attempts = read_u64_env("SFTPMIRROR_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS) as u32;
        let enable_watcher = read_bool_env("SFTPMIRROR_ENABLE_WATCHER", true);
        let known_hosts = std::env::var("SFTPMIRROR_KNOWN_HOSTS")
            .ok()
            .map(|value| expand_with_home(&value, &home));

        Ok(Self {
            host,
            port,
            user,
            password,
            remote_root,
            watch_root,
            refresh_interval,
            connect_timeout,
            queue_capacity,
            max_attempts,
            enable_watcher,
            known_hosts,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    handle: SyncHandle,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        if config.enable_watcher {
            tokio::fs::create_dir_all(&config.watch_root)
                .await
                .with_context(|| {
                    format!("failed to create watch root at {:?}", config.watch_root)
                })?;
        }

        let mut sftp = SftpConfig::new(
            config.host.clone(),
            config.port,
            config.user.clone(),
            config.password.clone(),
        );
        sftp.connect_timeout = config.connect_timeout;
        sftp.known_hosts = config.known_hosts.clone();

        let handle = SyncService::start(
            SftpConnector::new(sftp),
            SyncOptions {
                refresh_interval: config.refresh_interval,
                queue_capacity: config.queue_capacity,
                max_attempts: config.max_attempts,
            },
        );

        Ok(Self { config, handle })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        eprintln!(
            "[sftpmirrord] started: {}@{}:{}, remote_root={}, watcher={}",
            self.config.user,
            self.config.host,
            self.config.port,
            self.config.remote_root,
            if self.config.enable_watcher {
                "enabled"
            } else {
                "disabled"
            }
        );

        let (watcher, mut uploads) = if self.config.enable_watcher {
            match start_notify_watcher(&self.config.watch_root, &self.config.remote_root) {
                Ok((watcher, rx)) => (Some(watcher), Some(rx)),
                Err(err) => {
                    eprintln!("[sftpmirrord] warning: failed to start local watcher: {err}");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        loop {
            let event = match uploads.as_mut() {
                Some(rx) => tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        res.context("failed waiting for shutdown signal")?;
                        break;
                    }
                    event = rx.recv() => event,
                },
                None => {
                    tokio::signal::ctrl_c()
                        .await
                        .context("failed waiting for shutdown signal")?;
                    break;
                }
            };
            match event {
                Some(upload) => {
                    if !self
                        .handle
                        .submit(upload.local.clone(), upload.remote.clone())
                    {
                        eprintln!(
                            "[sftpmirrord] rejected {} -> {} (no connection or queue full)",
                            upload.local.display(),
                            upload.remote
                        );
                    }
                }
                None => uploads = None,
            }
        }

        drop(watcher);
        eprintln!("[sftpmirrord] shutting down");
        self.handle.stop().await;
        Ok(())
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if let Some(rest) = value.strip_prefix("~/") {
        home.join(rest)
    } else if value == "~" {
        home.to_path_buf()
    } else {
        PathBuf::from(value)
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
