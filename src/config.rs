use anyhow::{Context, Result};
use log::debug;
use reqwest::{
    Client, ClientBuilder,
    header::{AUTHORIZATION, HeaderMap, HeaderValue},
};
use std::path::PathBuf;

use crate::runtime::{Runtime, path::expand_user};

pub const DEFAULT_REGISTRY_URL: &str = "https://api.registry.fwpm.dev";

/// Resolved settings shared by every manager in one invocation.
///
/// Precedence is explicit argument, then environment, then built-in default.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub core_dir: PathBuf,
    pub registry_url: String,
    /// Host system type, e.g. `linux_x86_64`.
    pub systype: String,
    /// Render progress bars for transfers and extraction.
    pub progress: bool,
    pub auth_token: Option<String>,
}

impl Config {
    pub fn from_env<R: Runtime>(
        runtime: &R,
        core_dir: Option<PathBuf>,
        registry_url: Option<String>,
    ) -> Result<Self> {
        let home = runtime.home_dir();
        let core_dir = match core_dir.or_else(|| runtime.env_var("FWPM_CORE_DIR").ok().map(PathBuf::from)) {
            Some(dir) => expand_user(&dir.to_string_lossy(), home.as_deref()),
            None => home
                .context("Could not determine the home directory; set FWPM_CORE_DIR")?
                .join(".fwpm"),
        };

        let registry_url = registry_url
            .or_else(|| runtime.env_var("FWPM_REGISTRY_URL").ok())
            .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let systype = runtime
            .env_var("FWPM_SYSTYPE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(host_systype);

        let progress = runtime
            .env_var("FWPM_DISABLE_PROGRESSBAR")
            .map(|v| !is_truthy(&v))
            .unwrap_or(true);

        let auth_token = runtime
            .env_var("FWPM_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        debug!(
            "Config: core_dir={:?}, registry={}, systype={}",
            core_dir, registry_url, systype
        );

        Ok(Self {
            core_dir,
            registry_url,
            systype,
            progress,
            auth_token,
        })
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.core_dir.join("packages")
    }

    pub fn platforms_dir(&self) -> PathBuf {
        self.core_dir.join("platforms")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.core_dir.join("lib")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.core_dir.join(".cache").join("downloads")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.core_dir.join(".cache").join("tmp")
    }

    /// Shared HTTP client carrying the user agent and optional bearer token.
    pub fn http_client(&self) -> Result<Client> {
        self.http_client_builder()?
            .build()
            .context("Failed to build HTTP client")
    }

    /// Builder preloaded with the shared headers, for clients that need
    /// a different redirect policy.
    pub fn http_client_builder(&self) -> Result<ClientBuilder> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.auth_token {
            let mut auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("FWPM_AUTH_TOKEN contains invalid characters")?;
            auth_value.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth_value);
            debug!("Using FWPM_AUTH_TOKEN for registry authentication");
        }

        Ok(Client::builder()
            .user_agent(format!("fwpm/{}", env!("FWPM_VERSION")))
            .default_headers(headers))
    }
}

/// System type of the running host, in registry notation.
pub fn host_systype() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match (os, std::env::consts::ARCH) {
        ("windows", "x86_64") => "amd64",
        ("windows", "x86") => "x86",
        ("darwin", "aarch64") => "arm64",
        ("linux", "arm") => "armv7l",
        (_, arch) => arch,
    };
    format!("{}_{}", os, arch)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
