//! Registry client over the registry's HTTP API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode, redirect::Policy};
use std::path::Path;

use super::{MirrorLocation, PublishResult, RegistryClient, RegistryPackage, SearchQuery, SearchResult};
use crate::config::Config;
use crate::download::file_sha256;
use crate::http::{HttpClient, is_not_found};
use crate::package::PackageType;

const MIRROR_HEADER: &str = "X-Registry-Mirror";
const CHECKSUM_HEADER: &str = "X-Registry-Content-SHA256";

pub struct HttpRegistryClient {
    http_client: HttpClient,
    /// Same headers, but redirects are reported instead of followed.
    mirror_client: Client,
    api_url: String,
}

impl HttpRegistryClient {
    pub fn new(http_client: HttpClient, mirror_client: Client, api_url: &str) -> Self {
        Self {
            http_client,
            mirror_client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mirror_client = config
            .http_client_builder()?
            .redirect(Policy::none())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::new(
            HttpClient::new(config.http_client()?),
            mirror_client,
            &config.registry_url,
        ))
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn list_packages(&self, query: &SearchQuery) -> Result<Vec<RegistryPackage>> {
        let url = format!("{}/v3/search", self.api_url);
        let text = query.to_query_string();
        debug!("Searching registry for {}", text);
        let result: SearchResult = self
            .http_client
            .get_json(&url, &[("query", text)])
            .await
            .context("Failed to search the registry")?;
        Ok(result.items)
    }

    async fn get_package(
        &self,
        pkg_type: PackageType,
        owner: &str,
        name: &str,
        version: Option<String>,
    ) -> Result<Option<RegistryPackage>> {
        let url = format!(
            "{}/v3/packages/{}/{}/{}",
            self.api_url,
            owner.to_lowercase(),
            pkg_type,
            name.to_lowercase()
        );
        let query: Vec<(&str, String)> = version.into_iter().map(|v| ("version", v)).collect();
        match self.http_client.get_json(&url, &query).await {
            Ok(package) => Ok(Some(package)),
            Err(e) if is_not_found(&e) => {
                debug!("Registry has no package {}/{}", owner, name);
                Ok(None)
            }
            Err(e) => Err(e.context(format!("Failed to fetch package {}/{}", owner, name))),
        }
    }

    async fn publish_package(
        &self,
        owner: &str,
        pkg_type: PackageType,
        archive: &Path,
        released_at: Option<String>,
        private: bool,
    ) -> Result<PublishResult> {
        let url = format!("{}/v3/packages/{}/{}", self.api_url, owner, pkg_type);
        let body = tokio::fs::read(archive)
            .await
            .with_context(|| format!("Failed to read {:?}", archive))?;
        let sha256 = file_sha256(archive)?;

        let mut query = vec![
            ("private", u8::from(private).to_string()),
            ("sha256", sha256),
        ];
        if let Some(released_at) = released_at {
            query.push(("released_at", released_at));
        }
        self.http_client
            .post_bytes(&url, &query, "application/octet-stream", body)
            .await
            .with_context(|| format!("Failed to publish {:?}", archive))
    }

    async fn next_mirror(
        &self,
        download_url: &str,
        visited: &[String],
    ) -> Result<Option<MirrorLocation>> {
        let mut request = self.mirror_client.head(download_url);
        if !visited.is_empty() {
            request = request.query(&[("bypass", visited.join(","))]);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to resolve mirror for {}", download_url))?;

        if !matches!(
            response.status(),
            StatusCode::FOUND | StatusCode::TEMPORARY_REDIRECT
        ) {
            return Ok(None);
        }
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .filter(|v| !v.is_empty())
        };
        let (Some(url), Some(mirror)) = (header(reqwest::header::LOCATION.as_str()), header(MIRROR_HEADER))
        else {
            return Ok(None);
        };
        if visited.contains(&mirror) {
            return Ok(None);
        }
        debug!("Mirror {} serves {}", mirror, download_url);
        Ok(Some(MirrorLocation {
            mirror,
            url,
            checksum: header(CHECKSUM_HEADER),
        }))
    }
}
