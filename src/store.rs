/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::StoreConfig;
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where guests put their result archives.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores the file at `local` under the `/`-separated key `remote`.
    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<()>;
}

pub fn from_config(config: &StoreConfig) -> Box<dyn ObjectStore> {
    match config {
        StoreConfig::Http { url, token } => Box::new(HttpStore::new(url, token.clone())),
        StoreConfig::Directory { path } => Box::new(DirectoryStore::new(path.clone())),
    }
}

// //////////////////////////////////////
// HttpStore

/// Object storage reachable by plain HTTP PUT, e.g. a bucket endpoint.
pub struct HttpStore {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}
impl HttpStore {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        let base_url = base_url.strip_suffix('/').unwrap_or(base_url);
        Self {
            base_url: String::from(base_url),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn url_for(&self, remote: &str) -> String {
        format!("{}/{}", self.base_url, remote.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<()> {
        let body = tokio::fs::read(local)
            .await
            .context(format!("Error reading archive {local:?}"))?;
        let url = self.url_for(remote);
        debug!("PUT {} ({} bytes)", url, body.len());

        let mut request = self.client.put(&url).body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        request
            .send()
            .await?
            .error_for_status()
            .map(|_| ())
            .context(format!("Error uploading {local:?} to {url}"))
    }
}

// //////////////////////////////////////
// DirectoryStore

/// Stores archives below a local or mounted directory.
pub struct DirectoryStore {
    root: PathBuf,
}
impl DirectoryStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ObjectStore for DirectoryStore {
    async fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<()> {
        let target = remote
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part));

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(format!("Error creating {parent:?}"))?;
        }
        tokio::fs::copy(local, &target)
            .await
            .map(|_| ())
            .context(format!("Error copying {local:?} to {target:?}"))
    }
}
