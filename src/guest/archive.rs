/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use flate2::{write::GzEncoder, Compression};
use std::{fs::File, path::PathBuf};
use tracing::warn;

/// Packs `files` flat into a gzipped tarball at `archive`. Files that don't exist are skipped.
/// Outputs are cleared before each round, so a missing file means that worker wrote nothing.
/// Returns how many files were packed.
pub async fn pack(archive: PathBuf, files: Vec<PathBuf>) -> anyhow::Result<usize> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let file =
            File::create(&archive).context(format!("Error creating archive {archive:?}"))?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::new(5)));

        let mut packed = 0;
        for path in &files {
            let Some(name) = path.file_name() else {
                continue;
            };
            if !path.is_file() {
                warn!("Missing result file {path:?}, leaving it out of the archive");
                continue;
            }

            builder
                .append_path_with_name(path, name)
                .context(format!("Error adding {path:?} to {archive:?}"))?;
            packed += 1;
        }

        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .context(format!("Error finishing archive {archive:?}"))?;

        Ok(packed)
    })
    .await
    .context("archive task panicked")?
}
