//! Artifact upload
//!
//! Object storage is external; the core talks to it through `ArtifactStore`.
//! The local-directory implementation stands in for the real store and keeps
//! the same URI contract. All content passes through the secret masker
//! before upload.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{NecroError, Result};
use crate::registry::task::{Artifact, ArtifactKind};

use super::secrets::SecretMasker;

/// Upload seam for DIFF / LOG / TEST_RESULT content
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `content` for (spec, task) and return the artifact reference.
    async fn upload(
        &self,
        spec: &str,
        task_id: &str,
        kind: ArtifactKind,
        content: &str,
    ) -> Result<Artifact>;
}

/// Filesystem-backed store: `<root>/<spec>/<task_id>/<kind>.<ext>`
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn extension(kind: ArtifactKind) -> &'static str {
        match kind {
            ArtifactKind::Diff => "diff",
            ArtifactKind::Log => "log",
            ArtifactKind::TestResult => "json",
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn upload(
        &self,
        spec: &str,
        task_id: &str,
        kind: ArtifactKind,
        content: &str,
    ) -> Result<Artifact> {
        let dir = self.root.join(spec).join(task_id);
        let path = dir.join(format!(
            "{}.{}",
            kind.to_string().to_lowercase(),
            Self::extension(kind)
        ));

        let write = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, content.as_bytes()).await?;
            Ok::<(), std::io::Error>(())
        };
        write.await.map_err(|e| NecroError::ArtifactUpload {
            kind: kind.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Artifact {
            kind,
            uri: format!("file://{}", path.display()),
            size_bytes: content.len() as u64,
            metadata: HashMap::new(),
        })
    }
}

/// Upload the three standard artifacts of a run: the commit diff, the masked
/// execution log, and the test-result JSON. Partial failures skip the
/// offending artifact and keep going; the caller gets everything that made it.
pub async fn upload_run_artifacts(
    store: &dyn ArtifactStore,
    masker: &SecretMasker,
    spec: &str,
    task_id: &str,
    diff: Option<&str>,
    execution_log: &str,
    test_result_json: Option<&str>,
) -> Vec<Artifact> {
    let mut uploaded = Vec::new();

    if let Some(diff) = diff {
        match store
            .upload(spec, task_id, ArtifactKind::Diff, &masker.mask(diff))
            .await
        {
            Ok(artifact) => uploaded.push(artifact),
            Err(e) => tracing::warn!(error = %e, "diff upload failed"),
        }
    }

    match store
        .upload(spec, task_id, ArtifactKind::Log, &masker.mask(execution_log))
        .await
    {
        Ok(artifact) => uploaded.push(artifact),
        Err(e) => tracing::warn!(error = %e, "log upload failed"),
    }

    if let Some(json) = test_result_json {
        match store
            .upload(spec, task_id, ArtifactKind::TestResult, &masker.mask(json))
            .await
        {
            Ok(artifact) => uploaded.push(artifact),
            Err(e) => tracing::warn!(error = %e, "test result upload failed"),
        }
    }

    uploaded
}
