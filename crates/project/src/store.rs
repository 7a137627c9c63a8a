use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{ArrangementDoc, ProjectError};

pub const PROJECT_EXTENSION: &str = "studioproj";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub last_modified: SystemTime,
}

/// Where saved projects live.
pub trait ProjectStore: Send + Sync {
    /// Saved projects, most recently modified first. With `project_id`, only
    /// that project (if it exists).
    fn list(
        &self,
        project_id: Option<&str>,
    ) -> impl Future<Output = Result<Vec<ProjectSummary>, ProjectError>> + Send;

    /// `Ok(true)` when the project was removed, `Ok(false)` when it did not exist.
    fn delete(&self, id: &str) -> impl Future<Output = Result<bool, ProjectError>> + Send;
}

/// One arrangement document per file in a directory, named `<id>.studioproj`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, ProjectError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ProjectError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(format!("{id}.{PROJECT_EXTENSION}")))
    }

    pub async fn save(&self, doc: &ArrangementDoc) -> Result<(), ProjectError> {
        let path = self.path_for(&doc.id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, doc.to_json()?).await?;
        log::debug!("saved project '{}' to {}", doc.id, path.display());
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<ArrangementDoc, ProjectError> {
        let path = self.path_for(id)?;
        let bytes = tokio::fs::read(&path).await?;
        ArrangementDoc::from_slice(&bytes)
    }

    async fn summarize(path: &Path) -> Result<ProjectSummary, ProjectError> {
        let bytes = tokio::fs::read(path).await?;
        let doc = ArrangementDoc::from_slice(&bytes).map_err(|e| ProjectError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(ProjectSummary {
            id: doc.id,
            name: doc.name,
            last_modified: UNIX_EPOCH + Duration::from_millis(doc.updated_at),
        })
    }
}

impl ProjectStore for DirectoryStore {
    async fn list(&self, project_id: Option<&str>) -> Result<Vec<ProjectSummary>, ProjectError> {
        if let Some(id) = project_id {
            let path = self.path_for(id)?;
            return match Self::summarize(&path).await {
                Ok(summary) => Ok(vec![summary]),
                Err(ProjectError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
                Err(e) => Err(e),
            };
        }

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut projects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PROJECT_EXTENSION) {
                continue;
            }
            match Self::summarize(&path).await {
                Ok(summary) => projects.push(summary),
                Err(err) => log::warn!("skipping project file: {err}"),
            }
        }

        projects.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(projects)
    }

    async fn delete(&self, id: &str) -> Result<bool, ProjectError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                log::info!("deleted project '{id}'");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
