use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::{io_error, ClassifiedError, ErrorCode, Result};
use crate::template::{resolve, Variables};

/// Produces artifact content from a template.
///
/// An undefined required variable is a fatal error, never a blank.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, template: &str, variables: &Variables) -> Result<String>;
}

/// Renders `${var}` templates read from a directory.
#[derive(Debug, Clone)]
pub struct FileTemplateRenderer {
    template_dir: PathBuf,
}

impl FileTemplateRenderer {
    pub fn new(template_dir: impl AsRef<Path>) -> Self {
        Self {
            template_dir: template_dir.as_ref().to_path_buf(),
        }
    }

    fn template_path(&self, template: &str) -> Result<PathBuf> {
        let relative = Path::new(template);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ClassifiedError::fatal(
                ErrorCode::RenderFailed,
                format!("template path '{}' escapes the template directory", template),
            ));
        }
        Ok(self.template_dir.join(relative))
    }
}

#[async_trait]
impl Renderer for FileTemplateRenderer {
    async fn render(&self, template: &str, variables: &Variables) -> Result<String> {
        let path = self.template_path(template)?;
        debug!("Rendering template {}", path.display());

        let source = match fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ClassifiedError::fatal(
                    ErrorCode::RenderFailed,
                    format!("template '{}' not found", template),
                )
                .with_context("path", path.display().to_string()));
            }
            Err(e) => return Err(io_error("read", &path, e)),
        };

        resolve(&source, variables)
            .map_err(|e| ClassifiedError::from(e).with_context("template", template))
    }
}
