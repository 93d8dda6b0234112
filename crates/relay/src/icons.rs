use std::path::{Path, PathBuf};

/// Resolves notification icon names to `file://` URIs under a fixed directory.
#[derive(Debug, Clone)]
pub struct IconResolver {
    dir: PathBuf,
    default_icon: String,
}

impl IconResolver {
    pub fn new(dir: impl Into<PathBuf>, default_icon: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            default_icon: default_icon.into(),
        }
    }

    /// `icon_file` is looked up when given, otherwise the default icon.
    /// Returns `None` when the chosen file does not exist.
    pub fn resolve(&self, icon_file: Option<&str>) -> Option<String> {
        let path = self.dir.join(icon_file.unwrap_or(&self.default_icon));

        if !path.is_file() {
            tracing::debug!(path = %path.display(), "Icon file not found, registering without icon");
            return None;
        }

        Some(file_uri(&path))
    }
}

fn file_uri(path: &Path) -> String {
    let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let display = absolute.display().to_string().replace('\\', "/");

    if display.starts_with('/') {
        format!("file://{}", display)
    } else {
        format!("file:///{}", display)
    }
}
