use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Copies an uploaded file into `upload_dir` under its own name, reusing an earlier copy.
pub(crate) fn stage_attachment(upload_dir: &Path, source: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| anyhow!("attachment has no file name: {}", source.display()))?;
    let dest = upload_dir.join(name);
    if dest.exists() {
        return Ok(dest);
    }
    fs::create_dir_all(upload_dir)
        .with_context(|| format!("failed to create upload directory {}", upload_dir.display()))?;
    fs::copy(source, &dest).with_context(|| {
        format!(
            "failed to copy attachment {} to {}",
            source.display(),
            dest.display()
        )
    })?;
    tracing::info!("attachment saved to {}", dest.display());
    Ok(dest)
}

/// The human message text with a pointer to every staged attachment.
pub(crate) fn compose_human_message(text: &str, staged: &[PathBuf]) -> String {
    let mut message = text.to_string();
    for path in staged {
        message.push_str(&format!(
            "\nThe file is attached and available at filepath: {}",
            path.display()
        ));
    }
    message
}
