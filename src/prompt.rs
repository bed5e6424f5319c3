use crate::cli::Args;
use crate::constants::EMPTY_MESSAGE_ERROR;
use crate::profiles::Profile;
use crate::tools::ToolKind;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::Read;

pub(crate) fn load_task(args: &Args) -> Result<String> {
    let task = if let Some(prompt_file) = &args.prompt_file {
        let mut buf = String::new();
        File::open(prompt_file)
            .with_context(|| format!("failed to open prompt file {}", prompt_file.display()))?
            .read_to_string(&mut buf)
            .with_context(|| format!("failed to read prompt file {}", prompt_file.display()))?;
        buf
    } else if let Some(prompt) = &args.prompt {
        prompt.clone()
    } else {
        bail!("prompt or prompt_file is required")
    };
    if task.trim().is_empty() {
        bail!(EMPTY_MESSAGE_ERROR);
    }
    Ok(task)
}

/// The profile's persona followed by a short listing of the tools it may call.
pub(crate) fn build_system_prompt(profile: &Profile) -> String {
    let mut prompt = profile.system_prompt.to_string();
    if profile.tools.is_empty() {
        return prompt;
    }
    prompt.push_str("\n\nTools:\n");
    for tool in profile.tools {
        let usage = match tool {
            ToolKind::Calculator => "calculator(expression): exact arithmetic",
            ToolKind::TextAnalysis => "text_analysis(filepath): read or summarize an attached file",
        };
        prompt.push_str("- ");
        prompt.push_str(usage);
        prompt.push('\n');
    }
    prompt.push_str("Tool outputs are authoritative; prefer them over guessing.");
    prompt
}
