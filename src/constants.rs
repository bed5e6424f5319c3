pub(crate) const DEFAULT_MAX_TOOL_OUTPUT_CHARS: usize = 8000;
pub(crate) const DEFAULT_CSV_PREVIEW_ROWS: usize = 5;
pub(crate) const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub(crate) const EMPTY_MESSAGE_ERROR: &str = "you can't send an empty message";
