//! Fixed mapping from pipeline stage numbers to displayed progress.

/// Progress shown once a success notification lands
pub const SUCCESS_PERCENT: u8 = 100;
pub const SUCCESS_MESSAGE: &str = "Successfully Uploaded";

pub const UPLOADING_MESSAGE: &str = "Uploading…";
pub const RECONNECTING_MESSAGE: &str = "Reconnecting…";

/// Map a pipeline stage to (percent, message).
///
/// Stage 6 has no mapping: the pipeline advances from Finalize (5) straight
/// to the terminal success stage (7), which arrives as a success frame, not
/// a step. Unknown stages return `None` and are ignored by callers.
pub fn stage_progress(step: u8) -> Option<(u8, &'static str)> {
    match step {
        1 => Some((20, "Extracting document information…")),
        2 => Some((40, "Classifying document…")),
        3 => Some((60, "Generating embeddings…")),
        4 => Some((80, "Saving document data…")),
        5 => Some((90, "Finalizing…")),
        _ => None,
    }
}
