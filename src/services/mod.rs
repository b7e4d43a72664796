pub mod catalog;
pub mod claimer;
pub mod inference;
pub mod key_pool;
pub mod reaper;
pub mod reconcile;
pub mod recorder;
pub mod retry;
pub mod scheduler;
pub mod storage;

/// Cap an upstream error body so it fits comfortably in `last_error`.
pub(crate) fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}
