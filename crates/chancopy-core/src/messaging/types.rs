/// Limits of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    /// Longer status texts are cut with an ellipsis before sending.
    pub max_message_len: usize,
}

impl Default for MessagingCapabilities {
    fn default() -> Self {
        Self {
            max_message_len: 4096,
        }
    }
}
