/// Deduplicates one warning channel by message text.
///
/// A message is forwarded only when it differs from the one currently active; clearing
/// forwards only when something was active.
#[derive(Debug, Clone, Default)]
pub struct WarningChannel {
    active: Option<String>,
}

impl WarningChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Returns true when the message should be emitted.
    pub fn raise(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if self.active.as_deref() == Some(message.as_str()) {
            return false;
        }
        self.active = Some(message);
        true
    }

    /// Returns true when a previously active warning should be cleared downstream.
    pub fn clear(&mut self) -> bool {
        self.active.take().is_some()
    }
}
