use super::PlayerSource;
use crate::track::TrackSnapshot;

/// Stand-in for a source that could not be built. Always empty.
pub struct DisabledSource {
    label: String,
    reason: String,
    warned: bool,
}

impl DisabledSource {
    pub fn new(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { label: label.into(), reason: reason.into(), warned: false }
    }
}

impl PlayerSource for DisabledSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn query(&mut self) -> Option<TrackSnapshot> {
        if !self.warned {
            tracing::warn!("[Source] {} disabled for this session: {}", self.label, self.reason);
            self.warned = true;
        }
        None
    }

    fn release(&mut self) {}
}
