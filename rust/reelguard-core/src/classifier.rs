//! UI event intake.

use crate::target::MonitoredTarget;
use serde::{Deserialize, Serialize};

/// Kind of UI change reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiEventType {
    WindowStateChanged,
    ViewScrolled,
    ViewFocused,
    /// Any other platform event code.
    Other(u32),
}

impl UiEventType {
    /// Only window, scroll and focus changes can reveal a new surface.
    pub fn is_relevant(self) -> bool {
        matches!(
            self,
            UiEventType::WindowStateChanged | UiEventType::ViewScrolled | UiEventType::ViewFocused
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiEvent {
    pub event_type: UiEventType,
    pub package: String,
}

impl UiEvent {
    pub fn new(event_type: UiEventType, package: impl Into<String>) -> Self {
        Self {
            event_type,
            package: package.into(),
        }
    }

    /// An event of `event_type` from `target`'s package.
    pub fn for_target(event_type: UiEventType, target: MonitoredTarget) -> Self {
        Self::new(event_type, target.package())
    }
}

/// Route an event to the target it concerns. Irrelevant event types and
/// unmonitored packages are dropped.
pub fn classify(event: &UiEvent) -> Option<MonitoredTarget> {
    if !event.event_type.is_relevant() {
        return None;
    }
    MonitoredTarget::from_package(&event.package)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_relevant_events() {
        for event_type in [
            UiEventType::WindowStateChanged,
            UiEventType::ViewScrolled,
            UiEventType::ViewFocused,
        ] {
            assert_eq!(
                classify(&UiEvent::for_target(event_type, MonitoredTarget::YouTube)),
                Some(MonitoredTarget::YouTube)
            );
            assert_eq!(
                classify(&UiEvent::for_target(event_type, MonitoredTarget::Instagram)),
                Some(MonitoredTarget::Instagram)
            );
        }
    }

    #[test]
    fn test_drops_other_types() {
        let event = UiEvent::for_target(UiEventType::Other(2048), MonitoredTarget::YouTube);
        assert_eq!(classify(&event), None);
    }

    #[test]
    fn test_drops_unmonitored_packages() {
        let event = UiEvent::new(UiEventType::WindowStateChanged, "com.android.chrome");
        assert_eq!(classify(&event), None);
    }

    #[test]
    fn test_event_json() {
        let event: UiEvent =
            serde_json::from_str(r#"{"event_type":"view_scrolled","package":"com.instagram.android"}"#)
                .unwrap();
        assert_eq!(classify(&event), Some(MonitoredTarget::Instagram));

        let other: UiEvent =
            serde_json::from_str(r#"{"event_type":{"other":64},"package":"com.instagram.android"}"#)
                .unwrap();
        assert_eq!(other.event_type, UiEventType::Other(64));
    }
}
