#![no_main]
use libfuzzer_sys::fuzz_target;
use reelguard_core::detector::detect;
use reelguard_core::{MonitoredTarget, SnapshotNode, SnapshotProvider, WindowTreeProvider};
use std::collections::HashSet;

fuzz_target!(|data: &[u8]| {
    let Ok(node) = serde_json::from_slice::<SnapshotNode>(data) else { return };
    let provider = SnapshotProvider::new(Some(node));
    let identifiers: HashSet<String> = MonitoredTarget::YouTube
        .fallback_identifiers()
        .iter()
        .map(|id| id.to_string())
        .collect();

    {
        let root = provider.root_in_active_window();
        let _ = detect(root.as_deref(), &identifiers, MonitoredTarget::YouTube.keywords());
    }
    assert_eq!(provider.stats().outstanding(), 0);
});
