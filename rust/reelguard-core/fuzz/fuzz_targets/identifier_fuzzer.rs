#![no_main]
use libfuzzer_sys::fuzz_target;
use reelguard_core::cache::qualify;
use reelguard_core::{validate_identifiers, MonitoredTarget};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else { return };
    let ids: Vec<String> = raw.split('\n').map(str::to_string).collect();

    if validate_identifiers(&ids).is_ok() {
        for id in &ids {
            let qualified = qualify(MonitoredTarget::YouTube, id);
            assert!(qualified.contains(":id/"));
        }
    }
});
