//! Build script for fwsync
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `fwsync --version` and logged at startup.

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
