//! Deterministic per-identity fingerprint generation.
//!
//! Each identity (workspace account) gets one stable, plausible device
//! profile. Stability matters more than entropy here: the platform tracks
//! device consistency across logins, so re-deriving the same profile for
//! the same identity on every attempt is the whole point.

use serde::{Deserialize, Serialize};

/// The bundle of spoofed browser/device attributes presented to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintProfile {
    pub user_agent: String,
    pub platform: String,
    pub language: String,
    pub languages: Vec<String>,
    pub screen_width: u32,
    pub screen_height: u32,
    pub color_depth: u32,
    pub timezone: String,
    pub utc_offset_minutes: i32,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub hardware_concurrency: u32,
    pub device_memory: u32,
    pub plugin_count: u32,
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
];

const RESOLUTIONS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1536, 864),
    (2560, 1440),
    (1440, 900),
    (1680, 1050),
];

const LANGUAGE_SETS: &[&[&str]] = &[
    &["en-US", "en"],
    &["en-GB", "en"],
    &["en-US", "en", "es"],
    &["en-CA", "en", "fr"],
];

/// IANA name paired with its standard-time UTC offset in minutes.
const TIMEZONES: &[(&str, i32)] = &[
    ("America/New_York", -300),
    ("America/Chicago", -360),
    ("America/Los_Angeles", -480),
    ("Europe/London", 0),
    ("Europe/Berlin", 60),
];

const GPUS: &[(&str, &str)] = &[
    ("Google Inc. (NVIDIA)", "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0, D3D11)"),
    ("Google Inc. (Intel)", "ANGLE (Intel, Intel(R) UHD Graphics 630 Direct3D11 vs_5_0 ps_5_0, D3D11)"),
    ("Google Inc. (AMD)", "ANGLE (AMD, AMD Radeon RX 6700 XT Direct3D11 vs_5_0 ps_5_0, D3D11)"),
    ("Apple Inc.", "Apple M2 Pro"),
    ("Google Inc. (Intel)", "ANGLE (Intel, Intel(R) Iris(R) Xe Graphics Direct3D11 vs_5_0 ps_5_0, D3D11)"),
];

/// (hardware_concurrency, device_memory)
const HARDWARE: &[(u32, u32)] = &[(8, 8), (4, 8), (8, 16), (12, 16), (6, 8), (16, 32)];

/// Position-weighted char-code sum. Cheap and stable; collisions across
/// identities are acceptable, drift for one identity is not.
fn identity_hash(identity: &str) -> u64 {
    identity
        .chars()
        .enumerate()
        .map(|(i, c)| (c as u64) * (i as u64 + 1))
        .sum()
}

fn platform_for_user_agent(user_agent: &str) -> &'static str {
    if user_agent.contains("Macintosh") {
        "MacIntel"
    } else if user_agent.contains("Linux") {
        "Linux x86_64"
    } else {
        "Win32"
    }
}

/// Derive the stable fingerprint for an identity. Pure and infallible:
/// the same identity always yields a byte-identical profile.
pub fn generate(identity: &str) -> FingerprintProfile {
    let hash = identity_hash(identity);

    let user_agent = USER_AGENTS[(hash % USER_AGENTS.len() as u64) as usize];
    let (width, height) = RESOLUTIONS[(hash % RESOLUTIONS.len() as u64) as usize];
    let languages = LANGUAGE_SETS[(hash % LANGUAGE_SETS.len() as u64) as usize];
    let (timezone, utc_offset_minutes) = TIMEZONES[(hash % TIMEZONES.len() as u64) as usize];
    let (webgl_vendor, webgl_renderer) = GPUS[(hash % GPUS.len() as u64) as usize];
    let (hardware_concurrency, device_memory) = HARDWARE[(hash % HARDWARE.len() as u64) as usize];

    FingerprintProfile {
        user_agent: user_agent.to_string(),
        platform: platform_for_user_agent(user_agent).to_string(),
        language: languages[0].to_string(),
        languages: languages.iter().map(|s| s.to_string()).collect(),
        screen_width: width,
        screen_height: height,
        color_depth: 24,
        timezone: timezone.to_string(),
        utc_offset_minutes,
        webgl_vendor: webgl_vendor.to_string(),
        webgl_renderer: webgl_renderer.to_string(),
        hardware_concurrency,
        device_memory,
        plugin_count: 3 + (hash % 4) as u32,
    }
}

impl FingerprintProfile {
    /// `Accept-Language` header value derived from the ordered language list.
    pub fn accept_language(&self) -> String {
        let mut parts = Vec::with_capacity(self.languages.len());
        for (i, lang) in self.languages.iter().enumerate() {
            if i == 0 {
                parts.push(lang.clone());
            } else {
                // q-values descend in 0.1 steps, floored at 0.5
                let q = (10 - i.min(5)) as f32 / 10.0;
                parts.push(format!("{};q={:.1}", lang, q));
            }
        }
        parts.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_identity_yields_identical_profile() {
        let a = generate("abc");
        let b = generate("abc");
        assert_eq!(a, b);
    }

    #[test]
    fn profile_is_internally_consistent() {
        let profile = generate("workspace-42@example.com");

        assert_eq!(
            profile.platform,
            platform_for_user_agent(&profile.user_agent)
        );
        assert_eq!(profile.language, profile.languages[0]);
        assert!(profile.plugin_count >= 3 && profile.plugin_count <= 6);
        assert_eq!(profile.color_depth, 24);
    }

    #[test]
    fn mac_user_agent_maps_to_mac_platform() {
        assert_eq!(
            platform_for_user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)"),
            "MacIntel"
        );
        assert_eq!(
            platform_for_user_agent("Mozilla/5.0 (X11; Linux x86_64)"),
            "Linux x86_64"
        );
        assert_eq!(
            platform_for_user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64)"),
            "Win32"
        );
    }

    #[test]
    fn different_identities_usually_diverge() {
        let profiles: Vec<_> = (0..12)
            .map(|i| generate(&format!("user-{}@example.com", i)))
            .collect();

        let distinct: std::collections::HashSet<_> =
            profiles.iter().map(|p| p.user_agent.clone()).collect();
        assert!(distinct.len() > 1, "pool selection should spread");
    }

    #[test]
    fn accept_language_orders_by_preference() {
        let profile = generate("abc");
        let header = profile.accept_language();
        assert!(header.starts_with(&profile.language));
        if profile.languages.len() > 1 {
            assert!(header.contains(";q=0.9"));
        }
    }
}
