//! Browser fingerprint profiles.
//!
//! Picks a self-consistent identity (user agent, viewport, locale, client
//! hints) from a small catalog of realistic desktop setups, plus the launch
//! flags and init scripts that hide the usual automation markers. Stateless:
//! every call draws a fresh profile.

use rand::seq::SliceRandom;
use std::collections::BTreeMap;

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";
const ACCEPT_LANGUAGE: &str = "pt-BR,pt;q=0.9,en;q=0.8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StealthProfile {
    pub name: &'static str,
    pub user_agent: String,
    pub viewport: Viewport,
    pub locale: String,
    pub timezone: String,
    pub platform: String,
    pub accept_language: String,
    pub hardware_concurrency: u8,
    pub device_memory_gb: u8,
    pub headers: BTreeMap<String, String>,
}

impl StealthProfile {
    /// Languages advertised through `navigator.languages`.
    pub fn languages(&self) -> Vec<String> {
        self.accept_language
            .split(',')
            .map(|part| part.split(';').next().unwrap_or(part).trim().to_string())
            .filter(|lang| !lang.is_empty())
            .collect()
    }
}

struct ProfileTemplate {
    name: &'static str,
    user_agent: &'static str,
    viewport: Viewport,
    platform: &'static str,
    ch_platform: &'static str,
    chrome_major: u16,
    hardware_concurrency: u8,
    device_memory_gb: u8,
}

const CATALOG: &[ProfileTemplate] = &[
    ProfileTemplate {
        name: "windows10-chrome120",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        viewport: Viewport { width: 1920, height: 1080 },
        platform: "Win32",
        ch_platform: "Windows",
        chrome_major: 120,
        hardware_concurrency: 8,
        device_memory_gb: 8,
    },
    ProfileTemplate {
        name: "windows11-chrome119",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
        viewport: Viewport { width: 1366, height: 768 },
        platform: "Win32",
        ch_platform: "Windows",
        chrome_major: 119,
        hardware_concurrency: 4,
        device_memory_gb: 16,
    },
    ProfileTemplate {
        name: "macos-chrome120",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        viewport: Viewport { width: 1440, height: 900 },
        platform: "MacIntel",
        ch_platform: "macOS",
        chrome_major: 120,
        hardware_concurrency: 8,
        device_memory_gb: 16,
    },
];

/// Stateless fingerprint source.
#[derive(Debug, Clone, Copy, Default)]
pub struct StealthProvider;

impl StealthProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn random_profile(&self) -> StealthProfile {
        random_profile()
    }

    pub fn realistic_headers(&self) -> BTreeMap<String, String> {
        realistic_headers()
    }

    pub fn launch_args(&self, profile: &StealthProfile) -> Vec<String> {
        launch_args(profile)
    }

    pub fn init_scripts(&self, profile: &StealthProfile) -> Vec<String> {
        init_scripts(profile)
    }
}

pub fn random_profile() -> StealthProfile {
    let mut rng = rand::thread_rng();
    let template = CATALOG.choose(&mut rng).unwrap_or(&CATALOG[0]);
    build_profile(template)
}

fn build_profile(template: &ProfileTemplate) -> StealthProfile {
    let mut headers = realistic_headers();
    headers.insert(
        "sec-ch-ua".into(),
        format!(
            "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{major}\", \"Google Chrome\";v=\"{major}\"",
            major = template.chrome_major
        ),
    );
    headers.insert(
        "sec-ch-ua-platform".into(),
        format!("\"{}\"", template.ch_platform),
    );

    StealthProfile {
        name: template.name,
        user_agent: template.user_agent.to_string(),
        viewport: template.viewport,
        locale: "pt-BR".into(),
        timezone: "America/Sao_Paulo".into(),
        platform: template.platform.to_string(),
        accept_language: ACCEPT_LANGUAGE.into(),
        hardware_concurrency: template.hardware_concurrency,
        device_memory_gb: template.device_memory_gb,
        headers,
    }
}

/// Navigation headers of a regular desktop Chrome.
pub fn realistic_headers() -> BTreeMap<String, String> {
    [
        ("Accept", ACCEPT),
        ("Accept-Encoding", "gzip, deflate, br"),
        ("Accept-Language", ACCEPT_LANGUAGE),
        ("Cache-Control", "max-age=0"),
        ("DNT", "1"),
        ("Upgrade-Insecure-Requests", "1"),
        ("Sec-Fetch-Dest", "document"),
        ("Sec-Fetch-Mode", "navigate"),
        ("Sec-Fetch-Site", "none"),
        ("Sec-Fetch-User", "?1"),
        (
            "sec-ch-ua",
            "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"",
        ),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", "\"Windows\""),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

/// Chromium flags that drop automation markers. The window size follows the
/// profile viewport. The profile dir is left to the launcher, which owns its
/// lifetime.
pub fn launch_args(profile: &StealthProfile) -> Vec<String> {
    let mut args: Vec<String> = [
        "--no-sandbox",
        "--disable-setuid-sandbox",
        "--disable-dev-shm-usage",
        "--disable-blink-features=AutomationControlled",
        "--disable-features=TranslateUI,VizDisplayCompositor",
        "--disable-component-extensions-with-background-pages",
        "--disable-default-apps",
        "--disable-extensions",
        "--disable-background-timer-throttling",
        "--disable-backgrounding-occluded-windows",
        "--disable-renderer-backgrounding",
        "--disable-ipc-flooding-protection",
        "--no-first-run",
        "--no-pings",
        "--no-zygote",
        "--disable-sync",
        "--disable-background-networking",
        "--disable-client-side-phishing-detection",
        "--disable-component-update",
        "--disable-domain-reliability",
        "--disable-gpu",
        "--hide-scrollbars",
        "--mute-audio",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect();

    args.push(format!(
        "--window-size={},{}",
        profile.viewport.width, profile.viewport.height
    ));
    args.push(format!("--lang={}", profile.locale));
    args
}

/// Scripts evaluated on every new document before page scripts run.
pub fn init_scripts(profile: &StealthProfile) -> Vec<String> {
    let languages = serde_json::to_string(&profile.languages()).unwrap_or_else(|_| "[]".into());
    vec![
        "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });".to_string(),
        "window.chrome = window.chrome || { runtime: {} };".to_string(),
        format!("Object.defineProperty(navigator, 'languages', {{ get: () => {languages} }});"),
        format!(
            "Object.defineProperty(navigator, 'platform', {{ get: () => '{}' }});",
            profile.platform
        ),
        format!(
            "Object.defineProperty(navigator, 'hardwareConcurrency', {{ get: () => {} }});",
            profile.hardware_concurrency
        ),
        format!(
            "Object.defineProperty(navigator, 'deviceMemory', {{ get: () => {} }});",
            profile.device_memory_gb
        ),
        "Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_come_from_catalog() {
        for _ in 0..20 {
            let profile = random_profile();
            assert!(CATALOG.iter().any(|t| t.name == profile.name));
        }
    }

    #[test]
    fn client_hints_match_user_agent() {
        for template in CATALOG {
            let profile = build_profile(template);
            let platform = &profile.headers["sec-ch-ua-platform"];
            if profile.user_agent.contains("Macintosh") {
                assert_eq!(platform, "\"macOS\"");
                assert_eq!(profile.platform, "MacIntel");
            } else {
                assert_eq!(platform, "\"Windows\"");
            }
            let major = format!("Chrome/{}", template.chrome_major);
            assert!(profile.user_agent.contains(&major));
        }
    }

    #[test]
    fn launch_args_follow_viewport() {
        let profile = build_profile(&CATALOG[2]);
        let args = launch_args(&profile);
        assert!(args.contains(&"--window-size=1440,900".to_string()));
        assert!(args.iter().any(|a| a == "--disable-blink-features=AutomationControlled"));
        assert!(!args.iter().any(|a| a.starts_with("--user-data-dir")));
    }

    #[test]
    fn languages_strip_quality_values() {
        let profile = build_profile(&CATALOG[0]);
        assert_eq!(profile.languages(), vec!["pt-BR", "pt", "en"]);
        assert!(init_scripts(&profile)[2].contains("[\"pt-BR\",\"pt\",\"en\"]"));
    }
}
