//! Best-effort enrichment helpers
//!
//! Nothing in here fails: unknown user agents classify as `Unknown`,
//! unparsable URLs fall back to a trimmed form, and missing campaign
//! parameters are simply absent.

use once_cell::sync::Lazy;
use regex::Regex;
use strata_core::types::{CampaignParams, DeviceType};
use url::Url;

static BOT_UA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)bot|crawl|spider|slurp|headless|lighthouse")
        .expect("bot pattern is valid")
});

static TABLET_UA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)ipad|tablet|kindle|silk/|playbook").expect("tablet pattern is valid")
});

static ANDROID_UA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)android").expect("android pattern is valid"));

static MOBILE_UA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)mobi|iphone|ipod|blackberry|windows phone|opera mini")
        .expect("mobile pattern is valid")
});

static DESKTOP_UA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)windows nt|macintosh|mac os x|x11|linux|\bcros\b")
        .expect("desktop pattern is valid")
});

/// Browser patterns, checked in order (Chromium derivatives before Chrome, Chrome before Safari)
static BROWSERS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"Edg(e|A|iOS)?/", "Edge"),
        (r"OPR/|Opera", "Opera"),
        (r"SamsungBrowser/", "Samsung Internet"),
        (r"Firefox/|FxiOS/", "Firefox"),
        (r"Chrome/|CriOS/", "Chrome"),
        (r"Version/[\d.]+.*Safari/", "Safari"),
        (r"MSIE |Trident/", "Internet Explorer"),
    ]
    .into_iter()
    .map(|(pattern, name)| (Regex::new(pattern).expect("browser pattern is valid"), name))
    .collect()
});

/// OS patterns, checked in order (iOS and Android before their desktop cousins)
static OPERATING_SYSTEMS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)iphone|ipad|ipod", "iOS"),
        (r"(?i)android", "Android"),
        (r"(?i)windows", "Windows"),
        (r"(?i)\bcros\b", "ChromeOS"),
        (r"(?i)mac os x|macintosh", "macOS"),
        (r"(?i)linux|x11", "Linux"),
    ]
    .into_iter()
    .map(|(pattern, name)| (Regex::new(pattern).expect("os pattern is valid"), name))
    .collect()
});

/// Device, browser and OS derived from a user-agent string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub device_type: DeviceType,
    pub browser: Option<String>,
    pub os: Option<String>,
}

pub fn classify_user_agent(user_agent: &str) -> UserAgentInfo {
    let ua = user_agent.trim();
    if ua.is_empty() {
        return UserAgentInfo {
            device_type: DeviceType::Unknown,
            browser: None,
            os: None,
        };
    }

    let device_type = if BOT_UA.is_match(ua) {
        DeviceType::Bot
    } else if TABLET_UA.is_match(ua) || (ANDROID_UA.is_match(ua) && !MOBILE_UA.is_match(ua)) {
        DeviceType::Tablet
    } else if MOBILE_UA.is_match(ua) || ANDROID_UA.is_match(ua) {
        DeviceType::Mobile
    } else if DESKTOP_UA.is_match(ua) {
        DeviceType::Desktop
    } else {
        DeviceType::Unknown
    };

    let browser = BROWSERS
        .iter()
        .find(|(re, _)| re.is_match(ua))
        .map(|(_, name)| name.to_string());

    let os = OPERATING_SYSTEMS
        .iter()
        .find(|(re, _)| re.is_match(ua))
        .map(|(_, name)| name.to_string());

    UserAgentInfo {
        device_type,
        browser,
        os,
    }
}

/// Canonical page identity derived from a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    /// Natural key of the page entity
    pub normalized: String,
    pub host: Option<String>,
    pub path: String,
}

/// Normalize a page URL: lowercase scheme and host, drop the default port,
/// query and fragment, strip a trailing slash except on the root path.
///
/// Returns `None` for blank input.
pub fn normalize_url(raw: &str) -> Option<NormalizedUrl> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    match Url::parse(raw) {
        Ok(url) if url.has_host() => {
            let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
            let path = trim_trailing_slash(url.path());
            let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
            Some(NormalizedUrl {
                normalized: format!("{}://{}{}{}", url.scheme(), host, port, path),
                host: Some(host),
                path,
            })
        }
        // Relative or opaque URLs: keep the path part as-is
        _ => {
            let path = raw.split(['?', '#']).next().unwrap_or(raw);
            let path = trim_trailing_slash(path);
            Some(NormalizedUrl {
                normalized: path.clone(),
                host: None,
                path,
            })
        }
    }
}

fn trim_trailing_slash(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Read `utm_*` campaign parameters from a URL query string
pub fn extract_campaign(raw: &str) -> CampaignParams {
    let mut params = CampaignParams::default();

    let url = match Url::parse(raw.trim()) {
        Ok(url) => url,
        // Relative URLs still carry a query string worth reading
        Err(_) => match Url::parse("http://relative.invalid/").and_then(|base| base.join(raw)) {
            Ok(url) => url,
            Err(_) => return params,
        },
    };

    for (key, value) in url.query_pairs() {
        if value.trim().is_empty() {
            continue;
        }
        let slot = match key.as_ref() {
            "utm_source" => &mut params.source,
            "utm_medium" => &mut params.medium,
            "utm_campaign" => &mut params.campaign,
            "utm_term" => &mut params.term,
            "utm_content" => &mut params.content,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value.into_owned());
        }
    }

    params
}
