/// Device fingerprint derived from the User-Agent header
use crate::db::models::DeviceType;
use axum::http::{header, HeaderMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub device_type: DeviceType,
    pub os: Option<String>,
    pub browser: Option<String>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            name: None,
            device_type: DeviceType::Desktop,
            os: None,
            browser: None,
        }
    }
}

pub fn device_info(headers: &HeaderMap) -> DeviceInfo {
    let ua = match headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
        Some(ua) if !ua.is_empty() => ua,
        _ => return DeviceInfo::default(),
    };

    let os = detect_os(ua);
    let browser = detect_browser(ua);
    let device_type = if ua.contains("Mobile")
        || ua.contains("Android")
        || ua.contains("iPhone")
        || ua.contains("iPad")
    {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    };

    let name = match (browser, os) {
        (Some(b), Some(o)) => Some(format!("{} on {}", b, o)),
        (Some(b), None) => Some(b.to_string()),
        (None, Some(o)) => Some(o.to_string()),
        (None, None) => None,
    };

    DeviceInfo {
        name,
        device_type,
        os: os.map(str::to_string),
        browser: browser.map(str::to_string),
    }
}

// Order matters: Android UAs mention Linux, iOS UAs mention Mac OS X
fn detect_os(ua: &str) -> Option<&'static str> {
    if ua.contains("Windows") {
        Some("Windows")
    } else if ua.contains("Android") {
        Some("Android")
    } else if ua.contains("iPhone") || ua.contains("iPad") {
        Some("iOS")
    } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        Some("macOS")
    } else if ua.contains("Linux") {
        Some("Linux")
    } else {
        None
    }
}

// Edge and Opera UAs also carry "Chrome", Chrome UAs carry "Safari"
fn detect_browser(ua: &str) -> Option<&'static str> {
    if ua.contains("Edg/") {
        Some("Edge")
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        Some("Opera")
    } else if ua.contains("Firefox/") {
        Some("Firefox")
    } else if ua.contains("Chrome/") || ua.contains("CriOS/") {
        Some("Chrome")
    } else if ua.contains("Safari/") {
        Some("Safari")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(ua: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(ua));
        headers
    }

    #[test]
    fn test_desktop_chrome() {
        let info = device_info(&headers(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
        ));
        assert_eq!(info.device_type, DeviceType::Desktop);
        assert_eq!(info.os.as_deref(), Some("Windows"));
        assert_eq!(info.browser.as_deref(), Some("Chrome"));
        assert_eq!(info.name.as_deref(), Some("Chrome on Windows"));
    }

    #[test]
    fn test_mobile_safari() {
        let info = device_info(&headers(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
        ));
        assert_eq!(info.device_type, DeviceType::Mobile);
        assert_eq!(info.os.as_deref(), Some("iOS"));
        assert_eq!(info.browser.as_deref(), Some("Safari"));
    }

    #[test]
    fn test_missing_user_agent() {
        assert_eq!(device_info(&HeaderMap::new()), DeviceInfo::default());
    }
}
