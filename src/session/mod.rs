/// Cookie sessions: issuance, validation, cookie parsing and device fingerprinting
pub mod cookie;
pub mod device;
pub mod manager;

pub use cookie::{
    get_parsed_session_cookie, removal_cookie, ParsedSessionCookie, SessionCookieOptions,
    SESSION_COOKIE,
};
pub use device::{device_info, DeviceInfo};
pub use manager::{IssuedSession, SessionManager, SessionRequest};
