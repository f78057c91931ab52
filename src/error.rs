/// Unified error types for the SaaS backend
///
/// Every failure is an [`AppError`] carrying an HTTP status, a stable error
/// type identifier, a severity and an optional redirect intent. Handlers only
/// return errors; the error middleware decides between a JSON body and a
/// browser redirect, and how loudly to log.
use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use thiserror::Error;

/// How serious an error is; drives logging and exception reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }

    /// Whether errors of this severity go to the exception tracker
    pub fn is_reported(&self) -> bool {
        *self >= Severity::Warn
    }

    fn sentry_level(&self) -> sentry::Level {
        match self {
            Severity::Info => sentry::Level::Info,
            Severity::Warn => sentry::Level::Warning,
            Severity::Error => sentry::Level::Error,
            Severity::Fatal => sentry::Level::Fatal,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable, client-facing error identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Unauthorized,
    NoSession,
    SessionExpired,
    Forbidden,
    InvalidRequest,
    InvitationNotFound,
    TokenNotFound,
    InvalidToken,
    ExpiredToken,
    UserMismatch,
    NotFound,
    InvalidState,
    OauthFailed,
    OauthConflict,
    UnverifiedEmail,
    TooManyRequests,
    InvalidReference,
    Conflict,
    MissingField,
    ConstraintViolation,
    AccessDenied,
    RetryConflict,
    ServerError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Unauthorized => "unauthorized",
            ErrorType::NoSession => "no_session",
            ErrorType::SessionExpired => "session_expired",
            ErrorType::Forbidden => "forbidden",
            ErrorType::InvalidRequest => "invalid_request",
            ErrorType::InvitationNotFound => "invitation_not_found",
            ErrorType::TokenNotFound => "token_not_found",
            ErrorType::InvalidToken => "invalid_token",
            ErrorType::ExpiredToken => "expired_token",
            ErrorType::UserMismatch => "user_mismatch",
            ErrorType::NotFound => "not_found",
            ErrorType::InvalidState => "invalid_state",
            ErrorType::OauthFailed => "oauth_failed",
            ErrorType::OauthConflict => "oauth_conflict",
            ErrorType::UnverifiedEmail => "unverified_email",
            ErrorType::TooManyRequests => "too_many_requests",
            ErrorType::InvalidReference => "invalid_reference",
            ErrorType::Conflict => "conflict",
            ErrorType::MissingField => "missing_field",
            ErrorType::ConstraintViolation => "constraint_violation",
            ErrorType::AccessDenied => "access_denied",
            ErrorType::RetryConflict => "retry_conflict",
            ErrorType::ServerError => "server_error",
        }
    }

    /// Message used when the error is raised without a specific one
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorType::Unauthorized => "Authentication required",
            ErrorType::NoSession => "Session not found",
            ErrorType::SessionExpired => "Session has expired",
            ErrorType::Forbidden => "Forbidden",
            ErrorType::InvalidRequest => "Invalid request",
            ErrorType::InvitationNotFound => "Invitation not found",
            ErrorType::TokenNotFound => "Token not found",
            ErrorType::InvalidToken => "Token is invalid",
            ErrorType::ExpiredToken => "Token has expired",
            ErrorType::UserMismatch => "User does not match",
            ErrorType::NotFound => "Resource not found",
            ErrorType::InvalidState => "OAuth state is missing or invalid",
            ErrorType::OauthFailed => "OAuth sign-in failed",
            ErrorType::OauthConflict => "Provider account is linked to another user",
            ErrorType::UnverifiedEmail => "Email address is not verified by the provider",
            ErrorType::TooManyRequests => "Too many requests",
            ErrorType::InvalidReference => "Referenced record does not exist",
            ErrorType::Conflict => "Record already exists",
            ErrorType::MissingField => "A required field is missing",
            ErrorType::ConstraintViolation => "Value violates a constraint",
            ErrorType::AccessDenied => "Access denied",
            ErrorType::RetryConflict => "Concurrent update conflict, please retry",
            ErrorType::ServerError => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of database failures the API knows how to explain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseErrorKind {
    ForeignKeyViolation,
    UniqueViolation,
    NotNullViolation,
    CheckViolation,
    RlsDenied,
    SerializationFailure,
    Deadlock,
}

impl DatabaseErrorKind {
    /// Map a Postgres SQLSTATE or SQLite extended result code
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "23503" | "787" => Some(DatabaseErrorKind::ForeignKeyViolation),
            "23505" | "2067" | "1555" => Some(DatabaseErrorKind::UniqueViolation),
            "23502" | "1299" => Some(DatabaseErrorKind::NotNullViolation),
            "23514" | "275" => Some(DatabaseErrorKind::CheckViolation),
            "42501" => Some(DatabaseErrorKind::RlsDenied),
            "40001" | "5" => Some(DatabaseErrorKind::SerializationFailure),
            "40P01" | "6" => Some(DatabaseErrorKind::Deadlock),
            _ => None,
        }
    }

    fn from_sqlx_kind(kind: sqlx::error::ErrorKind) -> Option<Self> {
        use sqlx::error::ErrorKind;
        match kind {
            ErrorKind::ForeignKeyViolation => Some(DatabaseErrorKind::ForeignKeyViolation),
            ErrorKind::UniqueViolation => Some(DatabaseErrorKind::UniqueViolation),
            ErrorKind::NotNullViolation => Some(DatabaseErrorKind::NotNullViolation),
            ErrorKind::CheckViolation => Some(DatabaseErrorKind::CheckViolation),
            _ => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DatabaseErrorKind::ForeignKeyViolation
            | DatabaseErrorKind::NotNullViolation
            | DatabaseErrorKind::CheckViolation => StatusCode::BAD_REQUEST,
            DatabaseErrorKind::UniqueViolation
            | DatabaseErrorKind::SerializationFailure
            | DatabaseErrorKind::Deadlock => StatusCode::CONFLICT,
            DatabaseErrorKind::RlsDenied => StatusCode::FORBIDDEN,
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            DatabaseErrorKind::ForeignKeyViolation => ErrorType::InvalidReference,
            DatabaseErrorKind::UniqueViolation => ErrorType::Conflict,
            DatabaseErrorKind::NotNullViolation => ErrorType::MissingField,
            DatabaseErrorKind::CheckViolation => ErrorType::ConstraintViolation,
            DatabaseErrorKind::RlsDenied => ErrorType::AccessDenied,
            DatabaseErrorKind::SerializationFailure | DatabaseErrorKind::Deadlock => {
                ErrorType::RetryConflict
            }
        }
    }
}

/// A classified driver error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
    pub code: String,
    pub detail: Option<String>,
    pub constraint: Option<String>,
}

impl DatabaseError {
    /// Classify a sqlx error; `None` when it is not a known constraint failure
    pub fn classify(err: &sqlx::Error) -> Option<Self> {
        let db = err.as_database_error()?;
        let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
        let kind = DatabaseErrorKind::from_code(&code)
            .or_else(|| DatabaseErrorKind::from_sqlx_kind(db.kind()))?;

        let detail = db
            .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
            .and_then(|pg| pg.detail())
            .map(str::to_string);

        Some(DatabaseError {
            kind,
            code,
            detail,
            constraint: db.constraint().map(str::to_string),
        })
    }
}

/// Main error type for the backend
#[derive(Error, Debug)]
#[error("{message}")]
pub struct AppError {
    pub status: StatusCode,
    pub kind: ErrorType,
    pub severity: Severity,
    pub message: String,
    pub entity_type: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub is_redirect: bool,
    pub redirect_path: Option<String>,
    pub database: Option<DatabaseError>,
    backtrace: Option<Backtrace>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl AppError {
    pub fn new(status: StatusCode, kind: ErrorType, severity: Severity) -> Self {
        let backtrace = (severity >= Severity::Error).then(Backtrace::capture);
        AppError {
            status,
            kind,
            severity,
            message: kind.default_message().to_string(),
            entity_type: None,
            meta: None,
            is_redirect: false,
            redirect_path: None,
            database: None,
            backtrace,
            source: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Render as a browser redirect to the frontend error page
    pub fn redirect(mut self) -> Self {
        self.is_redirect = true;
        self
    }

    /// Render as a browser redirect to a specific frontend path
    pub fn redirect_to(mut self, path: impl Into<String>) -> Self {
        self.is_redirect = true;
        self.redirect_path = Some(path.into());
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorType::Unauthorized, Severity::Warn)
    }

    pub fn no_session() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorType::NoSession, Severity::Warn)
    }

    pub fn session_expired() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorType::SessionExpired, Severity::Warn)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorType::Forbidden, Severity::Warn)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorType::InvalidRequest, Severity::Warn)
            .with_message(message)
    }

    pub fn not_found(entity_type: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorType::NotFound, Severity::Warn)
            .with_entity(entity_type)
    }

    pub fn invitation_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorType::InvitationNotFound, Severity::Warn)
    }

    pub fn token_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorType::TokenNotFound, Severity::Warn)
    }

    pub fn invalid_token() -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorType::InvalidToken, Severity::Warn)
    }

    pub fn expired_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorType::ExpiredToken, Severity::Warn)
    }

    pub fn user_mismatch() -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorType::UserMismatch, Severity::Warn)
    }

    pub fn invalid_state() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorType::InvalidState, Severity::Warn)
    }

    pub fn oauth_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, ErrorType::OauthFailed, Severity::Error)
            .with_message(message)
    }

    pub fn oauth_conflict() -> Self {
        Self::new(StatusCode::CONFLICT, ErrorType::OauthConflict, Severity::Warn)
    }

    pub fn unverified_email() -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorType::UnverifiedEmail, Severity::Warn)
    }

    pub fn too_many_requests() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorType::TooManyRequests,
            Severity::Warn,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::ServerError,
            Severity::Error,
        )
        .with_message(message)
    }

    /// Unusable configuration, raised at startup only
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::ServerError,
            Severity::Fatal,
        )
        .with_message(message)
    }

    /// Cloneable snapshot that travels to the error middleware
    pub fn report(&self) -> ErrorReport {
        let stack = self
            .backtrace
            .as_ref()
            .filter(|bt| bt.status() == BacktraceStatus::Captured)
            .map(|bt| bt.to_string());

        ErrorReport {
            status: self.status,
            kind: self.kind,
            severity: self.severity,
            message: self.message.clone(),
            entity_type: self.entity_type.clone(),
            meta: self.meta.clone(),
            is_redirect: self.is_redirect,
            redirect_path: self.redirect_path.clone(),
            database: self.database.clone(),
            stack,
            cause: self.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<DatabaseError> for AppError {
    fn from(db: DatabaseError) -> Self {
        let mut err = AppError::new(db.kind.status(), db.kind.error_type(), Severity::Warn);
        err.database = Some(db);
        err
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db) = DatabaseError::classify(&err) {
            return AppError::from(db).with_source(err);
        }

        match err {
            sqlx::Error::RowNotFound => AppError::new(
                StatusCode::NOT_FOUND,
                ErrorType::NotFound,
                Severity::Warn,
            ),
            other => AppError::internal("Database error").with_source(other),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::config(format!("Migration failed: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::internal(format!("IO error: {}", err))
    }
}

/// Result type alias for backend operations
pub type AppResult<T> = Result<T, AppError>;

/// Error details attached to a response for the error middleware
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub status: StatusCode,
    pub kind: ErrorType,
    pub severity: Severity,
    pub message: String,
    pub entity_type: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub is_redirect: bool,
    pub redirect_path: Option<String>,
    pub database: Option<DatabaseError>,
    pub stack: Option<String>,
    pub cause: Option<String>,
}

impl ErrorReport {
    /// Report for a handler panic caught by the panic layer
    pub fn panic(message: impl Into<String>) -> Self {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::ServerError,
            Severity::Fatal,
        )
        .with_message(message)
        .report()
    }

    fn name(&self) -> &'static str {
        if self.database.is_some() {
            "DatabaseError"
        } else {
            "AppError"
        }
    }
}

/// The request-side facts included in error bodies and logs
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
}

/// JSON error body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: String,
    pub name: &'static str,
    pub status: u16,
    #[serde(rename = "type")]
    pub kind: ErrorType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    pub log_id: String,
    pub path: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pg_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pg_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pg_constraint: Option<String>,
}

impl ErrorBody {
    pub fn new(report: &ErrorReport, request: &RequestInfo, include_stack: bool) -> Self {
        let database = report.database.as_ref();
        ErrorBody {
            message: report.message.clone(),
            name: report.name(),
            status: report.status.as_u16(),
            kind: report.kind,
            severity: report.severity,
            entity_type: report.entity_type.clone(),
            log_id: crate::crypto::generate_id(),
            path: request.path.clone(),
            method: request.method.clone(),
            user_id: request.user_id.clone(),
            organization_id: request.organization_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            meta: report.meta.clone(),
            stack: if include_stack {
                report.stack.clone().or_else(|| report.cause.clone())
            } else {
                None
            },
            pg_code: database.map(|db| db.code.clone()),
            pg_detail: database.and_then(|db| db.detail.clone()),
            pg_constraint: database.and_then(|db| db.constraint.clone()),
        }
    }
}

/// Convert AppError to a provisional HTTP response.
///
/// The body is replaced by [`render_error`] when the error middleware runs;
/// the report rides along in the response extensions.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let report = self.report();
        let body = ErrorBody::new(&report, &RequestInfo::default(), false);
        let mut response = (report.status, Json(body)).into_response();
        response.extensions_mut().insert(report);
        response
    }
}

/// Log, report and turn an error into its final response.
///
/// `headers` are the headers of the provisional response; cookies set or
/// removed before the error was raised are kept.
pub fn render_error(
    report: &ErrorReport,
    request: &RequestInfo,
    frontend_url: &str,
    development: bool,
    headers: &HeaderMap,
) -> Response {
    log_error(report, request);

    let mut response = if report.is_redirect {
        let location = error_redirect_location(report, frontend_url);
        match HeaderValue::from_str(&location) {
            Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
            Err(_) => StatusCode::FOUND.into_response(),
        }
    } else {
        let body = ErrorBody::new(report, request, development);
        (report.status, Json(body)).into_response()
    };

    for cookie in headers.get_all(header::SET_COOKIE) {
        response
            .headers_mut()
            .append(header::SET_COOKIE, cookie.clone());
    }

    response
}

/// `<frontend><path or /error>?error=<type>&severity=<severity>`
pub fn error_redirect_location(report: &ErrorReport, frontend_url: &str) -> String {
    let path = report.redirect_path.as_deref().unwrap_or("/error");
    let separator = if path.contains('?') { '&' } else { '?' };
    format!(
        "{}{}{}error={}&severity={}",
        frontend_url.trim_end_matches('/'),
        path,
        separator,
        report.kind,
        report.severity
    )
}

fn log_error(report: &ErrorReport, request: &RequestInfo) {
    if !report.severity.is_reported() {
        tracing::info!("{}", report.message);
        return;
    }

    sentry::capture_message(
        &format!("{}: {}", report.kind, report.message),
        report.severity.sentry_level(),
    );

    match report.severity {
        Severity::Warn => tracing::warn!(
            error_type = %report.kind,
            status = report.status.as_u16(),
            method = %request.method,
            path = %request.path,
            user_id = request.user_id.as_deref(),
            organization_id = request.organization_id.as_deref(),
            db_code = report.database.as_ref().map(|db| db.code.as_str()),
            "{}",
            report.message
        ),
        _ => tracing::error!(
            error_type = %report.kind,
            status = report.status.as_u16(),
            severity = %report.severity,
            method = %request.method,
            path = %request.path,
            user_id = request.user_id.as_deref(),
            organization_id = request.organization_id.as_deref(),
            cause = report.cause.as_deref(),
            stack = report.stack.as_deref(),
            "{}",
            report.message
        ),
    }
}
