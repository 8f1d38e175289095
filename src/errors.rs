//! HTTP error taxonomy.
//!
//! Every error that can cross the request pipeline boundary is one of a
//! closed set of kinds, each bound to a status code. Handlers, middleware
//! and the loader all raise `TitanError`; the pipeline lifts anything else
//! (panics, FFI failures) into `TitanError::internal` exactly once, at the
//! boundary — see `pipeline.rs`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// The closed set of error kinds a response can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    PaymentRequired,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    RequestTimeout,
    Conflict,
    Gone,
    LengthRequired,
    PreconditionFailed,
    PayloadTooLarge,
    UriTooLong,
    UnsupportedMediaType,
    RangeNotSatisfiable,
    ExpectationFailed,
    ImATeapot,
    MisdirectedRequest,
    UnprocessableEntity,
    Locked,
    FailedDependency,
    TooEarly,
    UpgradeRequired,
    PreconditionRequired,
    TooManyRequests,
    RequestHeaderFieldsTooLarge,
    UnavailableForLegalReasons,
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    HttpVersionNotSupported,
    VariantAlsoNegotiates,
    InsufficientStorage,
    LoopDetected,
    NotExtended,
    NetworkAuthenticationRequired,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        use ErrorKind::*;
        match self {
            BadRequest => StatusCode::BAD_REQUEST,
            Unauthorized => StatusCode::UNAUTHORIZED,
            PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            Forbidden => StatusCode::FORBIDDEN,
            NotFound => StatusCode::NOT_FOUND,
            MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Conflict => StatusCode::CONFLICT,
            Gone => StatusCode::GONE,
            LengthRequired => StatusCode::LENGTH_REQUIRED,
            PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            UriTooLong => StatusCode::URI_TOO_LONG,
            UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ExpectationFailed => StatusCode::EXPECTATION_FAILED,
            ImATeapot => StatusCode::IM_A_TEAPOT,
            MisdirectedRequest => StatusCode::MISDIRECTED_REQUEST,
            UnprocessableEntity => StatusCode::UNPROCESSABLE_ENTITY,
            Locked => StatusCode::LOCKED,
            FailedDependency => StatusCode::FAILED_DEPENDENCY,
            TooEarly => StatusCode::TOO_EARLY,
            UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            PreconditionRequired => StatusCode::PRECONDITION_REQUIRED,
            TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            RequestHeaderFieldsTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            UnavailableForLegalReasons => StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
            InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            NotImplemented => StatusCode::NOT_IMPLEMENTED,
            BadGateway => StatusCode::BAD_GATEWAY,
            ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            HttpVersionNotSupported => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            VariantAlsoNegotiates => StatusCode::VARIANT_ALSO_NEGOTIATES,
            InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
            LoopDetected => StatusCode::LOOP_DETECTED,
            NotExtended => StatusCode::NOT_EXTENDED,
            NetworkAuthenticationRequired => StatusCode::NETWORK_AUTHENTICATION_REQUIRED,
        }
    }

    pub fn name(self) -> &'static str {
        use ErrorKind::*;
        match self {
            BadRequest => "BadRequest",
            Unauthorized => "Unauthorized",
            PaymentRequired => "PaymentRequired",
            Forbidden => "Forbidden",
            NotFound => "NotFound",
            MethodNotAllowed => "MethodNotAllowed",
            NotAcceptable => "NotAcceptable",
            RequestTimeout => "RequestTimeout",
            Conflict => "Conflict",
            Gone => "Gone",
            LengthRequired => "LengthRequired",
            PreconditionFailed => "PreconditionFailed",
            PayloadTooLarge => "PayloadTooLarge",
            UriTooLong => "UriTooLong",
            UnsupportedMediaType => "UnsupportedMediaType",
            RangeNotSatisfiable => "RangeNotSatisfiable",
            ExpectationFailed => "ExpectationFailed",
            ImATeapot => "ImATeapot",
            MisdirectedRequest => "MisdirectedRequest",
            UnprocessableEntity => "UnprocessableEntity",
            Locked => "Locked",
            FailedDependency => "FailedDependency",
            TooEarly => "TooEarly",
            UpgradeRequired => "UpgradeRequired",
            PreconditionRequired => "PreconditionRequired",
            TooManyRequests => "TooManyRequests",
            RequestHeaderFieldsTooLarge => "RequestHeaderFieldsTooLarge",
            UnavailableForLegalReasons => "UnavailableForLegalReasons",
            InternalServerError => "InternalServerError",
            NotImplemented => "NotImplemented",
            BadGateway => "BadGateway",
            ServiceUnavailable => "ServiceUnavailable",
            GatewayTimeout => "GatewayTimeout",
            HttpVersionNotSupported => "HttpVersionNotSupported",
            VariantAlsoNegotiates => "VariantAlsoNegotiates",
            InsufficientStorage => "InsufficientStorage",
            LoopDetected => "LoopDetected",
            NotExtended => "NotExtended",
            NetworkAuthenticationRequired => "NetworkAuthenticationRequired",
        }
    }
}

/// A raised HTTP error: a kind plus a message and optional structured data.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TitanError {
    pub kind: ErrorKind,
    pub message: String,
    pub data: Option<Value>,
    pub request_id: Option<String>,
}

impl TitanError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        TitanError { kind, message: message.into(), data: None, request_id: None }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    /// `isClientError` ⇔ status ∈ [400, 500)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status().as_u16())
    }

    /// `isServerError` ⇔ status ∈ [500, 600)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status().as_u16())
    }

    /// `isRetryable` ⇔ server error, or one of the explicitly retryable
    /// client statuses (request timeout, too many requests, gateway timeout).
    pub fn is_retryable(&self) -> bool {
        self.is_server_error() || matches!(self.status().as_u16(), 408 | 429 | 504)
    }

    /// Lift an arbitrary error/panic payload into the taxonomy as a 500,
    /// stashing the original message under `data.originalError`.
    pub fn lift(original: impl std::fmt::Display) -> Self {
        TitanError::new(ErrorKind::InternalServerError, "internal server error")
            .with_data(serde_json::json!({ "originalError": original.to_string() }))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalServerError, message)
    }

    /// Build the fixed envelope: `{ error: { name, status, message,
    /// timestamp, data?, requestId?, stack? } }`. `include_stack` should be
    /// true only when running in development.
    pub fn envelope(&self, include_stack: bool) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                name: self.kind.name(),
                status: self.status().as_u16(),
                message: self.message.clone(),
                timestamp: chrono::Utc::now(),
                data: self.data.clone(),
                request_id: self.request_id.clone(),
                stack: if include_stack { Some(format!("{:?}", self)) } else { None },
            },
        }
    }

    pub fn to_response(&self, include_stack: bool) -> Response {
        (self.status(), Json(self.envelope(include_stack))).into_response()
    }
}

impl IntoResponse for TitanError {
    fn into_response(self) -> Response {
        self.to_response(false)
    }
}

#[derive(Serialize)]
pub struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    name: &'static str,
    status: u16,
    message: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
}

/// Errors raised while building the route table (C3).
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to scan routes directory: {0}")]
    Scan(String),
    #[error("duplicate route: {method} {path}")]
    DuplicateRoute { method: String, path: String },
    #[error("ambiguous catch-all segment in {0}")]
    AmbiguousCatchAll(String),
    #[error("failed to compile module {path}: {source}")]
    Compile { path: String, source: anyhow::Error },
    #[error("failed to write manifest: {0}")]
    Manifest(#[from] std::io::Error),
}

/// Errors raised while loading a compiled route module (C5).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("module not found at {0}")]
    NotFound(String),
    #[error("failed to open dynamic library {path}: {source}")]
    Open { path: String, source: libloading::Error },
    #[error("module {0} is missing the required handler export")]
    MissingHandler(String),
    #[error("module {0} exports a handler with an incompatible signature")]
    IncompatibleSignature(String),
    #[error("module manifest at {0} is invalid: {1}")]
    InvalidManifest(String, String),
}

impl From<LoadError> for TitanError {
    fn from(e: LoadError) -> Self {
        TitanError::internal(e.to_string())
    }
}

/// Errors raised while loading or validating configuration (C8).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: anyhow::Error },
    #[error("config validation failed: {0}")]
    Invalid(String),
}
