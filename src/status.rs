//! The status model shared by every interceptor: a small mirror of the
//! gRPC code space plus the HTTP mapping the REST adapter uses.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    ResourceExhausted,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl Code {
    /// The numeric wire value, matching gRPC.
    pub fn value(self) -> u32 {
        match self {
            Code::Ok => 0,
            Code::Canceled => 1,
            Code::Unknown => 2,
            Code::InvalidArgument => 3,
            Code::DeadlineExceeded => 4,
            Code::NotFound => 5,
            Code::ResourceExhausted => 8,
            Code::Internal => 13,
            Code::Unavailable => 14,
            Code::Unauthenticated => 16,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An RPC failure: a code plus a human-readable message. Causes are folded
/// into the message by the layer that converts them, so the chain never
/// replaces a failure with a blank one.
#[derive(Clone, Debug, thiserror::Error)]
#[error("status: {code}, message: {message}")]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(Code::Canceled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this failure still counts as a successful call for breaker
    /// and balancer accounting. Infrastructure-level failures do not;
    /// business-level ones (bad argument, not found, ...) do.
    pub fn acceptable(&self) -> bool {
        !matches!(
            self.code,
            Code::DeadlineExceeded | Code::Internal | Code::Unavailable
        )
    }

    /// The HTTP status the REST adapter answers with.
    pub fn http_status(&self) -> u16 {
        match self.code {
            Code::Ok => 200,
            // nginx's non-standard "client closed request"
            Code::Canceled => 499,
            Code::InvalidArgument => 400,
            Code::NotFound => 404,
            Code::Unauthenticated => 401,
            Code::DeadlineExceeded | Code::Unavailable | Code::ResourceExhausted => 503,
            Code::Unknown | Code::Internal => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_maps_to_503() {
        assert_eq!(Status::resource_exhausted("shed").http_status(), 503);
        assert_eq!(Status::unavailable("breaker").http_status(), 503);
        assert_eq!(Status::deadline_exceeded("timeout").http_status(), 503);
    }

    #[test]
    fn client_closed_maps_to_499() {
        assert_eq!(Status::canceled("gone").http_status(), 499);
    }

    #[test]
    fn infrastructure_failures_are_not_acceptable() {
        assert!(!Status::deadline_exceeded("t").acceptable());
        assert!(!Status::internal("i").acceptable());
        assert!(!Status::unavailable("u").acceptable());
        assert!(Status::invalid_argument("bad").acceptable());
        assert!(Status::new(Code::NotFound, "nope").acceptable());
    }

    #[test]
    fn wire_values_match_grpc() {
        assert_eq!(Code::Ok.value(), 0);
        assert_eq!(Code::DeadlineExceeded.value(), 4);
        assert_eq!(Code::ResourceExhausted.value(), 8);
        assert_eq!(Code::Unavailable.value(), 14);
        assert_eq!(Code::Unauthenticated.value(), 16);
    }
}
