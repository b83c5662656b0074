//! Error taxonomy for control-plane operations and listener/dial failures.
//!
//! Callers match on [`Error::kind`] rather than on payload-carrying variants,
//! so every failure stays comparable by value.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("proxy not found")]
    ProxyNotFound,
    #[error("proxy already exists")]
    ProxyAlreadyExists,
    #[error("proxy already started")]
    ProxyAlreadyStarted,
    #[error("toxic not found")]
    ToxicNotFound,
    #[error("toxic already exists")]
    ToxicAlreadyExists,
    #[error("invalid toxic type: {0}")]
    InvalidToxicType(String),
    #[error("stream was invalid, can be either upstream or downstream")]
    InvalidStream,
    #[error("bad request body: {0}")]
    BadRequestBody(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to dial upstream {addr}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProxyNotFound,
    ProxyAlreadyExists,
    ProxyAlreadyStarted,
    ToxicNotFound,
    ToxicAlreadyExists,
    InvalidToxicType,
    InvalidStream,
    BadRequestBody,
    MissingField,
    Bind,
    Dial,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ProxyNotFound => ErrorKind::ProxyNotFound,
            Error::ProxyAlreadyExists => ErrorKind::ProxyAlreadyExists,
            Error::ProxyAlreadyStarted => ErrorKind::ProxyAlreadyStarted,
            Error::ToxicNotFound => ErrorKind::ToxicNotFound,
            Error::ToxicAlreadyExists => ErrorKind::ToxicAlreadyExists,
            Error::InvalidToxicType(_) => ErrorKind::InvalidToxicType,
            Error::InvalidStream => ErrorKind::InvalidStream,
            Error::BadRequestBody(_) => ErrorKind::BadRequestBody,
            Error::MissingField(_) => ErrorKind::MissingField,
            Error::Bind { .. } => ErrorKind::Bind,
            Error::Dial { .. } => ErrorKind::Dial,
        }
    }

    /// Status code used by the admin API when serializing this error.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::ProxyNotFound | ErrorKind::ToxicNotFound => 404,
            ErrorKind::ProxyAlreadyExists | ErrorKind::ToxicAlreadyExists | ErrorKind::ProxyAlreadyStarted => 409,
            ErrorKind::InvalidToxicType
            | ErrorKind::InvalidStream
            | ErrorKind::BadRequestBody
            | ErrorKind::MissingField => 400,
            ErrorKind::Bind | ErrorKind::Dial => 500,
        }
    }
}
