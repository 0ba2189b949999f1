//! Unified client library over heterogeneous cloud-storage back-ends.
//!
//! The three load-bearing pieces are the request engine ([`request`]), the
//! provider capability with its HTTP-driven defaults ([`provider`]), and
//! the authentication state machine ([`auth`]). Consumers go through
//! [`client::CloudClient`], which turns provider operations into
//! cancellable, pausable [`request::Request`] handles.

pub mod auth;
pub mod client;
pub mod error;
pub mod http;
pub mod provider;
pub mod request;

pub use auth::{AuthContext, ConsentUi, Hints, Token};
pub use client::CloudClient;
pub use error::{Error, ErrorKind, Result};
pub use provider::{
    CloudProvider, FileType, GeneralData, Item, LibraryContext, Page, Range, FULL_RANGE,
};
pub use request::{AbstractRequest, ProgressListener, Request, RequestContext, Status};
