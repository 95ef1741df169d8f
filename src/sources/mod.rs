//! Remote document sources.
//!
//! A source implements [`RemoteSource`](crate::ports::RemoteSource) for one
//! remote system holding many spaces. The only production source is the
//! blocking JSON client in [`http`].

pub mod http;

pub use http::HttpRemoteSource;
