//! Endpoint address parsing for the relay.
//!
//! This library turns the textual addresses accepted on the command line
//! into resolved [`SocketAddr`] endpoints. Accepted forms:
//!
//! - `host:port`: IPv4 literal plus port (`1.2.3.4:80`)
//! - `[host]:port`: bracketed IPv6 literal plus port (`[::1]:80`)
//! - `port`: bare port, implies the IPv4 wildcard (`80` is `0.0.0.0:80`)
//! - `host`: bare IPv4 literal, implies port 0 (`1.2.3.4` is `1.2.3.4:0`)
//!
//! Only IP literals are accepted; hostname resolution is not performed.
//! Formatting for logs is plain [`std::fmt::Display`] on `SocketAddr`,
//! which already brackets IPv6 addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// Errors produced while parsing a textual endpoint address.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseAddrError {
    /// A host was given without a port where one is required.
    #[error("missing port")]
    MissingPort,

    /// More than one colon outside brackets, or a colon after the port.
    #[error("too many colons")]
    TooManyColons,

    /// A closing bracket appeared without a leading `[`.
    #[error("missing open bracket")]
    MissingOpenBracket,

    /// An opening bracket was never closed.
    #[error("missing close bracket")]
    MissingCloseBracket,

    /// An opening bracket appeared somewhere other than position 0.
    #[error("unexpected open bracket")]
    UnexpectedOpenBracket,

    /// A stray closing bracket after the bracketed host.
    #[error("unexpected close bracket")]
    UnexpectedCloseBracket,

    /// The port is non-numeric or outside 0..=65535.
    #[error("invalid port '{0}'")]
    InvalidPort(String),

    /// The host is not a valid IP literal.
    #[error("invalid host '{0}'")]
    InvalidHost(String),
}

/// Parse a textual `host:port` endpoint into a resolved [`SocketAddr`].
///
/// See the crate docs for the accepted forms. A bracketed host is the
/// substring strictly between `[` and `]`; the `]` must be immediately
/// followed by `:` and the port must contain no further colon. The
/// unbracketed form may contain at most one colon.
pub fn parse_host_port(text: &str) -> Result<SocketAddr, ParseAddrError> {
    if let Some(rest) = text.strip_prefix('[') {
        return parse_bracketed(rest);
    }

    if text.contains(']') {
        return Err(ParseAddrError::MissingOpenBracket);
    }
    if text.contains('[') {
        return Err(ParseAddrError::UnexpectedOpenBracket);
    }

    match text.bytes().filter(|&b| b == b':').count() {
        0 => parse_bare(text),
        1 => {
            let (host, port) = text.split_once(':').expect("exactly one colon");
            if port.is_empty() {
                return Err(ParseAddrError::MissingPort);
            }
            let port = parse_port(port)?;
            let host: Ipv4Addr = host
                .parse()
                .map_err(|_| ParseAddrError::InvalidHost(host.to_string()))?;
            Ok(SocketAddr::new(IpAddr::V4(host), port))
        }
        _ => Err(ParseAddrError::TooManyColons),
    }
}

/// `rest` is everything after the leading `[`.
fn parse_bracketed(rest: &str) -> Result<SocketAddr, ParseAddrError> {
    let close = rest
        .find(']')
        .ok_or(ParseAddrError::MissingCloseBracket)?;
    let host = &rest[..close];
    if host.contains('[') {
        return Err(ParseAddrError::UnexpectedOpenBracket);
    }

    let after = &rest[close + 1..];
    if after.contains(']') {
        return Err(ParseAddrError::UnexpectedCloseBracket);
    }
    let port = after.strip_prefix(':').ok_or(ParseAddrError::MissingPort)?;
    if port.is_empty() {
        return Err(ParseAddrError::MissingPort);
    }
    if port.contains(':') {
        return Err(ParseAddrError::TooManyColons);
    }

    let port = parse_port(port)?;
    let host: Ipv6Addr = host
        .parse()
        .map_err(|_| ParseAddrError::InvalidHost(host.to_string()))?;
    Ok(SocketAddr::new(IpAddr::V6(host), port))
}

/// No colon at all: either a bare port or a bare IPv4 host.
fn parse_bare(text: &str) -> Result<SocketAddr, ParseAddrError> {
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        let port = parse_port(text)?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    let host: Ipv4Addr = text
        .parse()
        .map_err(|_| ParseAddrError::InvalidHost(text.to_string()))?;
    Ok(SocketAddr::new(IpAddr::V4(host), 0))
}

fn parse_port(text: &str) -> Result<u16, ParseAddrError> {
    text.parse::<u16>()
        .map_err(|_| ParseAddrError::InvalidPort(text.to_string()))
}
