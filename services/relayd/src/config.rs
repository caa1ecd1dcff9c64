//! Command-line arguments and relay tuple assembly.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

use relay_netaddr::{parse_host_port, ParseAddrError};

/// Multi-tenant transparent TCP relay.
#[derive(Debug, Parser)]
#[command(name = "relayd", about = "Multi-tenant transparent TCP relay")]
pub struct Args {
    /// Listen address or port (host:port, [v6]:port, or bare port).
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Destination address (ip and port both required).
    #[arg(short = 'd', long)]
    pub dst: Option<String>,

    /// Source address or ip to bind outbound connections to.
    #[arg(short = 's', long)]
    pub src: Option<String>,

    /// Batch form: "listen,[src,]dst" groups separated by '/'.
    #[arg(short = 'r', long = "relay_list")]
    pub relay_list: Option<String>,

    /// Log file; stderr when absent.
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Verbose output (trace level).
    #[arg(short = 'V', long)]
    pub verbose: bool,

    /// Number of worker event loops.
    #[arg(short = 'w', long, default_value_t = 1)]
    pub workers: usize,
}

/// One relay configuration: where to listen, where to connect, and
/// optionally which local address outbound connections bind to.
///
/// Built once at startup and shared read-only by every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTuple {
    pub listen: SocketAddr,
    pub src: Option<SocketAddr>,
    pub dst: SocketAddr,
}

impl RelayTuple {
    /// Validate and build a tuple. The destination must be fully
    /// specified; the source may be absent or port-0 (OS chooses).
    pub fn new(
        listen: SocketAddr,
        src: Option<SocketAddr>,
        dst: SocketAddr,
    ) -> Result<Self, ConfigError> {
        if dst.port() == 0 || dst.ip().is_unspecified() {
            return Err(ConfigError::UnspecifiedDst(dst));
        }
        Ok(Self { listen, src, dst })
    }
}

/// Errors surfaced while assembling relay tuples from arguments.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An address argument failed to parse.
    #[error("invalid {what} address '{text}': {source}")]
    Addr {
        what: &'static str,
        text: String,
        source: ParseAddrError,
    },

    /// The destination must name a concrete ip and port.
    #[error("destination must specify ip and port, got '{0}'")]
    UnspecifiedDst(SocketAddr),

    /// A relay-list group had the wrong number of fields.
    #[error("relay group '{0}' must be listen,[src,]dst")]
    MalformedGroup(String),

    /// --listen and --dst must be given together.
    #[error("--listen and --dst must be given together")]
    IncompletePair,

    /// Nothing to relay.
    #[error("no relay configured; use --listen/--dst or --relay_list")]
    Empty,
}

fn parse_addr(what: &'static str, text: &str) -> Result<SocketAddr, ConfigError> {
    parse_host_port(text).map_err(|source| ConfigError::Addr {
        what,
        text: text.to_string(),
        source,
    })
}

/// Parse one `listen,[src,]dst` group.
fn parse_group(group: &str) -> Result<RelayTuple, ConfigError> {
    let fields: Vec<&str> = group.split(',').collect();
    let (listen, src, dst) = match fields.as_slice() {
        [listen, dst] => (*listen, None, *dst),
        [listen, src, dst] => (*listen, Some(*src), *dst),
        _ => return Err(ConfigError::MalformedGroup(group.to_string())),
    };

    let listen = parse_addr("listen", listen)?;
    let src = src.map(|s| parse_addr("src", s)).transpose()?;
    let dst = parse_addr("dst", dst)?;
    RelayTuple::new(listen, src, dst)
}

/// Assemble the relay tuples from the parsed arguments.
pub fn tuples_from_args(args: &Args) -> Result<Vec<RelayTuple>, ConfigError> {
    let mut tuples = Vec::new();

    match (&args.listen, &args.dst) {
        (Some(listen), Some(dst)) => {
            let listen = parse_addr("listen", listen)?;
            let src = args
                .src
                .as_deref()
                .map(|s| parse_addr("src", s))
                .transpose()?;
            let dst = parse_addr("dst", dst)?;
            tuples.push(RelayTuple::new(listen, src, dst)?);
        }
        (None, None) => {}
        _ => return Err(ConfigError::IncompletePair),
    }

    if let Some(list) = &args.relay_list {
        for group in list.split('/').filter(|g| !g.is_empty()) {
            tuples.push(parse_group(group)?);
        }
    }

    if tuples.is_empty() {
        return Err(ConfigError::Empty);
    }
    Ok(tuples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn args() -> Args {
        Args {
            listen: None,
            dst: None,
            src: None,
            relay_list: None,
            file: None,
            verbose: false,
            workers: 1,
        }
    }

    #[test]
    fn single_tuple_from_flags() {
        let mut a = args();
        a.listen = Some("19001".to_string());
        a.dst = Some("127.0.0.1:19002".to_string());
        let tuples = tuples_from_args(&a).unwrap();
        assert_eq!(
            tuples,
            vec![RelayTuple {
                listen: addr("0.0.0.0:19001"),
                src: None,
                dst: addr("127.0.0.1:19002"),
            }]
        );
    }

    #[test]
    fn source_bind_may_omit_port() {
        let mut a = args();
        a.listen = Some("19001".to_string());
        a.src = Some("127.0.0.1".to_string());
        a.dst = Some("127.0.0.1:19002".to_string());
        let tuples = tuples_from_args(&a).unwrap();
        assert_eq!(tuples[0].src, Some(addr("127.0.0.1:0")));
    }

    #[test]
    fn relay_list_batch_form() {
        let mut a = args();
        a.relay_list = Some("19101,127.0.0.1:19111/19102,127.0.0.1:19112".to_string());
        let tuples = tuples_from_args(&a).unwrap();
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[0].listen, addr("0.0.0.0:19101"));
        assert_eq!(tuples[0].dst, addr("127.0.0.1:19111"));
        assert_eq!(tuples[1].listen, addr("0.0.0.0:19102"));
        assert_eq!(tuples[1].dst, addr("127.0.0.1:19112"));
    }

    #[test]
    fn relay_list_group_with_source() {
        let mut a = args();
        a.relay_list = Some("19101,10.0.0.1,10.0.0.2:80".to_string());
        let tuples = tuples_from_args(&a).unwrap();
        assert_eq!(tuples[0].src, Some(addr("10.0.0.1:0")));
        assert_eq!(tuples[0].dst, addr("10.0.0.2:80"));
    }

    #[test]
    fn malformed_group_is_rejected() {
        let mut a = args();
        a.relay_list = Some("19101".to_string());
        assert!(matches!(
            tuples_from_args(&a),
            Err(ConfigError::MalformedGroup(_))
        ));
    }

    #[test]
    fn destination_must_be_fully_specified() {
        let mut a = args();
        a.listen = Some("19001".to_string());
        a.dst = Some("80".to_string()); // parses to 0.0.0.0:80
        assert!(matches!(
            tuples_from_args(&a),
            Err(ConfigError::UnspecifiedDst(_))
        ));

        let mut a = args();
        a.listen = Some("19001".to_string());
        a.dst = Some("127.0.0.1".to_string()); // port 0
        assert!(matches!(
            tuples_from_args(&a),
            Err(ConfigError::UnspecifiedDst(_))
        ));
    }

    #[test]
    fn listen_without_dst_is_rejected() {
        let mut a = args();
        a.listen = Some("19001".to_string());
        assert!(matches!(
            tuples_from_args(&a),
            Err(ConfigError::IncompletePair)
        ));
    }

    #[test]
    fn empty_configuration_is_rejected() {
        assert!(matches!(tuples_from_args(&args()), Err(ConfigError::Empty)));
    }

    #[test]
    fn parse_errors_carry_context() {
        let mut a = args();
        a.listen = Some("19001".to_string());
        a.dst = Some("127.0.0.1:99999".to_string());
        match tuples_from_args(&a) {
            Err(ConfigError::Addr { what, source, .. }) => {
                assert_eq!(what, "dst");
                assert_eq!(source, ParseAddrError::InvalidPort("99999".to_string()));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
