//! `drbfire://host:port[?token]` addressing.
//!
//! The token is either a decimal signal id (minted by the outside peer for a
//! registered inside peer) or an opaque option string. IPv6 literals are not
//! accepted: the host may not contain `:`.

use std::{fmt, sync::LazyLock};

use regex::Regex;

use crate::tunnel::{error::TunnelError, protocol::SignalId};

pub const SCHEME: &str = "drbfire";

static URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{SCHEME}://([^:/?]+):(\d+)(?:\?(.+))?$")).expect("static uri regex")
});

static ANY_SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9+.\-]*)://").expect("static scheme regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

impl Address {
    pub fn parse(uri: &str) -> Result<Self, TunnelError> {
        let Some(caps) = URI_RE.captures(uri) else {
            if !uri.starts_with(SCHEME) {
                return Err(TunnelError::BadScheme(uri.to_string()));
            }
            return Err(TunnelError::BadUri(uri.to_string()));
        };

        let port = caps[2]
            .parse::<u16>()
            .map_err(|_| TunnelError::BadUri(uri.to_string()))?;

        Ok(Self {
            host: caps[1].to_string(),
            port,
            token: caps.get(3).map(|m| m.as_str().to_string()),
        })
    }

    /// The same address with the token stripped.
    pub fn base(&self) -> Address {
        Address {
            host: self.host.clone(),
            port: self.port,
            token: None,
        }
    }

    pub fn with_token(&self, token: impl Into<String>) -> Address {
        Address {
            token: Some(token.into()),
            ..self.base()
        }
    }

    /// The signal id carried in the token, if the token is a plain decimal
    /// number as written by [`format`]: ASCII digits only, no sign, no
    /// leading zeros.
    pub fn signal_id(&self) -> Option<SignalId> {
        let t = self.token.as_deref()?;
        if t.is_empty() || !t.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if t.len() > 1 && t.starts_with('0') {
            return None;
        }
        t.parse().ok()
    }

    /// `host:port`, the form transports dial and bind.
    pub fn socket_addr(&self) -> String {
        crate::net::join_host_port(&self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format(&self.host, self.port, self.token.as_deref()))
    }
}

impl std::str::FromStr for Address {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

pub fn parse(uri: &str) -> Result<Address, TunnelError> {
    Address::parse(uri)
}

/// Splits `uri` into its base uri and its token.
pub fn split_option(uri: &str) -> Result<(String, Option<String>), TunnelError> {
    let addr = Address::parse(uri)?;
    Ok((addr.base().to_string(), addr.token))
}

pub fn format(host: &str, port: u16, token: Option<&str>) -> String {
    match token {
        Some(t) => format!("{SCHEME}://{host}:{port}?{t}"),
        None => format!("{SCHEME}://{host}:{port}"),
    }
}

/// Rewrites a delegate's uri (e.g. `druby://host:port`) to the tunnel scheme.
///
/// Listeners bound to port 0 only learn their real port after binding, so the
/// public uri is taken from the delegate and re-schemed.
pub fn rewrite_scheme(delegate_uri: &str) -> Result<String, TunnelError> {
    let Some(m) = ANY_SCHEME_RE.find(delegate_uri) else {
        return Err(TunnelError::BadUri(delegate_uri.to_string()));
    };
    let out = format!("{SCHEME}://{}", &delegate_uri[m.end()..]);
    Address::parse(&out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_and_option() {
        let a = parse("drbfire://localhost:0?opt&stuff").unwrap();
        assert_eq!(a.host, "localhost");
        assert_eq!(a.port, 0);
        assert_eq!(a.token.as_deref(), Some("opt&stuff"));
        assert_eq!(a.signal_id(), None);
    }

    #[test]
    fn parse_rejects_other_scheme() {
        match parse("druby://localhost:0") {
            Err(TunnelError::BadScheme(u)) => assert_eq!(u, "druby://localhost:0"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_requires_port() {
        assert!(matches!(
            parse("drbfire://localhost"),
            Err(TunnelError::BadUri(_))
        ));
        assert!(matches!(
            parse("drbfire://localhost:70000"),
            Err(TunnelError::BadUri(_))
        ));
        assert!(matches!(
            parse("drbfire://localhost:abc"),
            Err(TunnelError::BadUri(_))
        ));
    }

    #[test]
    fn split_option_strips_token() {
        let (base, opt) = split_option("drbfire://localhost:0?opt&stuff").unwrap();
        assert_eq!(base, "drbfire://localhost:0");
        assert_eq!(opt.as_deref(), Some("opt&stuff"));

        let (base, opt) = split_option("drbfire://10.0.0.1:7000").unwrap();
        assert_eq!(base, "drbfire://10.0.0.1:7000");
        assert_eq!(opt, None);
    }

    #[test]
    fn numeric_token_is_signal_id() {
        let a = parse("drbfire://example.com:7000?42").unwrap();
        assert_eq!(a.signal_id(), Some(42));
        assert_eq!(a.to_string(), "drbfire://example.com:7000?42");
        assert_eq!(a.socket_addr(), "example.com:7000");
    }

    #[test]
    fn signal_id_requires_plain_digits() {
        let id = |uri: &str| parse(uri).unwrap().signal_id();
        assert_eq!(id("drbfire://h:1?+1"), None);
        assert_eq!(id("drbfire://h:1?01"), None);
        assert_eq!(id("drbfire://h:1? 1"), None);
        assert_eq!(id("drbfire://h:1?1 "), None);
        assert_eq!(id("drbfire://h:1?4294967296"), None);
        assert_eq!(id("drbfire://h:1?4294967295"), Some(u32::MAX));
        assert_eq!(id("drbfire://h:1?10"), Some(10));
    }

    #[test]
    fn parse_rejects_empty_host() {
        assert!(matches!(
            parse("drbfire://:7000"),
            Err(TunnelError::BadUri(_))
        ));
    }

    #[test]
    fn format_is_inverse_of_parse() {
        let uri = format("127.0.0.1", 7000, Some("7"));
        assert_eq!(uri, "drbfire://127.0.0.1:7000?7");
        let a: Address = uri.parse().unwrap();
        assert_eq!(a, Address::parse("drbfire://127.0.0.1:7000").unwrap().with_token("7"));
    }

    #[test]
    fn rewrite_scheme_keeps_bound_port() {
        assert_eq!(
            rewrite_scheme("druby://127.0.0.1:53411").unwrap(),
            "drbfire://127.0.0.1:53411"
        );
        assert_eq!(
            rewrite_scheme("drbssl://localhost:9000").unwrap(),
            "drbfire://localhost:9000"
        );
        assert!(rewrite_scheme("127.0.0.1:80").is_err());
    }
}
