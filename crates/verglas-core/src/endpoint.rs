use std::fmt;
use std::net::IpAddr;

use verglas_wire::EncodingVersion;

use crate::LocalError;

/// Transport selector of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointProtocol {
    Tcp,
    Udp,
}

impl EndpointProtocol {
    pub fn keyword(self) -> &'static str {
        match self {
            EndpointProtocol::Tcp => "tcp",
            EndpointProtocol::Udp => "udp",
        }
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, EndpointProtocol::Udp)
    }
}

/// A parsed endpoint descriptor: transport tag, host, port and options.
///
/// `source_address` is only meaningful for outgoing use; an adapter
/// endpoint carrying one is rejected at activation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointSpec {
    pub protocol: EndpointProtocol,
    /// Empty means the wildcard address (adapters) or `Default.Host`
    /// (proxies).
    pub host: String,
    pub port: u16,
    /// `-t`, in milliseconds.
    pub timeout: Option<i32>,
    /// `-z`.
    pub compress: bool,
    /// `-v`, accepted for compatibility with older stringified proxies.
    pub encoding: Option<EncodingVersion>,
    /// `--sourceAddress`.
    pub source_address: Option<IpAddr>,
}

impl EndpointSpec {
    pub fn new(protocol: EndpointProtocol, host: impl Into<String>, port: u16) -> Self {
        EndpointSpec {
            protocol,
            host: host.into(),
            port,
            timeout: None,
            compress: false,
            encoding: None,
            source_address: None,
        }
    }

    pub fn is_datagram(&self) -> bool {
        self.protocol.is_datagram()
    }

    pub fn is_secure(&self) -> bool {
        false
    }

    /// Parse one endpoint of the string form
    /// `protocol [-h host] [-p port] [-t ms] [-z] [-v M.m] [--sourceAddress addr]`.
    pub fn parse(s: &str) -> Result<Self, LocalError> {
        let tokens = tokenize(s)?;
        let mut iter = tokens.into_iter();
        let protocol = match iter.next().as_deref() {
            Some("tcp") => EndpointProtocol::Tcp,
            Some("udp") => EndpointProtocol::Udp,
            Some("default") => EndpointProtocol::Tcp,
            Some(other) => {
                return Err(LocalError::ParseError(format!(
                    "unknown endpoint protocol `{other}` in `{s}`"
                )))
            }
            None => return Err(LocalError::ParseError("empty endpoint".into())),
        };
        let mut spec = EndpointSpec::new(protocol, "", 0);
        while let Some(option) = iter.next() {
            let mut arg_for = |opt: &str| {
                iter.next().ok_or_else(|| {
                    LocalError::ParseError(format!("missing argument for {opt} in `{s}`"))
                })
            };
            match option.as_str() {
                "-h" => spec.host = arg_for("-h")?,
                "-p" => {
                    spec.port = arg_for("-p")?.parse().map_err(|_| {
                        LocalError::ParseError(format!("invalid port in `{s}`"))
                    })?;
                }
                "-t" => {
                    let arg = arg_for("-t")?;
                    if arg == "infinite" {
                        spec.timeout = Some(-1);
                    } else {
                        spec.timeout = Some(arg.parse().map_err(|_| {
                            LocalError::ParseError(format!("invalid timeout in `{s}`"))
                        })?);
                    }
                }
                "-z" => spec.compress = true,
                "-v" => {
                    let arg = arg_for("-v")?;
                    spec.encoding = Some(EncodingVersion::parse(&arg).ok_or_else(|| {
                        LocalError::ParseError(format!("invalid encoding version in `{s}`"))
                    })?);
                }
                "--sourceAddress" => {
                    let arg = arg_for("--sourceAddress")?;
                    spec.source_address = Some(arg.parse().map_err(|_| {
                        LocalError::ParseError(format!(
                            "invalid IP address for --sourceAddress in `{s}`"
                        ))
                    })?);
                }
                other => {
                    return Err(LocalError::ParseError(format!(
                        "unknown endpoint option `{other}` in `{s}`"
                    )))
                }
            }
        }
        Ok(spec)
    }

    /// Hosts for adapter usage: a wildcard host expands to every allowed
    /// local interface family.
    pub fn expand_wildcard(&self, ipv4: bool, ipv6: bool) -> Vec<String> {
        if !self.host.is_empty() {
            return vec![self.host.clone()];
        }
        let mut hosts = Vec::new();
        if ipv4 {
            hosts.push("0.0.0.0".to_string());
        }
        if ipv6 {
            hosts.push("::".to_string());
        }
        hosts
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.protocol.keyword())?;
        if !self.host.is_empty() {
            if self.host.contains(':') {
                write!(f, " -h \"{}\"", self.host)?;
            } else {
                write!(f, " -h {}", self.host)?;
            }
        }
        write!(f, " -p {}", self.port)?;
        if let Some(t) = self.timeout {
            write!(f, " -t {t}")?;
        }
        if self.compress {
            f.write_str(" -z")?;
        }
        if let Some(v) = self.encoding {
            write!(f, " -v {v}")?;
        }
        if let Some(addr) = self.source_address {
            write!(f, " --sourceAddress {addr}")?;
        }
        Ok(())
    }
}

/// Split an endpoint string on whitespace, honoring double quotes around
/// hosts that contain ':'.
fn tokenize(s: &str) -> Result<Vec<String>, LocalError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(LocalError::ParseError(format!("unbalanced quotes in `{s}`")));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_tcp() {
        let spec = EndpointSpec::parse("tcp -h example.com -p 4061").unwrap();
        assert_eq!(spec.protocol, EndpointProtocol::Tcp);
        assert_eq!(spec.host, "example.com");
        assert_eq!(spec.port, 4061);
        assert!(!spec.compress);
        assert_eq!(spec.timeout, None);
    }

    #[test]
    fn parse_options() {
        let spec =
            EndpointSpec::parse("udp -h 10.0.0.1 -p 9999 -t 5000 -z --sourceAddress 10.0.0.2")
                .unwrap();
        assert!(spec.is_datagram());
        assert_eq!(spec.timeout, Some(5000));
        assert!(spec.compress);
        assert_eq!(spec.source_address, Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn parse_quoted_ipv6_host() {
        let spec = EndpointSpec::parse("tcp -h \"::1\" -p 7").unwrap();
        assert_eq!(spec.host, "::1");
        // The stringified form re-quotes it.
        assert_eq!(spec.to_string(), "tcp -h \"::1\" -p 7");
    }

    #[test]
    fn parse_rejects_unknown_protocol_and_option() {
        assert!(EndpointSpec::parse("quic -h a -p 1").is_err());
        assert!(EndpointSpec::parse("tcp -h a -p 1 -q").is_err());
        assert!(EndpointSpec::parse("tcp -h").is_err());
    }

    #[test]
    fn display_roundtrip() {
        let s = "tcp -h example.com -p 4061 -t 3000 -z";
        let spec = EndpointSpec::parse(s).unwrap();
        assert_eq!(spec.to_string(), s);
        assert_eq!(EndpointSpec::parse(&spec.to_string()).unwrap(), spec);
    }

    #[test]
    fn wildcard_expansion_follows_family_gating() {
        let spec = EndpointSpec::new(EndpointProtocol::Tcp, "", 0);
        assert_eq!(spec.expand_wildcard(true, false), vec!["0.0.0.0"]);
        assert_eq!(spec.expand_wildcard(true, true), vec!["0.0.0.0", "::"]);
        let named = EndpointSpec::new(EndpointProtocol::Tcp, "h", 0);
        assert_eq!(named.expand_wildcard(true, true), vec!["h"]);
    }

    #[test]
    fn infinite_timeout_keyword() {
        let spec = EndpointSpec::parse("tcp -h a -p 1 -t infinite").unwrap();
        assert_eq!(spec.timeout, Some(-1));
    }
}
