use verglas_wire::{
    EncodingVersion, EndpointSelection, Identity, InvocationMode, ToStringMode, ENCODING_1_1,
};

use crate::endpoint::EndpointSpec;
use crate::LocalError;

/// The immutable value a proxy wraps: who to talk to, how, and over which
/// endpoints. Mutating operations on a proxy clone this record; equality
/// is structural.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub identity: Identity,
    /// Empty string selects the default facet.
    pub facet: String,
    pub mode: InvocationMode,
    pub secure: bool,
    pub prefer_secure: bool,
    pub collocation_optimized: bool,
    /// Three-valued: unset defers to the endpoint's `-z`.
    pub compress: Option<bool>,
    /// Connection establishment override, milliseconds; -1 = infinite.
    pub timeout: Option<i32>,
    /// Reply deadline, milliseconds.
    pub invocation_timeout: Option<i32>,
    pub selection: EndpointSelection,
    /// Indirect binding through a locator; exclusive with `endpoints`.
    pub adapter_id: String,
    pub endpoints: Vec<EndpointSpec>,
    pub router: Option<Box<Reference>>,
    pub locator: Option<Box<Reference>>,
    pub encoding: EncodingVersion,
    /// Partitions otherwise-identical connections.
    pub connection_id: String,
}

impl Reference {
    pub fn new(identity: Identity) -> Self {
        Reference {
            identity,
            facet: String::new(),
            mode: InvocationMode::Twoway,
            secure: false,
            prefer_secure: false,
            collocation_optimized: true,
            compress: None,
            timeout: None,
            invocation_timeout: None,
            selection: EndpointSelection::default(),
            adapter_id: String::new(),
            endpoints: Vec::new(),
            router: None,
            locator: None,
            encoding: ENCODING_1_1,
            connection_id: String::new(),
        }
    }

    /// Parse a stringified proxy:
    /// `identity [-f facet] [-t|-o|-O|-d|-D] [-s] [-e M.m] [: endpoint]* | @ adapter`.
    pub fn parse(s: &str, default_encoding: EncodingVersion) -> Result<Self, LocalError> {
        let (head, tail) = split_head(s);
        let mut tokens = split_quoted_whitespace(head);
        if tokens.is_empty() {
            return Err(LocalError::ParseError(format!("no identity in proxy `{s}`")));
        }
        let identity = Identity::parse(&tokens.remove(0))
            .map_err(|e| LocalError::ParseError(format!("bad identity in `{s}`: {e}")))?;
        if identity.is_null() {
            return Err(LocalError::ParseError(format!("empty identity in proxy `{s}`")));
        }

        let mut reference = Reference::new(identity);
        reference.encoding = default_encoding;
        let mut tokens = tokens.into_iter();
        while let Some(token) = tokens.next() {
            match token.as_str() {
                "-f" => {
                    reference.facet = tokens.next().ok_or_else(|| {
                        LocalError::ParseError(format!("missing facet in `{s}`"))
                    })?;
                }
                "-t" => reference.mode = InvocationMode::Twoway,
                "-o" => reference.mode = InvocationMode::Oneway,
                "-O" => reference.mode = InvocationMode::BatchOneway,
                "-d" => reference.mode = InvocationMode::Datagram,
                "-D" => reference.mode = InvocationMode::BatchDatagram,
                "-s" => reference.secure = true,
                "-e" => {
                    let v = tokens.next().ok_or_else(|| {
                        LocalError::ParseError(format!("missing encoding in `{s}`"))
                    })?;
                    reference.encoding = EncodingVersion::parse(&v).ok_or_else(|| {
                        LocalError::ParseError(format!("bad encoding `{v}` in `{s}`"))
                    })?;
                }
                // The protocol marker is accepted and fixed at 1.0.
                "-p" => {
                    tokens.next();
                }
                other => {
                    return Err(LocalError::ParseError(format!(
                        "unknown proxy option `{other}` in `{s}`"
                    )))
                }
            }
        }

        match tail {
            Some(Tail::Endpoints(parts)) => {
                for part in parts {
                    reference.endpoints.push(EndpointSpec::parse(&part)?);
                }
                if reference.endpoints.is_empty() {
                    return Err(LocalError::ParseError(format!("no endpoints in `{s}`")));
                }
            }
            Some(Tail::AdapterId(id)) => {
                if id.is_empty() {
                    return Err(LocalError::ParseError(format!("empty adapter id in `{s}`")));
                }
                reference.adapter_id = id;
            }
            None => {}
        }
        Ok(reference)
    }

    /// Stringified form; `Reference::parse` of the result reproduces the
    /// value (modulo default encoding).
    pub fn to_proxy_string(&self, mode: ToStringMode) -> String {
        let mut s = self.identity.to_string_mode(mode);
        if !self.facet.is_empty() {
            s.push_str(" -f ");
            s.push_str(&self.facet);
        }
        s.push(' ');
        s.push_str(self.mode.option());
        if self.secure {
            s.push_str(" -s");
        }
        s.push_str(&format!(" -e {}", self.encoding));
        for endpoint in &self.endpoints {
            s.push(':');
            s.push_str(&endpoint.to_string());
        }
        if !self.adapter_id.is_empty() {
            s.push_str(" @ ");
            s.push_str(&self.adapter_id);
        }
        s
    }

    /// Endpoints compatible with the proxy's mode and security needs.
    pub fn usable_endpoints(&self) -> Vec<EndpointSpec> {
        self.endpoints
            .iter()
            .filter(|e| e.is_datagram() == self.mode.is_datagram())
            .filter(|e| !self.secure || e.is_secure())
            .cloned()
            .collect()
    }
}

enum Tail {
    Endpoints(Vec<String>),
    AdapterId(String),
}

/// Split `identity-and-options` from `: endpoints` or `@ adapter`,
/// honoring quotes.
fn split_head(s: &str) -> (&str, Option<Tail>) {
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => {
                let parts = split_endpoints(&s[i + 1..]);
                return (&s[..i], Some(Tail::Endpoints(parts)));
            }
            '@' if !in_quotes => {
                return (&s[..i], Some(Tail::AdapterId(s[i + 1..].trim().to_string())));
            }
            _ => {}
        }
    }
    (s, None)
}

/// Split an endpoint list on ':' outside quotes.
fn split_endpoints(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ':' if !in_quotes => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts.retain(|p| !p.trim().is_empty());
    parts
}

fn split_quoted_whitespace(s: &str) -> Vec<String> {
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
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointProtocol;

    #[test]
    fn parse_identity_only() {
        let r = Reference::parse("greeter", ENCODING_1_1).unwrap();
        assert_eq!(r.identity, Identity::named("greeter"));
        assert!(r.endpoints.is_empty());
        assert!(r.adapter_id.is_empty());
        assert_eq!(r.mode, InvocationMode::Twoway);
    }

    #[test]
    fn parse_full_direct_proxy() {
        let r = Reference::parse(
            "cat/obj -f admin -o -s -e 1.0:tcp -h one -p 1:udp -h two -p 2",
            ENCODING_1_1,
        )
        .unwrap();
        assert_eq!(r.identity, Identity::new("cat", "obj"));
        assert_eq!(r.facet, "admin");
        assert_eq!(r.mode, InvocationMode::Oneway);
        assert!(r.secure);
        assert_eq!(r.encoding, verglas_wire::ENCODING_1_0);
        assert_eq!(r.endpoints.len(), 2);
        assert_eq!(r.endpoints[0].protocol, EndpointProtocol::Tcp);
        assert_eq!(r.endpoints[1].protocol, EndpointProtocol::Udp);
    }

    #[test]
    fn parse_indirect_proxy() {
        let r = Reference::parse("obj @ MyAdapter", ENCODING_1_1).unwrap();
        assert_eq!(r.adapter_id, "MyAdapter");
        assert!(r.endpoints.is_empty());
    }

    #[test]
    fn parse_quoted_ipv6_endpoint_host() {
        let r = Reference::parse("obj:tcp -h \"::1\" -p 9", ENCODING_1_1).unwrap();
        assert_eq!(r.endpoints[0].host, "::1");
    }

    #[test]
    fn parse_rejects_empty_identity_and_bad_options() {
        assert!(Reference::parse("", ENCODING_1_1).is_err());
        assert!(Reference::parse("obj -q", ENCODING_1_1).is_err());
        assert!(Reference::parse("obj -f", ENCODING_1_1).is_err());
    }

    #[test]
    fn string_roundtrip() {
        let r = Reference::parse(
            "cat/obj -f admin -O -s -e 1.1:tcp -h somewhere -p 4061 -t 2000 -z",
            ENCODING_1_1,
        )
        .unwrap();
        let s = r.to_proxy_string(ToStringMode::Unicode);
        let reparsed = Reference::parse(&s, ENCODING_1_1).unwrap();
        assert_eq!(r, reparsed);
    }

    #[test]
    fn usable_endpoints_filter_by_mode() {
        let r = Reference::parse("obj -d:tcp -h a -p 1:udp -h b -p 2", ENCODING_1_1).unwrap();
        let usable = r.usable_endpoints();
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].protocol, EndpointProtocol::Udp);
    }

    #[test]
    fn secure_proxy_has_no_usable_plain_endpoints() {
        let r = Reference::parse("obj -s:tcp -h a -p 1", ENCODING_1_1).unwrap();
        assert!(r.usable_endpoints().is_empty());
    }

    #[test]
    fn structural_equality() {
        let a = Reference::parse("obj:tcp -h a -p 1", ENCODING_1_1).unwrap();
        let b = Reference::parse("obj:tcp -h a -p 1", ENCODING_1_1).unwrap();
        let c = Reference::parse("obj:tcp -h a -p 2", ENCODING_1_1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
