use std::fmt;

/// Operation mode carried in every request, byte after the operation name.
///
/// `Nonmutating` survives on the wire for backward compatibility and is
/// treated exactly like `Idempotent` by the retry logic.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OperationMode {
    #[default]
    Normal = 0,
    Nonmutating = 1,
    Idempotent = 2,
}

impl OperationMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => OperationMode::Normal,
            1 => OperationMode::Nonmutating,
            2 => OperationMode::Idempotent,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether a request in this mode may be retried after it was seen by
    /// the peer.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, OperationMode::Normal)
    }
}

/// How a proxy issues its requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InvocationMode {
    /// Request/reply over a stream connection.
    #[default]
    Twoway,
    /// Fire-and-forget over a stream connection.
    Oneway,
    /// Oneway, queued into the connection's batch buffer.
    BatchOneway,
    /// Fire-and-forget over a datagram transport.
    Datagram,
    /// Datagram, queued into the connection's batch buffer.
    BatchDatagram,
}

impl InvocationMode {
    pub fn is_twoway(self) -> bool {
        matches!(self, InvocationMode::Twoway)
    }

    pub fn is_batch(self) -> bool {
        matches!(self, InvocationMode::BatchOneway | InvocationMode::BatchDatagram)
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, InvocationMode::Datagram | InvocationMode::BatchDatagram)
    }

    /// The proxy-string option letter for this mode.
    pub fn option(self) -> &'static str {
        match self {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::BatchOneway => "-O",
            InvocationMode::Datagram => "-d",
            InvocationMode::BatchDatagram => "-D",
        }
    }
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvocationMode::Twoway => "twoway",
            InvocationMode::Oneway => "oneway",
            InvocationMode::BatchOneway => "batch oneway",
            InvocationMode::Datagram => "datagram",
            InvocationMode::BatchDatagram => "batch datagram",
        };
        f.write_str(s)
    }
}

/// The two-valued endpoint selection knob.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EndpointSelection {
    /// Uniformly shuffle resolved addresses.
    #[default]
    Random,
    /// Use resolved addresses exactly in resolver order.
    Ordered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_mode_wire_values() {
        for v in 0..=2 {
            assert_eq!(OperationMode::from_u8(v).unwrap().as_u8(), v);
        }
        assert_eq!(OperationMode::from_u8(3), None);
    }

    #[test]
    fn nonmutating_counts_as_idempotent() {
        assert!(OperationMode::Nonmutating.is_idempotent());
        assert!(OperationMode::Idempotent.is_idempotent());
        assert!(!OperationMode::Normal.is_idempotent());
    }

    #[test]
    fn invocation_mode_predicates() {
        assert!(InvocationMode::Twoway.is_twoway());
        assert!(InvocationMode::BatchDatagram.is_batch());
        assert!(InvocationMode::BatchDatagram.is_datagram());
        assert!(!InvocationMode::Oneway.is_batch());
    }
}
