use std::fmt;

/// Status byte leading every reply body.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    /// Success; the params encapsulation follows.
    Ok = 0,
    /// The servant raised a declared exception; its encapsulation follows.
    UserException = 1,
    /// No servant with the requested identity.
    ObjectNotExist = 2,
    /// Servant exists but not the requested facet.
    FacetNotExist = 3,
    /// Servant and facet exist but not the operation.
    OperationNotExist = 4,
    /// Dispatch failed with a runtime error local to the server.
    UnknownLocalException = 5,
    /// Dispatch raised an undeclared user exception.
    UnknownUserException = 6,
    /// Dispatch failed in an unclassifiable way.
    UnknownException = 7,
}

impl ReplyStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::UserException,
            2 => ReplyStatus::ObjectNotExist,
            3 => ReplyStatus::FacetNotExist,
            4 => ReplyStatus::OperationNotExist,
            5 => ReplyStatus::UnknownLocalException,
            6 => ReplyStatus::UnknownUserException,
            7 => ReplyStatus::UnknownException,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Statuses whose body is identity + facet + operation rather than an
    /// encapsulation.
    pub fn is_request_failed(self) -> bool {
        matches!(
            self,
            ReplyStatus::ObjectNotExist
                | ReplyStatus::FacetNotExist
                | ReplyStatus::OperationNotExist
        )
    }

    /// Statuses whose body is a plain string description.
    pub fn is_unknown_exception(self) -> bool {
        matches!(
            self,
            ReplyStatus::UnknownLocalException
                | ReplyStatus::UnknownUserException
                | ReplyStatus::UnknownException
        )
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::UserException => "user exception",
            ReplyStatus::ObjectNotExist => "object not exist",
            ReplyStatus::FacetNotExist => "facet not exist",
            ReplyStatus::OperationNotExist => "operation not exist",
            ReplyStatus::UnknownLocalException => "unknown local exception",
            ReplyStatus::UnknownUserException => "unknown user exception",
            ReplyStatus::UnknownException => "unknown exception",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_status_roundtrip() {
        for v in 0..=7 {
            assert_eq!(ReplyStatus::from_u8(v).unwrap().as_u8(), v);
        }
        assert_eq!(ReplyStatus::from_u8(8), None);
    }

    #[test]
    fn status_classification() {
        assert!(ReplyStatus::ObjectNotExist.is_request_failed());
        assert!(ReplyStatus::UnknownException.is_unknown_exception());
        assert!(!ReplyStatus::Ok.is_request_failed());
        assert!(!ReplyStatus::UserException.is_unknown_exception());
    }
}
