/*!
Specialized `Error` and `Result` types for fireflow.

Every fallible operation in the crate reports one of the variants below.
For consumers that need the stable integer contract of the C era (language
bindings mostly), [`ResultCode`] maps each variant onto a non-positive
integer together with a static description string.
*/

use std::{convert, error, fmt, result};

/// Specialized `Error` type for fireflow errors.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    /// Generic error type containing a string
    Other(&'static str),
    /// Bus reset.
    ///
    /// The bus generation changed mid-transaction. Every device handle on
    /// the affected bus is stale; the caller must re-enumerate and match
    /// devices up again by GUID.
    BusReset,
    /// Permission error.
    ///
    /// At least one FireWire node could not be accessed due to insufficient
    /// permissions, and no usable node remained.
    NoPerm,
    /// Busy.
    ///
    /// The target node answered a transaction with a busy response.
    Busy,
    /// IO error
    ///
    /// Catch-all for transport related errors.
    Io(&'static str),
    /// Request size error.
    ///
    /// The request length was rejected by the kernel or the target.
    IoSize,
    /// Request timeout.
    ///
    /// No completion arrived within the per-request timeout.
    IoTimeout,
}

/// Convert from &str to error
impl convert::From<&'static str> for Error {
    fn from(error: &'static str) -> Self {
        Error::Other(error)
    }
}

impl Error {
    /// Returns a tuple representing the error description and its string value.
    pub fn to_str_pair(self) -> (&'static str, Option<&'static str>) {
        match self {
            Error::Other(e) => ("other error", Some(e)),
            Error::BusReset => ("bus reset has occurred", None),
            Error::NoPerm => ("insufficient permissions to access a node", None),
            Error::Busy => ("target node busy", None),
            Error::Io(e) => ("io error", Some(e)),
            Error::IoSize => ("request size not supported", None),
            Error::IoTimeout => ("request timed out", None),
        }
    }

    /// Returns a simple string representation of the error.
    pub fn to_str(self) -> &'static str {
        self.to_str_pair().0
    }

    /// Returns the stable integer result code for this error.
    pub fn result_code(self) -> ResultCode {
        match self {
            Error::Other(_) => ResultCode::OtherError,
            Error::BusReset => ResultCode::BusReset,
            Error::NoPerm => ResultCode::NoPerm,
            Error::Busy => ResultCode::Busy,
            Error::Io(_) => ResultCode::IoError,
            Error::IoSize => ResultCode::IoSize,
            Error::IoTimeout => ResultCode::IoTimeout,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (desc, value) = self.to_str_pair();

        if let Some(value) = value {
            write!(f, "{}: {}", desc, value)
        } else {
            f.write_str(desc)
        }
    }
}

impl error::Error for Error {}

/// Specialized `Result` type for fireflow results.
pub type Result<T> = result::Result<T, Error>;

/// The closed set of result codes of the public contract.
///
/// Codes are non-positive so an out-parameter in a foreign binding can carry
/// either a device count (>= 0) or an error. [`ResultCode::from_i32`] resolves
/// codes outside the valid range to `None`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ResultCode {
    /// Operation completed.
    Success = 0,
    /// Unclassified platform failure.
    OtherError = -1,
    /// Generation changed mid-transaction; handles invalid.
    BusReset = -2,
    /// At least one FireWire node was not accessible due to permissions.
    NoPerm = -3,
    /// Target node reported busy.
    Busy = -4,
    /// Transport error.
    IoError = -5,
    /// Request size rejected by kernel or target.
    IoSize = -6,
    /// No completion within the request timeout.
    IoTimeout = -7,
}

impl ResultCode {
    /// Resolves an integer to a result code; `None` if out of range.
    pub fn from_i32(code: i32) -> Option<ResultCode> {
        match code {
            0 => Some(ResultCode::Success),
            -1 => Some(ResultCode::OtherError),
            -2 => Some(ResultCode::BusReset),
            -3 => Some(ResultCode::NoPerm),
            -4 => Some(ResultCode::Busy),
            -5 => Some(ResultCode::IoError),
            -6 => Some(ResultCode::IoSize),
            -7 => Some(ResultCode::IoTimeout),
            _ => None,
        }
    }

    /// Returns the human-readable description of the code.
    pub fn to_str(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::OtherError => "other error",
            ResultCode::BusReset => "bus reset has occurred",
            ResultCode::NoPerm => "insufficient permissions to access a node",
            ResultCode::Busy => "target node busy",
            ResultCode::IoError => "io error",
            ResultCode::IoSize => "request size not supported",
            ResultCode::IoTimeout => "request timed out",
        }
    }
}

impl From<Error> for ResultCode {
    fn from(err: Error) -> Self {
        err.result_code()
    }
}

impl From<ResultCode> for i32 {
    fn from(code: ResultCode) -> Self {
        code as i32
    }
}

/// Resolves an integer result code to its description string.
///
/// Codes outside the valid range resolve to `None`, the moral equivalent of
/// the NULL the C string table hands back.
pub fn result_str(code: i32) -> Option<&'static str> {
    ResultCode::from_i32(code).map(ResultCode::to_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_round_trip() {
        for &code in &[
            ResultCode::Success,
            ResultCode::OtherError,
            ResultCode::BusReset,
            ResultCode::NoPerm,
            ResultCode::Busy,
            ResultCode::IoError,
            ResultCode::IoSize,
            ResultCode::IoTimeout,
        ] {
            assert_eq!(ResultCode::from_i32(code as i32), Some(code));
        }
    }

    #[test]
    fn test_result_code_out_of_range() {
        assert_eq!(ResultCode::from_i32(-8), None);
        assert_eq!(ResultCode::from_i32(1), None);
        assert_eq!(result_str(-100), None);
    }

    #[test]
    fn test_result_str() {
        assert_eq!(result_str(0), Some("success"));
        assert_eq!(result_str(-2), Some("bus reset has occurred"));
        assert_eq!(result_str(-7), Some("request timed out"));
    }

    #[test]
    fn test_error_to_result_code() {
        assert_eq!(Error::BusReset.result_code() as i32, -2);
        assert_eq!(Error::Io("x").result_code() as i32, -5);
        assert_eq!(ResultCode::from(Error::IoTimeout), ResultCode::IoTimeout);
    }
}
