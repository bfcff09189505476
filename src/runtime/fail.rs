// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::libc::{
    c_int,
    EIO,
    ENOMEM,
};
use ::std::{
    error,
    fmt,
    io,
};

//==============================================================================
// Structures
//==============================================================================

/// Failure
///
/// Carried by every fallible operation in the runtime. The error taxonomy maps
/// onto errno values: a satisfied promise written twice is `EEXIST`, a promise
/// dropped empty is `EPIPE`, a stateless future or promise is `ENXIO`, channel
/// misuse is `EINVAL`, cancellation is `ECANCELED`, a vacated waiter identity
/// is `EFAULT`, deadline expiry is `ETIMEDOUT`, and the transport reports
/// `EAGAIN` / `ENOENT` / `EIO` for retry, unknown-destination, and fatal
/// conditions respectively.
#[derive(Clone)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new Failure
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// Checks whether this failure denotes a cancelled operation.
    pub fn is_cancelled(&self) -> bool {
        self.errno == libc::ECANCELED
    }

    /// Checks whether this failure denotes an expired deadline.
    pub fn is_timeout(&self) -> bool {
        self.errno == libc::ETIMEDOUT
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Debug Trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

/// Conversion Trait Implementation for Failures
impl From<io::Error> for Fail {
    fn from(_: io::Error) -> Self {
        Self {
            errno: EIO,
            cause: "I/O error".to_string(),
        }
    }
}

/// Conversion Trait Implementation for Failures
impl From<std::alloc::LayoutError> for Fail {
    fn from(_: std::alloc::LayoutError) -> Self {
        Self {
            errno: ENOMEM,
            cause: "invalid memory layout".to_string(),
        }
    }
}
