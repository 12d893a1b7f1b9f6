// kernel/src/abi/error.rs
//
// Kernel error codes.  On the wire a syscall returns a status: >= 0 is
// success, a negative value is `-(code)`.

use core::fmt;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysError {
    Unspecified = 1,
    /// Environment doesn't exist or the caller may not touch it.
    BadEnv = 2,
    Inval = 3,
    NoMem = 4,
    NoFreeEnv = 5,
    /// Memory fault.
    Fault = 6,
}

pub type SysResult<T> = Result<T, SysError>;

impl SysError {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Negative status as returned across the syscall boundary.
    pub const fn to_status(self) -> i32 {
        -(self as i32)
    }

    /// Decode a raw status.  Non-negative values are success; unknown
    /// negative codes collapse into `Unspecified`.
    pub const fn from_status(status: i32) -> Result<u32, SysError> {
        match status {
            s if s >= 0 => Ok(s as u32),
            -2 => Err(SysError::BadEnv),
            -3 => Err(SysError::Inval),
            -4 => Err(SysError::NoMem),
            -5 => Err(SysError::NoFreeEnv),
            -6 => Err(SysError::Fault),
            _ => Err(SysError::Unspecified),
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            SysError::Unspecified => "unspecified error",
            SysError::BadEnv => "bad environment",
            SysError::Inval => "invalid parameter",
            SysError::NoMem => "out of memory",
            SysError::NoFreeEnv => "out of environments",
            SysError::Fault => "segmentation fault",
        }
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for err in [SysError::BadEnv, SysError::Inval, SysError::NoMem, SysError::NoFreeEnv, SysError::Fault] {
            assert_eq!(SysError::from_status(err.to_status()), Err(err));
        }
    }

    #[test]
    fn non_negative_status_is_success() {
        assert_eq!(SysError::from_status(0), Ok(0));
        assert_eq!(SysError::from_status(0x1001), Ok(0x1001));
        assert_eq!(SysError::from_status(-99), Err(SysError::Unspecified));
    }

    #[test]
    fn messages() {
        assert_eq!(alloc::format!("{}", SysError::NoMem), "out of memory");
        assert_eq!(SysError::Fault.to_string(), "segmentation fault");
    }
}
