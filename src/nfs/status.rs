//! NFSv3 status codes surfaced to the wire engine (RFC 1813 2.6).

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive as _;

use crate::backend::Error;

/// Subset of the RFC 1813 status space the gateway can produce.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum NfsStatus {
    // NFS3_OK
    Ok = 0,
    // NFS3ERR_NOENT
    NoEnt = 2,
    // NFS3ERR_IO
    Io = 5,
    // NFS3ERR_ACCES
    Access = 13,
    // NFS3ERR_EXIST
    Exist = 17,
    // NFS3ERR_ISDIR
    IsDir = 21,
    // NFS3ERR_INVAL
    Inval = 22,
    // NFS3ERR_NOTEMPTY
    NotEmpty = 66,
}

impl NfsStatus {
    /// Wire value of the status.
    pub fn code(self) -> i64 {
        self.to_i64().unwrap_or(NfsStatus::Io as i64)
    }
}

impl From<&Error> for NfsStatus {
    fn from(err: &Error) -> Self {
        match err {
            Error::Permission => NfsStatus::Access,
            Error::NotExist => NfsStatus::NoEnt,
            Error::Invalid => NfsStatus::Inval,
            Error::Exist => NfsStatus::Exist,
            Error::IsDir => NfsStatus::IsDir,
            Error::NotEmpty => NfsStatus::NotEmpty,
            Error::Io(_) => NfsStatus::Io,
        }
    }
}

impl From<Error> for NfsStatus {
    fn from(err: Error) -> Self {
        NfsStatus::from(&err)
    }
}
