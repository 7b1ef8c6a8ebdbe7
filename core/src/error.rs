// 错误分类定义
//
// 所有核心操作返回带类型的错误枚举, 而不是字符串:
// 调用方需要区分 Overlap / BadMagic / Cancelled 等情况并分支处理。
// 每种错误有稳定的数字编码, 用于网络协议 result 字段和 CLI 退出码。

use std::io;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid value")]
    InvalidValue,
    #[error("invalid state")]
    InvalidState,
    #[error("out of memory or slots")]
    NoMemory,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("permission denied")]
    PermissionDenied,
    #[error("device busy")]
    Busy,
    #[error("bad magic")]
    BadMagic,
    #[error("bad size")]
    BadSize,
    #[error("data corrupt")]
    DataCorrupt,
    #[error("unexpected end of device")]
    UnexpectedEof,
    #[error("range overlap")]
    Overlap,
    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),
    #[error("cancelled")]
    Cancelled,
    #[error("unknown command code")]
    UnknownCode,
    #[error("not implemented")]
    NotImplemented,
    #[error("not executed")]
    NotExecuted,
}

impl Error {
    /// 稳定数字编码 (0 = 成功, 在协议里单独表示)
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidValue => 1,
            Error::InvalidState => 2,
            Error::NoMemory => 3,
            Error::NotFound => 4,
            Error::AlreadyExists => 5,
            Error::PermissionDenied => 6,
            Error::Busy => 7,
            Error::BadMagic => 8,
            Error::BadSize => 9,
            Error::DataCorrupt => 10,
            Error::UnexpectedEof => 11,
            Error::Overlap => 12,
            Error::Io(_) => 13,
            Error::Cancelled => 14,
            Error::UnknownCode => 15,
            Error::NotImplemented => 16,
            Error::NotExecuted => 17,
        }
    }

    /// 从数字编码还原 (远端错误没有底层 io 细节)
    pub fn from_code(code: u32) -> Error {
        match code {
            1 => Error::InvalidValue,
            2 => Error::InvalidState,
            3 => Error::NoMemory,
            4 => Error::NotFound,
            5 => Error::AlreadyExists,
            6 => Error::PermissionDenied,
            7 => Error::Busy,
            8 => Error::BadMagic,
            9 => Error::BadSize,
            10 => Error::DataCorrupt,
            11 => Error::UnexpectedEof,
            12 => Error::Overlap,
            13 => Error::Io(Arc::new(io::Error::new(
                io::ErrorKind::Other,
                "remote i/o error",
            ))),
            14 => Error::Cancelled,
            16 => Error::NotImplemented,
            17 => Error::NotExecuted,
            _ => Error::UnknownCode,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound,
            io::ErrorKind::PermissionDenied => Error::PermissionDenied,
            io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
            _ => match err.raw_os_error() {
                Some(libc::EBUSY) | Some(libc::EWOULDBLOCK) => Error::Busy,
                _ => Error::Io(Arc::new(err)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        let errors = [
            Error::InvalidValue,
            Error::Overlap,
            Error::BadMagic,
            Error::Cancelled,
            Error::NotExecuted,
        ];
        for err in errors {
            let back = Error::from_code(err.code());
            assert_eq!(back.code(), err.code());
        }
    }

    #[test]
    fn test_io_kind_mapping() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::NotFound));

        let err: Error = io::Error::from_raw_os_error(libc::EBUSY).into();
        assert!(matches!(err, Error::Busy));

        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, Error::UnexpectedEof));
    }
}
