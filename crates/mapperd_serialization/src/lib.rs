use core::fmt;
use std::error::Error;

use mapperd_error::MapperError;

mod primitives;

pub trait NumBytes {
    /// Count the number of bytes a type is expected to use.
    fn num_bytes(&self) -> usize;
}

/// Error that can be returned when writing bytes.
#[derive(Debug, Clone)]
pub enum WriteError {
    /// Not enough space in the buffer.
    NotEnoughSpace,
    /// Failed to convert an integer.
    TryFromIntError,
    CustomError(String),
}

impl Error for WriteError {}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::NotEnoughSpace => write!(f, "not enough space to write"),
            WriteError::TryFromIntError => write!(f, "failed to convert integer"),
            WriteError::CustomError(msg) => write!(f, "write error: {}", msg),
        }
    }
}

impl From<WriteError> for MapperError {
    fn from(error: WriteError) -> MapperError {
        MapperError::Serialization(error.to_string())
    }
}

pub trait Write: Sized + NumBytes {
    fn write(&self, bytes: &mut [u8], pos: &mut usize) -> Result<(), WriteError>;

    #[inline(always)]
    fn pack(&self) -> Result<Vec<u8>, WriteError> {
        let num_bytes = self.num_bytes();
        let mut bytes = vec![0_u8; num_bytes];
        self.write(&mut bytes, &mut 0)?;
        Ok(bytes)
    }
}

#[derive(Debug, Clone)]
pub enum ReadError {
    /// Not enough bytes.
    NotEnoughBytes,
    ParseError,
    Overflow,
    CustomError(String),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::NotEnoughBytes => write!(f, "not enough bytes to read"),
            ReadError::ParseError => write!(f, "parse error"),
            ReadError::Overflow => write!(f, "integer overflow"),
            ReadError::CustomError(msg) => write!(f, "read error: {}", msg),
        }
    }
}

impl Error for ReadError {}

impl From<ReadError> for MapperError {
    fn from(error: ReadError) -> MapperError {
        MapperError::Serialization(error.to_string())
    }
}

pub trait Read: Sized + NumBytes {
    fn read(bytes: &[u8], pos: &mut usize) -> Result<Self, ReadError>;

    #[inline(always)]
    fn unpack(bytes: &[u8]) -> Result<Self, ReadError> {
        Self::read(bytes, &mut 0)
    }
}
