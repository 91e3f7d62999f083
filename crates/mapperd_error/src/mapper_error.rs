use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapperError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("invalid map version: {0}")]
    InvalidVersion(u32),
    #[error("target name too long: {0} bytes")]
    NameTooLong(usize),
    #[error("volume size {requested} exceeds maximum {max}")]
    SizeTooLarge { requested: u64, max: u64 },
    #[error("invalid volume size: {0}")]
    InvalidSize(u64),
    #[error("volume exists: {0}")]
    VolumeExists(String),
    #[error("volume not found: {0}")]
    VolumeNotFound(String),
    #[error("map not held exclusively: {0}")]
    NotExclusive(String),
    #[error("map destroyed: {0}")]
    MapDestroyed(String),
    #[error("map never written: {0}")]
    AbsentMap(String),
    #[error("object not found: index {0}")]
    ObjectNotFound(u32),
    #[error("serialization error: {0}")]
    Serialization(String),
}
