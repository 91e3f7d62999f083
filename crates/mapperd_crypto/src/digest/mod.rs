use core::fmt;
use std::str::FromStr;

use mapperd_error::MapperError;
use mapperd_serialization::{NumBytes, Read, Write};
use sha2::{Digest as _, Sha256};

pub const DIGEST_SIZE: usize = 32;
/// Hex representation of a sha256 value takes up double the digest size.
pub const HEX_DIGEST_SIZE: usize = DIGEST_SIZE * 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    pub fn hash(data: impl AsRef<[u8]>) -> Self {
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&Sha256::digest(data.as_ref()));
        Digest(out)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Lowercase hex rendition, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_SIZE]
    }
}

/// Strict hex decoding: anything other than 64 hex digits is rejected.
impl FromStr for Digest {
    type Err = MapperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HEX_DIGEST_SIZE {
            return Err(MapperError::Serialization(format!(
                "hex digest has length {}, expected {}",
                s.len(),
                HEX_DIGEST_SIZE
            )));
        }
        let mut out = [0u8; DIGEST_SIZE];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| MapperError::Serialization(format!("invalid hex digest: {}", e)))?;
        Ok(Digest(out))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl NumBytes for Digest {
    fn num_bytes(&self) -> usize {
        DIGEST_SIZE
    }
}

impl Write for Digest {
    fn write(
        &self,
        bytes: &mut [u8],
        pos: &mut usize,
    ) -> Result<(), mapperd_serialization::WriteError> {
        self.0.write(bytes, pos)
    }
}

impl Read for Digest {
    fn read(data: &[u8], pos: &mut usize) -> Result<Self, mapperd_serialization::ReadError> {
        Ok(Digest(<[u8; DIGEST_SIZE]>::read(data, pos)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_of_empty_input() {
        assert_eq!(
            Digest::hash([]).to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hex_roundtrip() {
        let d = Digest::hash(b"archipelago");
        assert_eq!(Digest::from_str(&d.to_hex()).unwrap(), d);
    }

    #[test]
    fn non_hex_input_is_rejected() {
        let bad = "zz".repeat(32);
        assert!(Digest::from_str(&bad).is_err());
        assert!(Digest::from_str("e3b0").is_err());
    }
}
