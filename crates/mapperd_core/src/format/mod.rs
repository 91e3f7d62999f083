//! On-disk map blob codecs.
//!
//! Version 0 is the pithos layout: no header, one raw 32-byte sha256 per
//! record, presence ending at the first all-zero record. Version 1 is the
//! archipelago layout: a `u32` version plus `u64` size header, then
//! 33-byte records of an exist flag followed by the sha256.
//!
//! The version is dispatched from the map name: `archip_`-prefixed maps
//! carry the version in their first four bytes, anything else is a pithos
//! map.

mod v0;
mod v1;

use std::rc::Rc;
use std::str::FromStr;

use mapperd_crypto::Digest;
use mapperd_error::MapperError;
use mapperd_serialization::Read;
use spdlog::{debug, error};

use crate::map::{BLOCK_SIZE, MAPPER_PREFIX, Map};

pub use v0::V0;
pub use v1::V1;

pub const MAP_LATEST_VERSION: u32 = 1;

/// Largest volume representable in a single map blob, derived from the
/// archipelago record geometry.
pub const MAX_VOLUME_SIZE: u64 =
    (BLOCK_SIZE - v1::HEADER_SIZE) / v1::RECORD_SIZE * BLOCK_SIZE;

/// A node's projection into the on-disk record: the object name and
/// whether the object is an exclusively owned (writable) one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub object: String,
    pub exist: bool,
}

pub trait MapCodec {
    fn header_size(&self) -> u64;

    fn record_size(&self) -> u64;

    /// Byte offset of one object record within the map blob.
    fn record_offset(&self, idx: u32) -> u64 {
        self.header_size() + idx as u64 * self.record_size()
    }

    fn encode_record(&self, record: &Record) -> Result<Vec<u8>, MapperError>;

    /// Decode a map blob into the map's node table, setting size and
    /// version.
    fn read_map(&self, map: &Rc<Map>, data: &[u8]) -> Result<(), MapperError>;

    /// Serialize the whole map blob: header plus every record up to the
    /// map's object count.
    fn write_map(&self, map: &Map) -> Result<Vec<u8>, MapperError>;
}

pub fn codec_for(version: u32) -> Result<&'static dyn MapCodec, MapperError> {
    match version {
        0 => Ok(&V0),
        1 => Ok(&V1),
        other => Err(MapperError::InvalidVersion(other)),
    }
}

/// Decode a freshly loaded blob into `map`, dispatching on version.
pub fn read_map(map: &Rc<Map>, data: &[u8]) -> Result<(), MapperError> {
    if data.len() < 32 || data[..32].iter().all(|b| *b == 0) {
        error!("map {} read back as zeros", map.volume());
        return Err(MapperError::AbsentMap(map.volume().to_string()));
    }

    let version = if map.is_archip() {
        u32::read(data, &mut 0)?
    } else {
        0
    };
    if version > MAP_LATEST_VERSION {
        error!("map {} carries invalid version {}", map.volume(), version);
        return Err(MapperError::InvalidVersion(version));
    }
    debug!("map {} detected as version {}", map.volume(), version);

    codec_for(version)?.read_map(map, data)
}

/// Parse an object name into its raw digest, tolerating the mapper prefix.
pub(crate) fn object_digest(name: &str) -> Result<Digest, MapperError> {
    let hex = name.strip_prefix(MAPPER_PREFIX).unwrap_or(name);
    Digest::from_str(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{NodeFlags, ZERO_BLOCK};

    #[test]
    fn zero_blob_reads_as_absent() {
        let map = Map::new("archip_vol").unwrap();
        let blob = vec![0u8; BLOCK_SIZE as usize];
        assert!(matches!(
            read_map(&map, &blob),
            Err(MapperError::AbsentMap(_))
        ));
    }

    #[test]
    fn short_blob_reads_as_absent() {
        let map = Map::new("archip_vol").unwrap();
        assert!(matches!(
            read_map(&map, &[1, 2, 3]),
            Err(MapperError::AbsentMap(_))
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let map = Map::new("archip_vol").unwrap();
        let mut blob = vec![0u8; 64];
        blob[0] = 2;
        assert!(matches!(
            read_map(&map, &blob),
            Err(MapperError::InvalidVersion(2))
        ));
    }

    #[test]
    fn version_dispatch_follows_name() {
        // A pithos-named map decodes raw records even when the first four
        // bytes would parse as a version.
        let map = Map::new("pithos-image").unwrap();
        let mut blob = vec![0u8; 64];
        blob[..32].copy_from_slice(&[0x11; 32]);
        read_map(&map, &blob).unwrap();
        assert_eq!(map.version(), 0);
        assert_eq!(map.size(), BLOCK_SIZE);
        assert_eq!(map.find_object(0).unwrap().object(), "11".repeat(32));
    }

    #[test]
    fn v1_roundtrip_preserves_everything() {
        let map = Map::new("archip_vol").unwrap();
        map.set_size(BLOCK_SIZE + 1);
        let owned = format!("{}{}", MAPPER_PREFIX, "aa".repeat(32));
        map.insert_object(crate::map::MapNode::new(
            0,
            owned.clone(),
            NodeFlags::EXIST,
            &map,
        ));
        map.insert_object(crate::map::MapNode::new(
            1,
            ZERO_BLOCK.into(),
            NodeFlags::empty(),
            &map,
        ));

        let blob = V1.write_map(&map).unwrap();
        assert_eq!(
            blob.len() as u64,
            V1.header_size() + 2 * V1.record_size()
        );

        let decoded = Map::new("archip_vol").unwrap();
        read_map(&decoded, &blob).unwrap();
        assert_eq!(decoded.version(), 1);
        assert_eq!(decoded.size(), BLOCK_SIZE + 1);
        let n0 = decoded.find_object(0).unwrap();
        assert_eq!(n0.object(), owned);
        assert!(n0.exists());
        let n1 = decoded.find_object(1).unwrap();
        assert_eq!(n1.object(), ZERO_BLOCK);
        assert!(!n1.exists());
    }

    #[test]
    fn v0_roundtrip_infers_size() {
        let map = Map::new("pithos-image").unwrap();
        let mut blob = vec![0u8; 128];
        blob[..32].copy_from_slice(&[0x11; 32]);
        blob[32..64].copy_from_slice(&[0x22; 32]);
        read_map(&map, &blob).unwrap();
        assert_eq!(map.size(), 2 * BLOCK_SIZE);
        // Decoded pithos records are shared read-only objects.
        assert!(!map.find_object(0).unwrap().exists());
        assert!(map.find_object(2).is_none());

        let reencoded = V0.write_map(&map).unwrap();
        assert_eq!(&reencoded[..64], &blob[..64]);
        assert_eq!(reencoded.len(), 64);
    }

    #[test]
    fn v0_records_are_exactly_the_nonzero_prefix() {
        let map = Map::new("pithos-image").unwrap();
        let mut blob = vec![0u8; 160];
        blob[..32].copy_from_slice(&[0x11; 32]);
        // A gap: record 1 is zero, record 2 is not. Decoding stops at the
        // gap.
        blob[64..96].copy_from_slice(&[0x33; 32]);
        read_map(&map, &blob).unwrap();
        assert_eq!(map.size(), BLOCK_SIZE);
        assert!(map.find_object(1).is_none());
    }

    #[test]
    fn max_volume_size_matches_geometry() {
        assert_eq!(MAX_VOLUME_SIZE, (BLOCK_SIZE - 12) / 33 * BLOCK_SIZE);
    }
}
