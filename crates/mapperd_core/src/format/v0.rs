use std::rc::Rc;

use mapperd_crypto::{DIGEST_SIZE, Digest};
use mapperd_error::MapperError;
use spdlog::debug;

use super::{MapCodec, Record, object_digest};
use crate::map::{BLOCK_SIZE, Map, MapNode, NodeFlags};

pub const RECORD_SIZE: u64 = DIGEST_SIZE as u64;

/// The pithos layout: no header, raw digests, presence ending at the first
/// all-zero record. Volume size is inferred from the record count.
pub struct V0;

impl MapCodec for V0 {
    fn header_size(&self) -> u64 {
        0
    }

    fn record_size(&self) -> u64 {
        RECORD_SIZE
    }

    fn encode_record(&self, record: &Record) -> Result<Vec<u8>, MapperError> {
        // The exist bit is not representable here; only the digest is
        // kept. An owned object's prefix is stripped before hex decoding.
        Ok(object_digest(&record.object)?.as_bytes().to_vec())
    }

    fn read_map(&self, map: &Rc<Map>, data: &[u8]) -> Result<(), MapperError> {
        let mut nr_objs = 0u32;
        for chunk in data.chunks_exact(DIGEST_SIZE) {
            if chunk.iter().all(|b| *b == 0) {
                break;
            }
            let digest = Digest(chunk.try_into().unwrap());
            // A pithos record names a shared read-only object, so the node
            // starts without EXIST and a write must copy it up first.
            map.insert_object(MapNode::new(
                nr_objs,
                digest.to_hex(),
                NodeFlags::empty(),
                map,
            ));
            nr_objs += 1;
        }
        debug!("found {} objects in map {}", nr_objs, map.volume());
        map.set_size(nr_objs as u64 * BLOCK_SIZE);
        map.set_version(0);
        Ok(())
    }

    fn write_map(&self, map: &Map) -> Result<Vec<u8>, MapperError> {
        let nr_objs = map.nr_objs();
        let mut blob = Vec::with_capacity(nr_objs as usize * DIGEST_SIZE);
        for idx in 0..nr_objs {
            let node = map
                .find_object(idx)
                .ok_or(MapperError::ObjectNotFound(idx))?;
            blob.extend_from_slice(object_digest(&node.object())?.as_bytes());
        }
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::MAPPER_PREFIX;

    #[test]
    fn encode_record_strips_mapper_prefix() {
        let plain = Record {
            object: "ab".repeat(32),
            exist: false,
        };
        let owned = Record {
            object: format!("{}{}", MAPPER_PREFIX, "ab".repeat(32)),
            exist: true,
        };
        assert_eq!(
            V0.encode_record(&plain).unwrap(),
            V0.encode_record(&owned).unwrap()
        );
        assert_eq!(V0.encode_record(&plain).unwrap(), vec![0xab; 32]);
    }

    #[test]
    fn record_offsets_have_no_header() {
        assert_eq!(V0.record_offset(0), 0);
        assert_eq!(V0.record_offset(3), 96);
    }
}
