use std::rc::Rc;

use mapperd_crypto::{DIGEST_SIZE, Digest};
use mapperd_error::MapperError;
use mapperd_serialization::{Read, Write};

use super::{MapCodec, Record, object_digest};
use crate::map::{MAPPER_PREFIX, Map, MapNode, NodeFlags};

/// Map header: `u32` version followed by `u64` volume size.
pub const HEADER_SIZE: u64 = 4 + 8;
/// Exist flag byte plus the raw digest.
pub const RECORD_SIZE: u64 = 1 + DIGEST_SIZE as u64;

/// The archipelago layout.
pub struct V1;

impl MapCodec for V1 {
    fn header_size(&self) -> u64 {
        HEADER_SIZE
    }

    fn record_size(&self) -> u64 {
        RECORD_SIZE
    }

    fn encode_record(&self, record: &Record) -> Result<Vec<u8>, MapperError> {
        let mut out = Vec::with_capacity(RECORD_SIZE as usize);
        out.push(record.exist as u8);
        out.extend_from_slice(object_digest(&record.object)?.as_bytes());
        Ok(out)
    }

    fn read_map(&self, map: &Rc<Map>, data: &[u8]) -> Result<(), MapperError> {
        let mut pos = 0;
        let version = u32::read(data, &mut pos)?;
        let size = u64::read(data, &mut pos)?;
        map.set_version(version);
        map.set_size(size);

        for idx in 0..map.nr_objs() {
            let exist = u8::read(data, &mut pos)? != 0;
            let digest = Digest::read(data, &mut pos)?;
            let (object, flags) = if exist {
                (
                    format!("{}{}", MAPPER_PREFIX, digest.to_hex()),
                    NodeFlags::EXIST,
                )
            } else {
                (digest.to_hex(), NodeFlags::empty())
            };
            map.insert_object(MapNode::new(idx, object, flags, map));
        }
        Ok(())
    }

    fn write_map(&self, map: &Map) -> Result<Vec<u8>, MapperError> {
        let nr_objs = map.nr_objs();
        let mut blob = vec![0u8; HEADER_SIZE as usize + nr_objs as usize * RECORD_SIZE as usize];
        let mut pos = 0;
        map.version()
            .write(&mut blob, &mut pos)
            .map_err(MapperError::from)?;
        map.size()
            .write(&mut blob, &mut pos)
            .map_err(MapperError::from)?;
        for idx in 0..nr_objs {
            let node = map
                .find_object(idx)
                .ok_or(MapperError::ObjectNotFound(idx))?;
            let record = self.encode_record(&Record {
                object: node.object(),
                exist: node.exists(),
            })?;
            blob[pos..pos + record.len()].copy_from_slice(&record);
            pos += record.len();
        }
        Ok(blob)
    }
}
