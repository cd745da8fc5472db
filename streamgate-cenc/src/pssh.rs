//! Minimal `pssh` box reader and writer.
//!
//! Only the fields needed to bind a session are read: the system id, the key
//! ids of a version 1 box and the opaque system data.

use crate::{
    error::{CencError, Result},
    reader::Reader,
    system::ProtectionSystem,
};

const PSSH_BOX_TYPE: &[u8; 4] = b"pssh";

/// One parsed `pssh` box.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PsshBox {
    pub version: u8,
    pub system_id: [u8; 16],
    pub key_ids: Vec<[u8; 16]>,
    pub data: Vec<u8>,
}

impl PsshBox {
    /// Version 1 box for `system` listing `key_ids`.
    pub fn new(system: ProtectionSystem, key_ids: Vec<[u8; 16]>) -> Self {
        Self {
            version: 1,
            system_id: system.system_id_bytes(),
            key_ids,
            data: Vec::new(),
        }
    }

    pub fn system(&self) -> Option<ProtectionSystem> {
        ProtectionSystem::from_system_id_bytes(&self.system_id)
    }

    /// Parse every `pssh` box found back to back in `data`.
    pub fn parse_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut reader = Reader::new(data);
        let mut boxes = Vec::new();

        while reader.has_more_data() {
            boxes.push(Self::parse(&mut reader)?);
        }

        if boxes.is_empty() {
            return Err(CencError::Pssh("no pssh box found".to_owned()));
        }

        Ok(boxes)
    }

    fn parse(reader: &mut Reader) -> Result<Self> {
        let start = reader.get_position();
        let size = reader.read_u32()? as u64;
        let box_type = reader.read_bytes(4)?;

        if box_type != PSSH_BOX_TYPE {
            return Err(CencError::Pssh(format!(
                "unexpected box type {:?}",
                String::from_utf8_lossy(&box_type)
            )));
        }

        if size < 32 || start + size > reader.get_length() {
            return Err(CencError::Pssh(format!("invalid box size {}", size)));
        }

        let version = reader.read_u8()?;
        reader.skip(3)?;

        if version > 1 {
            return Err(CencError::Pssh(format!(
                "unrecognized pssh version {}",
                version
            )));
        }

        let mut system_id = [0u8; 16];
        system_id.copy_from_slice(&reader.read_bytes(16)?);

        let mut key_ids = Vec::new();

        if version > 0 {
            let count = reader.read_u32()?;

            for _ in 0..count {
                let mut key_id = [0u8; 16];
                key_id.copy_from_slice(&reader.read_bytes(16)?);
                key_ids.push(key_id);
            }
        }

        let data_size = reader.read_u32()? as usize;
        let data = reader.read_bytes(data_size)?;

        if reader.get_position() != start + size {
            return Err(CencError::Pssh(format!(
                "box size {} does not match its contents",
                size
            )));
        }

        Ok(Self {
            version,
            system_id,
            key_ids,
            data,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(self.version);
        body.extend_from_slice(&[0, 0, 0]);
        body.extend_from_slice(&self.system_id);

        if self.version > 0 {
            body.extend_from_slice(&(self.key_ids.len() as u32).to_be_bytes());
            for key_id in &self.key_ids {
                body.extend_from_slice(key_id);
            }
        }

        body.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        body.extend_from_slice(&self.data);

        let mut out = Vec::with_capacity(body.len() + 8);
        out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(PSSH_BOX_TYPE);
        out.extend_from_slice(&body);
        out
    }
}

/// Key ids listed by all version 1 boxes in `init_data`.
pub fn key_ids(init_data: &[u8]) -> Result<Vec<[u8; 16]>> {
    Ok(PsshBox::parse_all(init_data)?
        .into_iter()
        .flat_map(|pssh| pssh.key_ids)
        .collect())
}
