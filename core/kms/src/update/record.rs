//! Update record wire format.
//!
//! ```text
//! type u8 | counter u64 LE | len u16 LE | payload[len]
//! ```

use tokenkms_common::{Error, GroupId, KeyId, Result, UserId};

use crate::transaction::CapturedStatement;

const HEADER_LEN: usize = 1 + 8 + 2;

const TYPE_STATEMENT: u8 = 1;
const TYPE_REMOVE_USER_FROM_GROUP: u8 = 2;
const TYPE_REMOVE_USER: u8 = 3;
const TYPE_REMOVE_GROUP: u8 = 4;
const TYPE_DELIVER_KEY: u8 = 5;
const TYPE_RESET: u8 = 6;

/// What a record asks the device to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    /// Replay a statement captured on the administrator store.
    Statement(CapturedStatement),
    /// Remove a user from a group.
    RemoveUserFromGroup {
        /// Leaving user.
        user: UserId,
        /// Group left.
        group: GroupId,
    },
    /// Remove a user; a full wipe when it is the device's own user.
    RemoveUser(UserId),
    /// Remove a group, orphaning its keys.
    RemoveGroup {
        /// Removed group.
        group: GroupId,
        /// Deactivation time stamped on the orphaned keys.
        deactivated_at: i64,
    },
    /// Install key material wrapped with the device's wrapping key.
    DeliverKey {
        /// Key receiving the material.
        key_id: KeyId,
        /// Wrapped material.
        wrapped: Vec<u8>,
    },
    /// Wipe all replicated state. Always carries counter 0.
    Reset,
}

impl RecordBody {
    fn type_tag(&self) -> u8 {
        match self {
            RecordBody::Statement(_) => TYPE_STATEMENT,
            RecordBody::RemoveUserFromGroup { .. } => TYPE_REMOVE_USER_FROM_GROUP,
            RecordBody::RemoveUser(_) => TYPE_REMOVE_USER,
            RecordBody::RemoveGroup { .. } => TYPE_REMOVE_GROUP,
            RecordBody::DeliverKey { .. } => TYPE_DELIVER_KEY,
            RecordBody::Reset => TYPE_RESET,
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            RecordBody::Statement(statement) => out = serde_json::to_vec(statement)?,
            RecordBody::RemoveUserFromGroup { user, group } => {
                out.extend_from_slice(&user.value().to_le_bytes());
                out.extend_from_slice(&group.value().to_le_bytes());
            }
            RecordBody::RemoveUser(user) => out.extend_from_slice(&user.value().to_le_bytes()),
            RecordBody::RemoveGroup {
                group,
                deactivated_at,
            } => {
                out.extend_from_slice(&group.value().to_le_bytes());
                out.extend_from_slice(&(*deactivated_at as u64).to_le_bytes());
            }
            RecordBody::DeliverKey { key_id, wrapped } => {
                let len = u16::try_from(wrapped.len())
                    .map_err(|_| Error::Parameter("Wrapped key too large".to_string()))?;
                out.extend_from_slice(&key_id.value().to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(wrapped);
            }
            RecordBody::Reset => {}
        }
        Ok(out)
    }

    fn parse(tag: u8, payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let body = match tag {
            TYPE_STATEMENT => RecordBody::Statement(
                serde_json::from_slice(payload)
                    .map_err(|e| Error::Transport(format!("Malformed statement record: {}", e)))?,
            ),
            TYPE_REMOVE_USER_FROM_GROUP => RecordBody::RemoveUserFromGroup {
                user: UserId::new(reader.u32()?)?,
                group: GroupId::new(reader.u32()?)?,
            },
            TYPE_REMOVE_USER => RecordBody::RemoveUser(UserId::new(reader.u32()?)?),
            TYPE_REMOVE_GROUP => RecordBody::RemoveGroup {
                group: GroupId::new(reader.u32()?)?,
                deactivated_at: reader.u64()? as i64,
            },
            TYPE_DELIVER_KEY => {
                let key_id = KeyId::managed(reader.u32()?)?;
                let len = reader.u16()? as usize;
                RecordBody::DeliverKey {
                    key_id,
                    wrapped: reader.take(len)?.to_vec(),
                }
            }
            TYPE_RESET => RecordBody::Reset,
            other => return Err(Error::Transport(format!("Unknown record type {}", other))),
        };
        if tag != TYPE_STATEMENT && !reader.is_done() {
            return Err(Error::Transport(format!(
                "Record type {} carries trailing bytes",
                tag
            )));
        }
        Ok(body)
    }
}

/// One counter-stamped record of an update file.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRecord {
    /// Per-user counter; 0 only for resets.
    pub counter: u64,
    /// Action.
    pub body: RecordBody,
}

impl UpdateRecord {
    /// Create a record.
    pub fn new(counter: u64, body: RecordBody) -> Self {
        Self { counter, body }
    }

    /// Append the encoded record to `out`.
    ///
    /// # Errors
    /// - `Error::Parameter` if the payload exceeds 65535 bytes or a reset
    ///   carries a non-zero counter
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        if (self.body == RecordBody::Reset) != (self.counter == 0) {
            return Err(Error::Parameter(format!(
                "Counter 0 is reserved for resets, got {} for type {}",
                self.counter,
                self.body.type_tag()
            )));
        }
        let payload = self.body.payload()?;
        let len = u16::try_from(payload.len()).map_err(|_| {
            Error::Parameter(format!("Record payload of {} bytes too large", payload.len()))
        })?;
        out.push(self.body.type_tag());
        out.extend_from_slice(&self.counter.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(())
    }

    /// Encode a sequence of records.
    pub fn encode_all(records: &[UpdateRecord]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for record in records {
            record.encode_into(&mut out)?;
        }
        Ok(out)
    }

    /// Decode every record of an update file body.
    ///
    /// # Errors
    /// - `Error::Transport` on a truncated or malformed record
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<UpdateRecord>> {
        let mut reader = Reader::new(bytes);
        let mut records = Vec::new();
        while !reader.is_done() {
            if reader.remaining() < HEADER_LEN {
                return Err(Error::Transport(format!(
                    "Truncated record header at offset {}",
                    reader.pos
                )));
            }
            let tag = reader.u8()?;
            let counter = reader.u64()?;
            let len = reader.u16()? as usize;
            let body = RecordBody::parse(tag, reader.take(len)?)?;
            if (body == RecordBody::Reset) != (counter == 0) {
                return Err(Error::Transport(format!(
                    "Record type {} with counter {}",
                    tag, counter
                )));
            }
            records.push(UpdateRecord { counter, body });
        }
        Ok(records)
    }
}

struct Reader<'b> {
    bytes: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    fn new(bytes: &'b [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'b [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| Error::Transport("Truncated update record".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}
