use crate::protocol::message::Envelope;
use anyhow::{ bail, Result };

/// Wire layout, fixed by interoperability:
///
/// ```text
/// u32 round tag (BE) | u8 flags | i32 sender index (BE)
/// | u16 len + sender uid (decimal, BE bytes)
/// | u16 destination count | per destination: u16 len + uid (decimal)
/// | u32 payload length | canonical JSON payload
/// ```
const FLAG_BROADCAST: u8 = 0x01;

pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + envelope.payload.len());
    out.extend_from_slice(&envelope.round.to_be_bytes());
    out.push(if envelope.is_broadcast { FLAG_BROADCAST } else { 0 });
    out.extend_from_slice(&envelope.from_index.to_be_bytes());

    push_str(&mut out, &envelope.from_uid);
    out.extend_from_slice(&(envelope.to.len() as u16).to_be_bytes());
    for dest in &envelope.to {
        push_str(&mut out, dest);
    }

    out.extend_from_slice(&(envelope.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&envelope.payload);
    out
}

pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let mut cursor = Cursor { bytes, pos: 0 };

    let round = u32::from_be_bytes(cursor.take(4)?.try_into().unwrap());
    let flags = cursor.take(1)?[0];
    let from_index = i32::from_be_bytes(cursor.take(4)?.try_into().unwrap());
    let from_uid = cursor.take_str()?;

    let dest_count = u16::from_be_bytes(cursor.take(2)?.try_into().unwrap());
    let mut to = Vec::with_capacity(dest_count as usize);
    for _ in 0..dest_count {
        to.push(cursor.take_str()?);
    }

    let payload_len = u32::from_be_bytes(cursor.take(4)?.try_into().unwrap()) as usize;
    let payload = cursor.take(payload_len)?.to_vec();
    if cursor.pos != bytes.len() {
        bail!("trailing bytes after payload");
    }

    let is_broadcast = flags & FLAG_BROADCAST != 0;
    if is_broadcast != to.is_empty() {
        bail!("broadcast flag inconsistent with destination list");
    }

    Ok(Envelope { from_uid, from_index, is_broadcast, to, round, payload })
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.bytes.len() {
            bail!("truncated frame");
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_str(&mut self) -> Result<String> {
        let len = u16::from_be_bytes(self.take(2)?.try_into().unwrap()) as usize;
        Ok(String::from_utf8(self.take(len)?.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_broadcast_and_unicast() {
        let broadcast = Envelope {
            from_uid: "123456789".into(),
            from_index: 2,
            is_broadcast: true,
            to: vec![],
            round: 4,
            payload: br#"{"delta":"42"}"#.to_vec(),
        };
        assert_eq!(decode(&encode(&broadcast)).unwrap(), broadcast);

        let unicast = Envelope {
            from_uid: "99".into(),
            from_index: -1,
            is_broadcast: false,
            to: vec!["17".into(), "23".into()],
            round: 0,
            payload: vec![],
        };
        assert_eq!(decode(&encode(&unicast)).unwrap(), unicast);
    }

    #[test]
    fn truncated_or_inconsistent_frames_fail() {
        let envelope = Envelope {
            from_uid: "5".into(),
            from_index: 0,
            is_broadcast: true,
            to: vec![],
            round: 1,
            payload: vec![1, 2, 3],
        };
        let bytes = encode(&envelope);
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());

        let mut flipped = bytes.clone();
        flipped[4] = 0; // clear broadcast flag, destinations stay empty
        assert!(decode(&flipped).is_err());
    }
}
