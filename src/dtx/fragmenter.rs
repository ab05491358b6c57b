//! Per-channel reassembly of fragmented DTX messages.
//!
//! A logical message that doesn't fit in one frame arrives as a run of
//! frames sharing `message_id`: a header-only first frame (`fragment_id ==
//! 0`), followed by `fragment_count - 1` frames each carrying a payload
//! slice. The last slice (`fragment_id == fragment_count - 1`) completes
//! the message.

use std::collections::VecDeque;

use crate::Error;

use super::message::{decode_aux, AuxValue, MessageHeader, PayloadHeader};

/// One fully reassembled DTX message, independent of how many wire frames
/// it took to arrive.
#[derive(Debug, Clone)]
pub struct DtxMessage {
    pub message_id: u32,
    pub conversation_index: u32,
    pub channel_code: i32,
    pub expects_reply: bool,
    pub aux: Vec<AuxValue>,
    pub object: Option<plist::Value>,
}

/// Accumulates fragments for one channel and yields completed messages in
/// arrival order.
#[derive(Debug, Default)]
pub struct Fragmenter {
    accum: Vec<u8>,
    pending_header: Option<MessageHeader>,
    pub queue: VecDeque<DtxMessage>,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one wire frame's header and payload bytes into this channel's
    /// reassembly state, completing and enqueuing a [`DtxMessage`] when the
    /// frame finishes a message.
    pub fn feed(&mut self, header: MessageHeader, payload: Vec<u8>) -> Result<(), Error> {
        if header.fragment_count <= 1 {
            let msg = parse_payload(&header, &payload)?;
            self.queue.push_back(msg);
            return Ok(());
        }

        if header.fragment_id == 0 {
            // Header-only first fragment: start a new accumulation, discarding
            // any previous incomplete one (the device never interleaves
            // fragments of two messages on the same channel).
            self.accum.clear();
            self.pending_header = Some(header);
            return Ok(());
        }

        let Some(pending) = self.pending_header else {
            return Err(Error::MalformedFrame(
                "fragment continuation with no preceding header fragment".into(),
            ));
        };
        if pending.message_id != header.message_id {
            return Err(Error::MalformedFrame(
                "fragment continuation for a different message_id".into(),
            ));
        }

        self.accum.extend_from_slice(&payload);

        if header.fragment_id == header.fragment_count - 1 {
            let msg = parse_payload(&pending, &self.accum)?;
            self.accum.clear();
            self.pending_header = None;
            self.queue.push_back(msg);
        }

        Ok(())
    }
}

fn parse_payload(header: &MessageHeader, bytes: &[u8]) -> Result<DtxMessage, Error> {
    if bytes.len() < 16 {
        return Err(Error::NotEnoughBytes(bytes.len(), 16));
    }
    let payload_header_bytes: [u8; 16] = bytes[..16].try_into().unwrap();
    let payload_header = PayloadHeader::from_bytes(&payload_header_bytes)?;
    if payload_header.compression() != 0 {
        return Err(Error::CompressedMessagesUnsupported);
    }

    let aux_start = 16;
    let aux_end = aux_start + payload_header.aux_length as usize;
    if aux_end > bytes.len() {
        return Err(Error::NotEnoughBytes(bytes.len(), aux_end));
    }
    let aux = if payload_header.aux_length > 0 {
        decode_aux(&bytes[aux_start..aux_end])?
    } else {
        Vec::new()
    };

    let object_len = payload_header
        .total_length
        .checked_sub(payload_header.aux_length as u64)
        .ok_or_else(|| Error::MalformedFrame("aux_length exceeds total_length".into()))?
        as usize;
    let object_end = aux_end + object_len;
    if object_end > bytes.len() {
        return Err(Error::NotEnoughBytes(bytes.len(), object_end));
    }
    let object_bytes = &bytes[aux_end..object_end];
    let object = if object_bytes.is_empty() {
        None
    } else {
        Some(ns_keyed_archive::decode::from_bytes(object_bytes)?)
    };

    Ok(DtxMessage {
        message_id: header.message_id,
        conversation_index: header.conversation_index,
        channel_code: header.channel_code,
        expects_reply: header.expects_reply,
        aux,
        object,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::message::encode_aux;

    fn header(fragment_id: u16, fragment_count: u16, channel_code: i32) -> MessageHeader {
        MessageHeader {
            fragment_id,
            fragment_count,
            payload_length: 0,
            message_id: 1,
            conversation_index: 0,
            channel_code,
            expects_reply: false,
        }
    }

    fn encode_message_payload(aux: &[AuxValue]) -> Vec<u8> {
        let aux_bytes = if aux.is_empty() {
            Vec::new()
        } else {
            encode_aux(aux)
        };
        let payload_header = PayloadHeader {
            flags: 2,
            aux_length: aux_bytes.len() as u32,
            total_length: aux_bytes.len() as u64,
        };
        let mut out = payload_header.to_bytes().to_vec();
        out.extend_from_slice(&aux_bytes);
        out
    }

    #[test]
    fn single_fragment_message_completes_immediately() {
        let mut f = Fragmenter::new();
        let payload = encode_message_payload(&[AuxValue::Int32(7)]);
        f.feed(header(0, 1, 1), payload).unwrap();
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.queue[0].aux, vec![AuxValue::Int32(7)]);
    }

    #[test]
    fn three_fragment_message_reassembles_in_order() {
        let mut f = Fragmenter::new();
        let full = encode_message_payload(&[AuxValue::Int32(1), AuxValue::Int64(2)]);
        let (first_half, second_half) = full.split_at(full.len() / 2);

        f.feed(header(0, 3, 5), Vec::new()).unwrap();
        assert!(f.queue.is_empty());
        f.feed(header(1, 3, 5), first_half.to_vec()).unwrap();
        assert!(f.queue.is_empty());
        f.feed(header(2, 3, 5), second_half.to_vec()).unwrap();

        assert_eq!(f.queue.len(), 1);
        assert_eq!(
            f.queue[0].aux,
            vec![AuxValue::Int32(1), AuxValue::Int64(2)]
        );
    }

    #[test]
    fn rejects_a_compressed_payload() {
        let mut f = Fragmenter::new();
        let payload_header = PayloadHeader {
            flags: 2 | (1 << 12),
            aux_length: 0,
            total_length: 0,
        };
        let bytes = payload_header.to_bytes().to_vec();
        assert!(matches!(
            f.feed(header(0, 1, 1), bytes),
            Err(Error::CompressedMessagesUnsupported)
        ));
    }
}
