
use crate::Error;

/// TLV8 values longer than this must be split into consecutive entries of
/// the same type, each carrying at most this many bytes.
const MAX_FRAGMENT_LEN: usize = 0xff;

// from pym3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PairingDataComponentType {
    Method = 0x00,
    Identifier = 0x01,
    Salt = 0x02,
    PublicKey = 0x03,
    Proof = 0x04,
    EncryptedData = 0x05,
    State = 0x06,
    ErrorResponse = 0x07,
    RetryDelay = 0x08,
    Certificate = 0x09,
    Signature = 0x0a,
    Permissions = 0x0b,
    FragmentData = 0x0c,
    FragmentLast = 0x0d,
    SessionId = 0x0e,
    Ttl = 0x0f,
    ExtraData = 0x10,
    Info = 0x11,
    Acl = 0x12,
    Flags = 0x13,
    ValidationData = 0x14,
    MfiAuthToken = 0x15,
    MfiProductType = 0x16,
    SerialNumber = 0x17,
    MfiAuthTokenUuid = 0x18,
    AppFlags = 0x19,
    OwnershipProof = 0x1a,
    SetupCodeType = 0x1b,
    ProductionData = 0x1c,
    AppInfo = 0x1d,
    Separator = 0xff,
}

#[derive(Debug, Clone)]
pub struct TLV8Entry {
    pub tlv_type: PairingDataComponentType,
    pub data: Vec<u8>,
}

impl TLV8Entry {
    /// SRP stage
    pub fn m(stage: u8) -> Self {
        Self {
            tlv_type: PairingDataComponentType::State,
            data: [stage].to_vec(),
        }
    }
}

/// Serializes entries, splitting any value longer than 255 bytes into
/// consecutive same-type chunks of at most 255 bytes each (the HAP TLV8
/// fragmentation convention). An empty value still emits one zero-length
/// chunk so the entry round-trips.
pub fn serialize_tlv8(entries: &[TLV8Entry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        if entry.data.is_empty() {
            out.push(entry.tlv_type as u8);
            out.push(0);
            continue;
        }
        for chunk in entry.data.chunks(MAX_FRAGMENT_LEN) {
            out.push(entry.tlv_type as u8);
            out.push(chunk.len() as u8);
            out.extend(chunk);
        }
    }
    out
}

/// Parses a TLV8 byte stream, re-joining fragmented values: a run of
/// consecutive entries sharing the same type, where every entry but the
/// last carries exactly 255 bytes, is merged into a single logical entry.
pub fn deserialize_tlv8(input: &[u8]) -> Result<Vec<TLV8Entry>, Error> {
    let mut index = 0;
    let mut raw = Vec::new();

    while index + 2 <= input.len() {
        let type_byte = input[index];
        let length = input[index + 1] as usize;
        index += 2;

        if index + length > input.len() {
            return Err(Error::MalformedTlv);
        }

        let data = input[index..index + length].to_vec();
        index += length;

        let tlv_type = PairingDataComponentType::try_from(type_byte)
            .map_err(|_| Error::UnknownTlv(type_byte))?;

        raw.push(TLV8Entry { tlv_type, data });
    }

    let mut result: Vec<TLV8Entry> = Vec::new();
    let mut prev_was_full_chunk = false;
    for entry in raw {
        let should_merge = prev_was_full_chunk
            && result
                .last()
                .is_some_and(|prev| prev.tlv_type == entry.tlv_type);
        prev_was_full_chunk = entry.data.len() == MAX_FRAGMENT_LEN;
        if should_merge {
            result.last_mut().unwrap().data.extend(entry.data);
        } else {
            result.push(entry);
        }
    }

    Ok(result)
}

impl TryFrom<u8> for PairingDataComponentType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use PairingDataComponentType::*;
        Ok(match value {
            0x00 => Method,
            0x01 => Identifier,
            0x02 => Salt,
            0x03 => PublicKey,
            0x04 => Proof,
            0x05 => EncryptedData,
            0x06 => State,
            0x07 => ErrorResponse,
            0x08 => RetryDelay,
            0x09 => Certificate,
            0x0a => Signature,
            0x0b => Permissions,
            0x0c => FragmentData,
            0x0d => FragmentLast,
            0x0e => SessionId,
            0x0f => Ttl,
            0x10 => ExtraData,
            0x11 => Info,
            0x12 => Acl,
            0x13 => Flags,
            0x14 => ValidationData,
            0x15 => MfiAuthToken,
            0x16 => MfiProductType,
            0x17 => SerialNumber,
            0x18 => MfiAuthTokenUuid,
            0x19 => AppFlags,
            0x1a => OwnershipProof,
            0x1b => SetupCodeType,
            0x1c => ProductionData,
            0x1d => AppInfo,
            0xff => Separator,
            other => return Err(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_values() {
        let entries = vec![
            TLV8Entry {
                tlv_type: PairingDataComponentType::State,
                data: vec![0x01],
            },
            TLV8Entry {
                tlv_type: PairingDataComponentType::Identifier,
                data: b"host".to_vec(),
            },
        ];
        let bytes = serialize_tlv8(&entries);
        let parsed = deserialize_tlv8(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].data, b"host");
    }

    #[test]
    fn fragments_and_rejoins_values_over_255_bytes() {
        let data: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let entries = vec![TLV8Entry {
            tlv_type: PairingDataComponentType::Certificate,
            data: data.clone(),
        }];

        let bytes = serialize_tlv8(&entries);
        // 600 bytes -> 255 + 255 + 90, three chunks, each with a 2-byte prefix.
        assert_eq!(bytes.len(), 600 + 3 * 2);

        let parsed = deserialize_tlv8(&bytes).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].data, data);
    }

    #[test]
    fn fragments_an_exact_multiple_of_255() {
        let data = vec![0xAB; 510];
        let entries = vec![TLV8Entry {
            tlv_type: PairingDataComponentType::Signature,
            data: data.clone(),
        }];
        let bytes = serialize_tlv8(&entries);
        let parsed = deserialize_tlv8(&bytes).unwrap();
        assert_eq!(parsed[0].data, data);
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = vec![PairingDataComponentType::State as u8, 5, 1, 2];
        assert!(matches!(deserialize_tlv8(&bytes), Err(Error::MalformedTlv)));
    }
}
