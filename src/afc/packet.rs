use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::{Error, ReadWrite};

use super::opcode::AfcOpcode;

/// Fixed 40-byte header preceding every AFC packet: magic, lengths, a
/// monotonic packet number, and the opcode. All fields are little-endian.
#[derive(Clone, Debug)]
pub struct AfcPacketHeader {
    pub magic: u64,
    pub entire_len: u64,
    pub header_payload_len: u64,
    pub packet_num: u64,
    pub operation: AfcOpcode,
}

#[derive(Clone, Debug)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(Self::LEN as usize);

        res.extend_from_slice(&self.magic.to_le_bytes());
        res.extend_from_slice(&self.entire_len.to_le_bytes());
        res.extend_from_slice(&self.header_payload_len.to_le_bytes());
        res.extend_from_slice(&self.packet_num.to_le_bytes());
        res.extend_from_slice(&(self.operation.clone() as u64).to_le_bytes());

        res
    }

    pub async fn read(reader: &mut (impl ReadWrite + ?Sized)) -> Result<Self, Error> {
        let mut header_bytes = [0u8; Self::LEN as usize];
        reader.read_exact(&mut header_bytes).await?;
        let mut chunks = header_bytes.chunks_exact(8);
        let res = Self {
            magic: u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap()),
            entire_len: u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap()),
            header_payload_len: u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap()),
            packet_num: u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap()),
            operation: match AfcOpcode::try_from(u64::from_le_bytes(
                chunks.next().unwrap().try_into().unwrap(),
            )) {
                Ok(o) => o,
                Err(_) => return Err(Error::UnknownAfcOpcode),
            },
        };
        if res.magic != super::MAGIC {
            return Err(Error::InvalidMagic);
        }
        Ok(res)
    }
}

impl AfcPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::new();

        res.extend_from_slice(&self.header.serialize());
        res.extend_from_slice(&self.header_payload);
        res.extend_from_slice(&self.payload);

        res
    }

    pub async fn read(reader: &mut (impl ReadWrite + ?Sized)) -> Result<Self, Error> {
        let header = AfcPacketHeader::read(reader).await?;
        trace!("afc header: {header:?}");

        let header_payload_len = (header.header_payload_len - AfcPacketHeader::LEN) as usize;
        let mut header_payload = vec![0u8; header_payload_len];
        reader.read_exact(&mut header_payload).await?;

        let payload = if header.header_payload_len == header.entire_len {
            Vec::new()
        } else {
            let mut payload = vec![0u8; (header.entire_len - header.header_payload_len) as usize];
            reader.read_exact(&mut payload).await?;
            payload
        };

        let res = Self {
            header,
            header_payload,
            payload,
        };
        trace!("recv afc: {res:?}");
        Ok(res)
    }

    pub async fn write(&self, writer: &mut (impl ReadWrite + ?Sized)) -> Result<(), Error> {
        writer.write_all(&self.serialize()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_then_read(bytes: Vec<u8>) -> Result<AfcPacket, Error> {
        let (mut client, mut server) = tokio::io::duplex(bytes.len().max(64));
        client.write_all(&bytes).await.unwrap();
        drop(client);
        AfcPacket::read(&mut server).await
    }

    #[tokio::test]
    async fn round_trips_a_header_only_packet() {
        let packet = AfcPacket {
            header: AfcPacketHeader {
                magic: MAGIC,
                entire_len: AfcPacketHeader::LEN + 4,
                header_payload_len: AfcPacketHeader::LEN + 4,
                packet_num: 7,
                operation: AfcOpcode::MakeDir,
            },
            header_payload: b"/tmp".to_vec(),
            payload: Vec::new(),
        };

        let bytes = packet.serialize();
        let parsed = write_then_read(bytes).await.unwrap();

        assert_eq!(parsed.header.packet_num, 7);
        assert_eq!(parsed.header.operation, AfcOpcode::MakeDir);
        assert_eq!(parsed.header_payload, b"/tmp");
        assert!(parsed.payload.is_empty());
    }

    #[tokio::test]
    async fn round_trips_a_packet_with_separate_payload() {
        let header_payload = 9u64.to_le_bytes().to_vec();
        let payload = vec![1, 2, 3, 4, 5];
        let header_len = header_payload.len() as u64 + AfcPacketHeader::LEN;
        let packet = AfcPacket {
            header: AfcPacketHeader {
                magic: MAGIC,
                entire_len: header_len + payload.len() as u64,
                header_payload_len: header_len,
                packet_num: 0,
                operation: AfcOpcode::Write,
            },
            header_payload,
            payload,
        };

        let bytes = packet.serialize();
        let parsed = write_then_read(bytes).await.unwrap();
        assert_eq!(parsed.payload, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn rejects_wrong_magic() {
        let mut bytes = AfcPacket {
            header: AfcPacketHeader {
                magic: MAGIC,
                entire_len: AfcPacketHeader::LEN,
                header_payload_len: AfcPacketHeader::LEN,
                packet_num: 0,
                operation: AfcOpcode::GetDevInfo,
            },
            header_payload: Vec::new(),
            payload: Vec::new(),
        }
        .serialize();
        bytes[0] = 0;

        assert!(matches!(
            write_then_read(bytes).await,
            Err(Error::InvalidMagic)
        ));
    }
}
