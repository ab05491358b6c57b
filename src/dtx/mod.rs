//! DTX multiplexer: fragmented binary RPC over a single TLS-PSK socket,
//! used by Instruments-family services (process control, location
//! simulation, and friends) once a tunnel is established.
//!
//! Mirrors [`super::afc`]'s shape — a session struct owning the socket plus
//! free functions for the operations, per the flattened-instrument design
//! this multiplexer uses instead of a service class hierarchy: an
//! instrument is a thin [`DtxChannel`] handle, and shared behavior lives
//! here as functions taking `&mut DtxSession`.

pub mod fragmenter;
pub mod message;

use std::collections::{HashMap, HashSet};

use plist::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::{Error, ReadWrite};

pub use fragmenter::DtxMessage;
use fragmenter::Fragmenter;
use message::{AuxValue, MessageHeader, FLAG_EXPECTS_REPLY, FLAG_INSTRUMENTS};

const ROOT_CHANNEL: i32 = 0;

fn handshake_selector() -> std::borrow::Cow<'static, str> {
    crate::obf!("_notifyOfPublishedCapabilities:")
}

fn request_channel_selector() -> std::borrow::Cow<'static, str> {
    crate::obf!("_requestChannelWithCode:identifier:")
}

fn cancel_channel_selector() -> std::borrow::Cow<'static, str> {
    crate::obf!("_channelCanceled:")
}

/// A thin handle to an opened DTX channel. Holds no borrow of the session:
/// per the flattened-instrument design, operations are free functions that
/// take the channel code and a `&mut DtxSession` explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtxChannel {
    pub code: i32,
}

/// One DTX multiplexer session over a socket.
pub struct DtxSession<R: ReadWrite> {
    socket: R,
    next_message_id: u32,
    next_channel_code: i32,
    channel_map: HashMap<String, i32>,
    fragmenter_map: HashMap<i32, Fragmenter>,
    capabilities: HashSet<String>,
    /// Bytes read from the socket but not yet consumed by a frame parse.
    /// Frames are currently always read with exact-sized reads, so this
    /// stays empty; retained because a future pipelined read path (reading
    /// ahead of frame boundaries) would need it, per the handshake-boundary
    /// buffering requirement.
    read_buffer: Vec<u8>,
    handshake_complete: bool,
}

impl<R: ReadWrite> DtxSession<R> {
    pub fn new(socket: R) -> Self {
        let mut fragmenter_map = HashMap::new();
        fragmenter_map.insert(ROOT_CHANNEL, Fragmenter::new());
        Self {
            socket,
            next_message_id: 0,
            next_channel_code: 1,
            channel_map: HashMap::new(),
            fragmenter_map,
            capabilities: HashSet::new(),
            read_buffer: Vec::new(),
            handshake_complete: false,
        }
    }

    pub fn capabilities(&self) -> &HashSet<String> {
        &self.capabilities
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn root_channel(&self) -> DtxChannel {
        DtxChannel { code: ROOT_CHANNEL }
    }

    pub fn into_inner(self) -> R {
        self.socket
    }

    async fn read_frame(&mut self) -> Result<(MessageHeader, Vec<u8>), Error> {
        debug_assert!(self.read_buffer.is_empty());
        let mut header_bytes = [0u8; 32];
        self.socket.read_exact(&mut header_bytes).await?;
        let header = MessageHeader::from_bytes(&header_bytes)?;

        let mut payload = vec![0u8; header.payload_length as usize];
        self.socket.read_exact(&mut payload).await?;

        trace!(
            channel = header.channel_code,
            fragment = header.fragment_id,
            of = header.fragment_count,
            "read DTX frame"
        );

        if header.conversation_index == 0 && header.message_id >= self.next_message_id {
            self.next_message_id = header.message_id + 1;
        }

        Ok((header, payload))
    }

    /// Reads frames off the socket until one completes a message on
    /// `channel`, buffering frames for other channels in their own
    /// fragmenters along the way.
    async fn recv_on(&mut self, channel: i32) -> Result<DtxMessage, Error> {
        if !self.fragmenter_map.contains_key(&channel) {
            return Err(Error::UnknownChannel(channel));
        }

        loop {
            if let Some(msg) = self
                .fragmenter_map
                .get_mut(&channel)
                .and_then(|f| f.queue.pop_front())
            {
                return Ok(msg);
            }

            let (header, payload) = self.read_frame().await?;
            let key = header.channel_code.unsigned_abs() as i32;
            self.fragmenter_map
                .entry(key)
                .or_insert_with(Fragmenter::new)
                .feed(header, payload)?;

            if key != channel {
                warn!(channel = key, "buffered DTX frame for another channel");
            }
        }
    }

    /// Serializes and sends one (single-fragment) DTX message.
    async fn send_message(
        &mut self,
        channel: i32,
        selector: &str,
        aux: Vec<AuxValue>,
        expects_reply: bool,
    ) -> Result<(), Error> {
        let object_bytes =
            ns_keyed_archive::encode::encode_to_bytes(Value::String(selector.to_string()))?;
        let aux_bytes = if aux.is_empty() {
            Vec::new()
        } else {
            message::encode_aux(&aux)
        };

        let payload_header = message::PayloadHeader {
            flags: FLAG_INSTRUMENTS | if expects_reply { FLAG_EXPECTS_REPLY } else { 0 },
            aux_length: aux_bytes.len() as u32,
            total_length: (aux_bytes.len() + object_bytes.len()) as u64,
        };

        let mut payload = Vec::with_capacity(16 + aux_bytes.len() + object_bytes.len());
        payload.extend_from_slice(&payload_header.to_bytes());
        payload.extend_from_slice(&aux_bytes);
        payload.extend_from_slice(&object_bytes);

        let message_id = self.next_message_id;
        self.next_message_id += 1;

        let header = MessageHeader {
            fragment_id: 0,
            fragment_count: 1,
            payload_length: payload.len() as u32,
            message_id,
            conversation_index: 0,
            channel_code: channel,
            expects_reply,
        };

        debug!(channel, selector, "sending DTX message");
        self.socket.write_all(&header.to_bytes()).await?;
        self.socket.write_all(&payload).await?;
        self.socket.flush().await?;
        Ok(())
    }
}

/// Performs the `_notifyOfPublishedCapabilities:` handshake on channel 0,
/// populating [`DtxSession::capabilities`].
pub async fn handshake<R: ReadWrite>(session: &mut DtxSession<R>) -> Result<(), Error> {
    let mut request = plist::Dictionary::new();
    request.insert(
        "com.apple.private.DTXBlockCompression".into(),
        Value::Integer(0i64.into()),
    );
    request.insert(
        "com.apple.private.DTXConnection".into(),
        Value::Integer(1i64.into()),
    );

    let aux = vec![AuxValue::archived(Value::Dictionary(request))?];
    session
        .send_message(ROOT_CHANNEL, handshake_selector().as_ref(), aux, true)
        .await?;

    let reply = session.recv_on(ROOT_CHANNEL).await?;
    let capabilities = reply
        .aux
        .first()
        .ok_or(Error::UnexpectedResponse)?
        .unarchive()?;

    let Value::Dictionary(dict) = capabilities else {
        return Err(Error::UnexpectedResponse);
    };
    session.capabilities = dict.keys().cloned().collect();
    session.handshake_complete = true;

    debug!(capabilities = ?session.capabilities, "DTX handshake complete");
    Ok(())
}

/// Opens a new channel with the device-facing `identifier`, returning a
/// handle once the device has acknowledged it.
pub async fn open_channel<R: ReadWrite>(
    session: &mut DtxSession<R>,
    identifier: &str,
) -> Result<DtxChannel, Error> {
    if !session.handshake_complete {
        return Err(Error::DtxHandshakeIncomplete);
    }

    let code = session.next_channel_code;
    session.next_channel_code += 1;

    let aux = vec![
        AuxValue::Int32(code),
        AuxValue::archived(Value::String(identifier.to_string()))?,
    ];
    session
        .send_message(ROOT_CHANNEL, request_channel_selector().as_ref(), aux, true)
        .await?;

    let reply = session.recv_on(ROOT_CHANNEL).await?;
    if reply.object.as_ref().is_some_and(is_nserror) {
        return Err(Error::ChannelCreationFailed);
    }

    session.channel_map.insert(identifier.to_string(), code);
    session.fragmenter_map.insert(code, Fragmenter::new());

    Ok(DtxChannel { code })
}

/// Whether a decoded NSKeyedArchiver object looks like an archived
/// `NSError`: Foundation encodes one via `NSCode`/`NSDomain`/`NSUserInfo`
/// keys in `-[NSError encodeWithCoder:]`, which survive intact in the
/// resolved archive tree.
fn is_nserror(object: &Value) -> bool {
    match object {
        Value::Dictionary(dict) => dict.get("NSDomain").is_some() && dict.get("NSCode").is_some(),
        _ => false,
    }
}

/// Sends `selector`/`aux` on `channel` and, if `expects_reply`, waits for
/// and returns the device's reply.
pub async fn send_message<R: ReadWrite>(
    session: &mut DtxSession<R>,
    channel: DtxChannel,
    selector: &str,
    aux: Vec<AuxValue>,
    expects_reply: bool,
) -> Result<Option<DtxMessage>, Error> {
    session
        .send_message(channel.code, selector, aux, expects_reply)
        .await?;
    if expects_reply {
        Ok(Some(session.recv_on(channel.code).await?))
    } else {
        Ok(None)
    }
}

/// Reads the next message addressed to `channel`, blocking on the socket
/// until one arrives.
pub async fn recv_message<R: ReadWrite>(
    session: &mut DtxSession<R>,
    channel: DtxChannel,
) -> Result<DtxMessage, Error> {
    session.recv_on(channel.code).await
}

/// Closes `channel`: notifies the device via `_channelCanceled:` and
/// discards local channel state.
pub async fn close_channel<R: ReadWrite>(
    session: &mut DtxSession<R>,
    channel: DtxChannel,
) -> Result<(), Error> {
    session
        .send_message(
            ROOT_CHANNEL,
            cancel_channel_selector().as_ref(),
            vec![AuxValue::Int32(channel.code)],
            false,
        )
        .await?;

    session.fragmenter_map.remove(&channel.code);
    session.channel_map.retain(|_, code| *code != channel.code);
    Ok(())
}

impl<R: ReadWrite> std::fmt::Debug for DtxSession<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtxSession")
            .field("next_message_id", &self.next_message_id)
            .field("next_channel_code", &self.next_channel_code)
            .field("capabilities", &self.capabilities)
            .field("handshake_complete", &self.handshake_complete)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message::PayloadHeader;

    fn single_fragment_frame(header: MessageHeader, payload: &[u8]) -> Vec<u8> {
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn reply_with_dict_aux(channel: i32, message_id: u32, dict: plist::Dictionary) -> Vec<u8> {
        let aux_bytes = message::encode_aux(&[AuxValue::archived(Value::Dictionary(dict)).unwrap()]);
        let payload_header = PayloadHeader {
            flags: FLAG_INSTRUMENTS,
            aux_length: aux_bytes.len() as u32,
            total_length: aux_bytes.len() as u64,
        };
        let mut payload = payload_header.to_bytes().to_vec();
        payload.extend_from_slice(&aux_bytes);

        let header = MessageHeader {
            fragment_id: 0,
            fragment_count: 1,
            payload_length: payload.len() as u32,
            message_id,
            conversation_index: 1,
            channel_code: channel,
            expects_reply: false,
        };
        single_fragment_frame(header, &payload)
    }

    #[tokio::test]
    async fn handshake_populates_capabilities() {
        let (client, mut server) = tokio::io::duplex(8192);
        let mut session = DtxSession::new(client);

        let mut dict = plist::Dictionary::new();
        dict.insert("A".into(), Value::Boolean(true));
        dict.insert("B".into(), Value::Boolean(true));
        dict.insert("C".into(), Value::Boolean(true));
        let frame = reply_with_dict_aux(ROOT_CHANNEL, 0, dict);

        let server_task = tokio::spawn(async move {
            // Drain the handshake request header + payload.
            let mut header = [0u8; 32];
            server.read_exact(&mut header).await.unwrap();
            let len = MessageHeader::from_bytes(&header).unwrap().payload_length as usize;
            let mut payload = vec![0u8; len];
            server.read_exact(&mut payload).await.unwrap();

            server.write_all(&frame).await.unwrap();
            server
        });

        handshake(&mut session).await.unwrap();
        assert!(session.handshake_complete());
        assert_eq!(
            session.capabilities(),
            &["A".to_string(), "B".to_string(), "C".to_string()]
                .into_iter()
                .collect::<HashSet<_>>()
        );

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn recv_on_buffers_frames_for_other_channels() {
        let (client, mut server) = tokio::io::duplex(8192);
        let mut session = DtxSession::new(client);
        session
            .fragmenter_map
            .insert(1, Fragmenter::new());

        let other_channel_frame = reply_with_dict_aux(2, 0, plist::Dictionary::new());
        let target_frame = reply_with_dict_aux(1, 1, plist::Dictionary::new());

        server.write_all(&other_channel_frame).await.unwrap();
        server.write_all(&target_frame).await.unwrap();

        let msg = session.recv_on(1).await.unwrap();
        assert_eq!(msg.channel_code, 1);
    }

    #[tokio::test]
    async fn recv_on_rejects_an_unknown_channel() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut session = DtxSession::new(client);
        assert!(matches!(
            session.recv_on(99).await,
            Err(Error::UnknownChannel(99))
        ));
    }

    async fn drain_request(server: &mut tokio::io::DuplexStream) {
        let mut header = [0u8; 32];
        server.read_exact(&mut header).await.unwrap();
        let len = MessageHeader::from_bytes(&header).unwrap().payload_length as usize;
        let mut payload = vec![0u8; len];
        server.read_exact(&mut payload).await.unwrap();
    }

    #[tokio::test]
    async fn open_channel_accepts_a_benign_reply_object() {
        let (client, mut server) = tokio::io::duplex(8192);
        let mut session = DtxSession::new(client);
        session.handshake_complete = true;

        let mut dict = plist::Dictionary::new();
        dict.insert("ok".into(), Value::Boolean(true));
        let frame = reply_with_dict_aux(ROOT_CHANNEL, 0, dict);

        let server_task = tokio::spawn(async move {
            drain_request(&mut server).await;
            server.write_all(&frame).await.unwrap();
            server
        });

        let channel = open_channel(&mut session, "com.apple.test").await.unwrap();
        assert_eq!(channel.code, 1);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn open_channel_rejects_an_nserror_shaped_reply() {
        let (client, mut server) = tokio::io::duplex(8192);
        let mut session = DtxSession::new(client);
        session.handshake_complete = true;

        let mut dict = plist::Dictionary::new();
        dict.insert("NSDomain".into(), Value::String("NSCocoaErrorDomain".into()));
        dict.insert("NSCode".into(), Value::Integer(1i64.into()));
        let frame = reply_with_dict_aux(ROOT_CHANNEL, 0, dict);

        let server_task = tokio::spawn(async move {
            drain_request(&mut server).await;
            server.write_all(&frame).await.unwrap();
            server
        });

        assert!(matches!(
            open_channel(&mut session, "com.apple.test").await,
            Err(Error::ChannelCreationFailed)
        ));
        server_task.await.unwrap();
    }
}
