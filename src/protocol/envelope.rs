use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::Crc;
use uuid::Uuid;

use crate::protocol::msg_type::MsgType;

/// user id the server uses when it is itself the sender or recipient of a message
pub const SERVER_USER_ID: &str = "0";

const FLAG_QOS: u8 = 0x01;
const FLAG_FINGERPRINT: u8 = 0x02;

/// The protocol's message unit. An envelope flagged as QoS carries a fingerprint that is unique
///  while the message is tracked for delivery assurance; the fingerprint is the key under which
///  acks and loss reports refer to the message.
///
/// Envelopes are value snapshots: cloning one (e.g. into a loss batch) detaches it from any
///  further mutation of the tracked instance.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Envelope {
    pub msg_type: MsgType,
    pub from: String,
    pub to: String,
    pub fingerprint: Option<String>,
    pub qos: bool,
    pub retry_count: u32,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(msg_type: MsgType, from: impl Into<String>, to: impl Into<String>, payload: Bytes, qos: bool) -> Envelope {
        Envelope {
            msg_type,
            from: from.into(),
            to: to.into(),
            fingerprint: qos.then(Self::gen_fingerprint),
            qos,
            retry_count: 0,
            payload,
        }
    }

    /// Build the explicit application-level ack for a received QoS message, addressed back to
    ///  its sender with the acked fingerprint as payload. `None` if the message carries no
    ///  fingerprint - there is nothing to ack then.
    pub fn ack_for(received: &Envelope) -> Option<Envelope> {
        let fingerprint = received.fingerprint.as_ref()?;
        Some(Envelope::new(
            MsgType::Received,
            received.to.clone(),
            received.from.clone(),
            Bytes::copy_from_slice(fingerprint.as_bytes()),
            false,
        ))
    }

    fn gen_fingerprint() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn increase_retry_count(&mut self) {
        self.retry_count += 1;
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(64 + self.payload.len());

        body.put_u8(self.msg_type.into());

        let mut flags = 0u8;
        if self.qos {
            flags |= FLAG_QOS;
        }
        if self.fingerprint.is_some() {
            flags |= FLAG_FINGERPRINT;
        }
        body.put_u8(flags);

        put_str(&mut body, &self.from);
        put_str(&mut body, &self.to);
        if let Some(fingerprint) = &self.fingerprint {
            put_str(&mut body, fingerprint);
        }
        body.put_u32_varint(self.retry_count);
        body.put_slice(&self.payload);

        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        buf.put_u64(hasher.checksum(&body));
        buf.extend_from_slice(&body);
    }

    pub fn try_deser(buf: &mut &[u8]) -> anyhow::Result<Envelope> {
        let checksum = buf.try_get_u64()?;

        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        if hasher.checksum(buf) != checksum {
            bail!("envelope checksum mismatch");
        }

        let msg_type_raw = buf.try_get_u8()?;
        let msg_type = MsgType::try_from(msg_type_raw)
            .map_err(|_| anyhow!("unknown message type: {}", msg_type_raw))?;

        let flags = buf.try_get_u8()?;

        let from = try_get_str(buf)?;
        let to = try_get_str(buf)?;

        let fingerprint = if flags & FLAG_FINGERPRINT != 0 {
            Some(try_get_str(buf)?)
        }
        else {
            None
        };

        let retry_count = buf.try_get_u32_varint()?;

        let payload = Bytes::copy_from_slice(buf);
        buf.advance(buf.remaining());

        Ok(Envelope {
            msg_type,
            from,
            to,
            fingerprint,
            qos: flags & FLAG_QOS != 0,
            retry_count,
            payload,
        })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

fn try_get_str(buf: &mut &[u8]) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("string is longer than the remaining buffer: {} > {}", len, buf.remaining());
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(String::from_utf8(raw)?)
}
