use std::fmt::{Debug, Formatter};
use anyhow::{anyhow, bail, Context};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use crate::seq_nr::SeqNr;

const DATA_PREFIX: &str = "SEQ:";
const DATA_DELIMITER: char = '|';
const NACK_PREFIX: &str = "NACK:";
const FIN: &str = "FIN";

/// receive buffer size - all messages of the protocol are far shorter
pub const MAX_DATAGRAM_LEN: usize = 2048;

/// A data packet as it travels on the wire. The encoded representation is kept alongside the
///  parsed fields so that a retransmission is byte-for-byte identical to the original send.
#[derive(Clone, Eq, PartialEq)]
pub struct DataPacket {
    pub seq: SeqNr,
    pub sent_at: DateTime<Utc>,
    encoded: Bytes,
}
impl Debug for DataPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataPacket{{#{} @{}}}", self.seq, self.sent_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

impl DataPacket {
    pub fn new(seq: SeqNr, sent_at: DateTime<Utc>) -> DataPacket {
        let mut buf = BytesMut::new();
        buf.put_slice(DATA_PREFIX.as_bytes());
        buf.put_slice(seq.to_raw().to_string().as_bytes());
        buf.put_u8(DATA_DELIMITER as u8);
        buf.put_slice(sent_at.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());

        DataPacket {
            seq,
            sent_at,
            encoded: buf.freeze(),
        }
    }

    pub fn encoded(&self) -> &[u8] {
        self.encoded.as_ref()
    }
}

/// Strongly typed representation of everything that can arrive in a datagram. Parsing happens
///  immediately at the socket boundary, nothing beyond that deals with raw text.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WireMessage {
    Data(DataPacket),
    Nack(SeqNr),
    Fin,
    /// anything without a recognized prefix - logged, but never affects protocol state
    Legacy(String),
}

impl WireMessage {
    pub fn parse(buf: &[u8]) -> anyhow::Result<WireMessage> {
        let text = std::str::from_utf8(buf)
            .context("message is not valid UTF-8")?;

        if text.trim() == FIN {
            return Ok(WireMessage::Fin);
        }

        if let Some(raw_seq) = text.strip_prefix(NACK_PREFIX) {
            return Ok(WireMessage::Nack(Self::parse_seq_nr(raw_seq.trim())?));
        }

        if let Some(rest) = text.strip_prefix(DATA_PREFIX) {
            let (raw_seq, raw_timestamp) = rest.split_once(DATA_DELIMITER)
                .ok_or_else(|| anyhow!("data packet without '{}' delimiter", DATA_DELIMITER))?;

            let seq = Self::parse_seq_nr(raw_seq)?;
            let sent_at = DateTime::parse_from_rfc3339(raw_timestamp)
                .with_context(|| format!("unparsable timestamp {:?}", raw_timestamp))?
                .with_timezone(&Utc);

            return Ok(WireMessage::Data(DataPacket {
                seq,
                sent_at,
                encoded: Bytes::copy_from_slice(buf),
            }));
        }

        Ok(WireMessage::Legacy(text.to_string()))
    }

    fn parse_seq_nr(raw: &str) -> anyhow::Result<SeqNr> {
        let raw: u64 = match raw.parse() {
            Ok(n) => n,
            Err(e) => bail!("unparsable sequence number {:?}: {}", raw, e),
        };
        SeqNr::new(raw)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            WireMessage::Data(packet) => buf.put_slice(packet.encoded()),
            WireMessage::Nack(seq) => {
                buf.put_slice(NACK_PREFIX.as_bytes());
                buf.put_slice(seq.to_raw().to_string().as_bytes());
            }
            WireMessage::Fin => buf.put_slice(FIN.as_bytes()),
            WireMessage::Legacy(text) => buf.put_slice(text.as_bytes()),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    /// control messages travel receiver -> sender and are exempt from simulated loss
    pub fn is_control(&self) -> bool {
        matches!(self, WireMessage::Nack(_) | WireMessage::Fin)
    }
}
