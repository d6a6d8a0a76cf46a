//! Reliable, ordered delivery of a bounded stream of numbered datagrams over a lossy path,
//!  based on negative acknowledgement (NACK) rather than positive ACKs.
//!
//! ## Design goals
//!
//! * A *sender* emits packets `1..=n` at a fixed cadence to one or more destinations. Sending is
//!   purely time driven: there is no send window, no flow control and no congestion control.
//! * Every emitted packet is retained in a packet cache for the lifetime of the session, so it
//!   can be re-sent verbatim (same sequence number, *original* timestamp) on request.
//! * A *receiver* delivers packets to the application strictly in order, without gaps and
//!   without duplicates, regardless of reordering, duplication or loss on the wire.
//!   * out-of-order arrivals are buffered until the gap before them is filled
//!   * each newly detected gap is NACK'ed once, and re-NACK'ed periodically while it persists
//!   * once all `n` packets are delivered, the receiver sends a completion signal (`FIN`)
//! * The sender terminates when all expected receivers signalled completion, or when its
//!   session timeout expires - whichever comes first.
//! * Control traffic (`NACK`, `FIN`) is assumed to travel reliably; only the data path is lossy.
//!
//! ## Wire format
//!
//! All messages are UTF-8 text in a single UDP datagram:
//!
//! ```ascii
//! SEQ:<seq>|<timestamp>   data packet, <seq> >= 1, <timestamp> is RFC 3339 with nanoseconds
//! NACK:<seq>              receiver -> sender: please re-send <seq>
//! FIN                     receiver -> sender: all packets were delivered (whitespace trimmed)
//! ```
//!
//! Anything else is treated as a legacy / unstructured payload: it is logged and never affects
//!  protocol state.
//!
//! ## Tasks
//!
//! ```ascii
//!  sender:    emission loop  --+-- data -->  [relay]  -- data -->  receive loop    :receiver
//!             control listener <-- NACK/FIN -- [relay] <-- NACK/FIN -- retry ticker
//!             retransmit dispatcher (bounded queue)                   statistics ticker
//! ```
//!
//! The relay is not part of the protocol - it simulates a lossy, delaying network path for
//!  demonstration and testing.

pub mod seq_nr;
pub mod wire;
pub mod config;
pub mod send_socket;
pub mod packet_cache;
pub mod retransmit;
pub mod completion;
pub mod sender;
pub mod reorder_buffer;
pub mod stats;
pub mod receiver;
pub mod relay;
pub mod session;
