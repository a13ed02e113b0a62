//! I/O gateway: converts a byte stream into typed messages and back
//! (§4.6). Holds the outgoing-message queue and the partially-received
//! input buffer; knows nothing about sockets directly, only about a
//! [`DataIo`] it owns.

use crate::dataio::DataIo;
use crate::message::{Message, DEFAULT_ENCODING_TAG};
use crate::status::{IoResult, StatusResult};
use std::collections::VecDeque;
use tracing::{debug, error, trace, warn};

const STREAM_HEADER_LEN: usize = 8;

/// Callback invoked once per fully decoded incoming message.
pub trait MessageReceiver {
    fn message_received(&mut self, msg: Message);
}

impl<F: FnMut(Message)> MessageReceiver for F {
    fn message_received(&mut self, msg: Message) {
        self(msg)
    }
}

enum InputState {
    /// Waiting for the 8-byte stream header (stream transports only).
    AwaitingHeader { buf: Vec<u8> },
    /// Waiting for `target_size` total bytes of the flattened message body,
    /// parsed from the stream header rather than recovered from the
    /// buffer's allocated capacity (`Vec::with_capacity(n).capacity()` is
    /// only guaranteed to be at least `n`, not exactly `n`).
    AwaitingBody {
        encoding_tag: u32,
        target_size: usize,
        buf: Vec<u8>,
    },
}

/// Converts bytes ↔ messages over an owned [`DataIo`] (§4.6).
pub struct IoGateway {
    data_io: Box<dyn DataIo + Send>,
    outgoing: VecDeque<Message>,
    /// Buffer for the message currently being written out, so partial
    /// `write()` calls resume correctly.
    outgoing_buf: Vec<u8>,
    outgoing_buf_offset: usize,
    input_state: InputState,
    is_packet_oriented: bool,
    flush_on_empty: bool,
    tag_incoming_with_source: bool,
    encoding_tag: u32,
}

impl IoGateway {
    pub fn new(data_io: Box<dyn DataIo + Send>) -> Self {
        let is_packet_oriented = data_io.max_transfer_unit().is_some();
        IoGateway {
            data_io,
            outgoing: VecDeque::new(),
            outgoing_buf: Vec::new(),
            outgoing_buf_offset: 0,
            input_state: InputState::AwaitingHeader { buf: Vec::new() },
            is_packet_oriented,
            flush_on_empty: false,
            tag_incoming_with_source: false,
            encoding_tag: DEFAULT_ENCODING_TAG,
        }
    }

    pub fn set_flush_on_empty(&mut self, flush_on_empty: bool) {
        self.flush_on_empty = flush_on_empty;
    }

    pub fn set_tag_incoming_with_source(&mut self, enabled: bool) {
        self.tag_incoming_with_source = enabled;
    }

    pub fn data_io(&self) -> &(dyn DataIo + Send) {
        &*self.data_io
    }

    pub fn data_io_mut(&mut self) -> &mut (dyn DataIo + Send) {
        &mut *self.data_io
    }

    /// The maximum packet size this gateway's underlying transport can
    /// carry, for packet-oriented data-I/Os (§4.6).
    pub fn max_packet_size(&self) -> Option<usize> {
        self.data_io.max_transfer_unit()
    }

    pub fn add_outgoing_message(&mut self, msg: Message) {
        self.outgoing.push_back(msg);
    }

    pub fn outgoing_queue_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Whether the gateway currently wants its write-side descriptor
    /// registered (§4.6).
    pub fn has_bytes_to_output(&self) -> bool {
        !self.outgoing.is_empty() || self.outgoing_buf_offset < self.outgoing_buf.len()
    }

    /// Whether the gateway currently wants its read-side descriptor
    /// registered. Defaults to true (§4.6).
    pub fn is_ready_for_input(&self) -> bool {
        true
    }

    fn frame_next_outgoing(&mut self) -> bool {
        let msg = match self.outgoing.pop_front() {
            Some(m) => m,
            None => return false,
        };
        let flattened = msg.flatten();
        if self.is_packet_oriented {
            self.outgoing_buf = flattened;
        } else {
            let mut framed = Vec::with_capacity(STREAM_HEADER_LEN + flattened.len());
            framed.extend_from_slice(&(flattened.len() as u32).to_le_bytes());
            framed.extend_from_slice(&self.encoding_tag.to_le_bytes());
            framed.extend_from_slice(&flattened);
            self.outgoing_buf = framed;
        }
        self.outgoing_buf_offset = 0;
        true
    }

    /// Attempts to write up to `max_bytes` of outgoing data. Returns the
    /// number of bytes actually written plus a status (§4.6).
    pub fn do_output(&mut self, max_bytes: usize) -> IoResult {
        let mut total_written = 0u64;
        let mut remaining_budget = max_bytes;

        loop {
            if self.outgoing_buf_offset >= self.outgoing_buf.len() {
                if !self.frame_next_outgoing() {
                    if self.flush_on_empty && self.outgoing.is_empty() {
                        if let Err(e) = self.data_io.flush() {
                            warn!(?e, "gateway flush-on-empty failed");
                        }
                    }
                    break;
                }
            }
            if remaining_budget == 0 {
                break;
            }
            let slice_end =
                (self.outgoing_buf_offset + remaining_budget).min(self.outgoing_buf.len());
            let slice = &self.outgoing_buf[self.outgoing_buf_offset..slice_end];
            if slice.is_empty() {
                break;
            }
            let result = self.data_io.write(slice);
            if result.is_error() {
                error!(status = ?result.status(), "gateway do_output write failed");
                return IoResult::new(total_written, result.status());
            }
            let n = result.byte_count() as usize;
            self.outgoing_buf_offset += n;
            total_written += n as u64;
            remaining_budget = remaining_budget.saturating_sub(n);
            if n == 0 {
                break;
            }
        }
        trace!(total_written, "gateway do_output");
        IoResult::ok(total_written)
    }

    fn try_decode_packet(&mut self, bytes: &[u8]) -> StatusResult<Message> {
        Message::unflatten(bytes)
    }

    /// Attempts to read up to `max_bytes` of incoming data, invoking
    /// `receiver.message_received` once per fully decoded message
    /// (§4.6).
    pub fn do_input(&mut self, receiver: &mut dyn MessageReceiver, max_bytes: usize) -> IoResult {
        let mut total_read = 0u64;
        let mut remaining_budget = max_bytes;
        let mut chunk = [0u8; 4096];

        if self.is_packet_oriented {
            while remaining_budget > 0 {
                let cap = remaining_budget.min(chunk.len());
                let result = self.data_io.read(&mut chunk[..cap]);
                if result.is_error() {
                    return IoResult::new(total_read, result.status());
                }
                let n = result.byte_count() as usize;
                if n == 0 {
                    break;
                }
                total_read += n as u64;
                remaining_budget = remaining_budget.saturating_sub(n);
                match self.try_decode_packet(&chunk[..n]) {
                    Ok(msg) => receiver.message_received(msg),
                    Err(e) => warn!(?e, "gateway dropped undecodable packet"),
                }
            }
            return IoResult::ok(total_read);
        }

        while remaining_budget > 0 {
            let cap = remaining_budget.min(chunk.len());
            let result = self.data_io.read(&mut chunk[..cap]);
            if result.is_error() {
                return IoResult::new(total_read, result.status());
            }
            let n = result.byte_count() as usize;
            if n == 0 {
                break;
            }
            total_read += n as u64;
            remaining_budget = remaining_budget.saturating_sub(n);
            self.feed_stream_bytes(&chunk[..n], receiver);
        }
        IoResult::ok(total_read)
    }

    fn feed_stream_bytes(&mut self, mut bytes: &[u8], receiver: &mut dyn MessageReceiver) {
        while !bytes.is_empty() {
            match &mut self.input_state {
                InputState::AwaitingHeader { buf } => {
                    let need = STREAM_HEADER_LEN - buf.len();
                    let take = need.min(bytes.len());
                    buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if buf.len() == STREAM_HEADER_LEN {
                        let size = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
                        let encoding_tag = u32::from_le_bytes(buf[4..8].try_into().unwrap());
                        self.input_state = InputState::AwaitingBody {
                            encoding_tag,
                            target_size: size,
                            buf: Vec::with_capacity(size),
                        };
                    }
                }
                InputState::AwaitingBody {
                    buf, target_size, ..
                } => {
                    let target_size = *target_size;
                    let need = target_size.saturating_sub(buf.len());
                    let take = need.min(bytes.len());
                    buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if buf.len() >= target_size {
                        let completed = std::mem::take(buf);
                        self.input_state = InputState::AwaitingHeader { buf: Vec::new() };
                        match Message::unflatten(&completed) {
                            Ok(msg) => {
                                debug!(what = msg.what(), "gateway decoded message");
                                receiver.message_received(msg);
                            }
                            Err(e) => {
                                warn!(?e, "gateway failed to decode framed message");
                            }
                        }
                    }
                }
            }
        }
    }
}
