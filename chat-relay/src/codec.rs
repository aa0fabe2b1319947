//! Newline-delimited JSON framing for stream transports.
//!
//! Each message is one JSON object followed by `\n`. The decoder keeps any
//! incomplete trailing bytes in the read buffer until the rest arrives and
//! yields one `Result` per line, so a malformed line is reported and skipped
//! without ending the stream.

use std::{io, marker::PhantomData};

use bytes::{BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{DecodeError, decode_bytes};

const DELIMITER: u8 = b'\n';

pub struct JsonLinesCodec<T> {
    // Bytes before this index were already scanned for a delimiter.
    next_index: usize,
    _message: PhantomData<fn() -> T>,
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            _message: PhantomData,
        }
    }
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

impl<T> Decoder for JsonLinesCodec<T>
where
    T: DeserializeOwned,
{
    type Item = Result<T, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = buf[self.next_index..]
                .iter()
                .position(|byte| *byte == DELIMITER)
            else {
                self.next_index = buf.len();
                return Ok(None);
            };

            let line = buf.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            let line = trim_line(&line);
            if is_blank(line) {
                continue;
            }
            return Ok(Some(decode_bytes(line)));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }

        // The peer closed mid-line; treat what is left as the final unit.
        self.next_index = 0;
        let rest = buf.split();
        let rest = trim_line(&rest);
        if is_blank(rest) {
            return Ok(None);
        }
        Ok(Some(decode_bytes(rest)))
    }
}

impl<T, M> Encoder<M> for JsonLinesCodec<T>
where
    M: Serialize,
{
    type Error = io::Error;

    fn encode(&mut self, message: M, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = serde_json::to_vec(&message)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        dst.reserve(encoded.len() + 1);
        dst.put_slice(&encoded);
        dst.put_u8(DELIMITER);
        Ok(())
    }
}
