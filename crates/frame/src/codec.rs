//! Arrow-IPC byte codec for partition streams.
//!
//! Partition files and the bytes served by the worker read RPC are
//! Arrow IPC stream format. Decoding is incremental: the streaming
//! decoder accepts bytes as they arrive, so a read resumed at a byte
//! offset after a transport failure continues decoding mid-stream.

use std::io::Write;

use arrow::buffer::Buffer;
use arrow::ipc::reader::{StreamDecoder, StreamReader};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use furrow_common::{Error, Result};

/// Encodes record batches to an IPC stream over an inner writer.
pub struct Encoder<W: Write> {
    writer: StreamWriter<W>,
}

impl<W: Write> Encoder<W> {
    /// Create an encoder for batches of `schema` written to `inner`.
    pub fn new(inner: W, schema: &SchemaRef) -> Result<Self> {
        let writer = StreamWriter::try_new(inner, schema.as_ref())
            .map_err(|e| Error::Fatal(format!("ipc writer init failed: {e}")))?;
        Ok(Self { writer })
    }

    /// Append one batch to the stream.
    pub fn encode(&mut self, batch: &RecordBatch) -> Result<()> {
        self.writer
            .write(batch)
            .map_err(|e| Error::Fatal(format!("ipc write failed: {e}")))
    }

    /// Terminate the stream and return the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.writer
            .finish()
            .map_err(|e| Error::Fatal(format!("ipc finish failed: {e}")))?;
        self.writer
            .into_inner()
            .map_err(|e| Error::Fatal(format!("ipc writer teardown failed: {e}")))
    }
}

/// Encode batches into one self-contained IPC byte buffer.
pub fn encode_batches(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let mut enc = Encoder::new(Vec::new(), schema)?;
    for batch in batches {
        enc.encode(batch)?;
    }
    enc.finish()
}

/// Decode a complete IPC byte buffer into batches.
pub fn decode_batches(bytes: &[u8]) -> Result<Vec<RecordBatch>> {
    let reader = StreamReader::try_new(std::io::Cursor::new(bytes), None)
        .map_err(|e| Error::Fatal(format!("ipc reader init failed: {e}")))?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Fatal(format!("ipc read failed: {e}")))
}

/// Incremental IPC stream decoder fed by transport chunks.
pub struct Decoder {
    inner: StreamDecoder,
}

impl Decoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self {
            inner: StreamDecoder::new(),
        }
    }

    /// Feed one chunk of stream bytes, returning any batches completed
    /// by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<RecordBatch>> {
        let mut buffer = Buffer::from(chunk.to_vec());
        let mut out = Vec::new();
        while let Some(batch) = self
            .inner
            .decode(&mut buffer)
            .map_err(|e| Error::Fatal(format!("ipc stream decode failed: {e}")))?
        {
            out.push(batch);
        }
        Ok(out)
    }

    /// Assert the stream ended on a message boundary.
    pub fn finish(mut self) -> Result<()> {
        self.inner
            .finish()
            .map_err(|e| Error::Fatal(format!("truncated ipc stream: {e}")))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};

    use super::{decode_batches, encode_batches, Decoder};

    fn int_batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    #[test]
    fn encode_decode_batches() {
        let batches = vec![int_batch(vec![1, 2, 3]), int_batch(vec![4, 5])];
        let bytes = encode_batches(&batches[0].schema(), &batches).unwrap();
        let decoded = decode_batches(&bytes).unwrap();
        assert_eq!(decoded, batches);
    }

    #[test]
    fn incremental_decoder_handles_tiny_chunks() {
        let batches = vec![int_batch((0..100).collect()), int_batch((100..150).collect())];
        let bytes = encode_batches(&batches[0].schema(), &batches).unwrap();

        let mut decoder = Decoder::new();
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(7) {
            decoded.extend(decoder.feed(chunk).unwrap());
        }
        decoder.finish().unwrap();
        assert_eq!(decoded, batches);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let batches = vec![int_batch(vec![1, 2, 3])];
        let bytes = encode_batches(&batches[0].schema(), &batches).unwrap();
        let mut decoder = Decoder::new();
        decoder.feed(&bytes[..bytes.len() / 2]).unwrap();
        assert!(decoder.finish().is_err());
    }
}
