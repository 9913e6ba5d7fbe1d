//! Columnar frame plumbing for furrow.
//!
//! Architecture role:
//! - [`reader`]: the pull-based [`BatchReader`] contract operators and
//!   the worker exchange batches through, plus multi/error/counting
//!   adapters
//! - [`value`]: the dynamic row value model used wherever rows are
//!   routed or combined individually
//! - [`hash`]: key hashing and shuffle partition routing
//! - [`codec`]: the Arrow-IPC byte codec for partition streams,
//!   including the incremental decoder used by resumable remote reads
//!
//! Frames are Arrow [`arrow::record_batch::RecordBatch`]es throughout.

pub mod codec;
pub mod hash;
pub mod reader;
pub mod value;

pub use codec::{decode_batches, encode_batches, Decoder, Encoder};
pub use hash::{concat, hash_key, partition_batch, row_hashes};
pub use reader::{read_all, BatchReader, BatchesReader, CountingReader, ErrorReader, MultiReader};
pub use value::{rows_from_batch, rows_to_batch, value_at, Value};
