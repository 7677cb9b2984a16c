//! zstd-compressed CSV encoding for window batches

use anyhow::{Context, Result};
use csv::{Reader, Writer};
use serde::Serialize;
use serde::de::DeserializeOwned;
use zstd::stream::read::Decoder as ZstdDecoder;
use zstd::stream::write::Encoder as ZstdEncoder;

const COMPRESSION_LEVEL: i32 = 3;

/// Serialize rows to CSV (with header) and compress with zstd
///
/// Output is a pure function of the input rows, so re-encoding an unchanged
/// batch yields identical bytes.
pub fn encode_rows<T: Serialize>(rows: &[T]) -> Result<Vec<u8>> {
    let zstd_encoder = ZstdEncoder::new(Vec::new(), COMPRESSION_LEVEL)
        .context("Failed to create zstd encoder")?;
    let mut csv_writer = Writer::from_writer(zstd_encoder);

    for row in rows {
        csv_writer
            .serialize(row)
            .context("Failed to serialize row to CSV")?;
    }
    csv_writer.flush()?;

    let zstd_encoder = csv_writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to get zstd encoder from CSV writer: {}", e))?;
    zstd_encoder
        .finish()
        .context("Failed to finish zstd compression")
}

/// Decompress and parse a batch written by [`encode_rows`]
pub fn decode_rows<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>> {
    let decoder = ZstdDecoder::new(bytes).context("Failed to create zstd decoder")?;
    let mut csv_reader = Reader::from_reader(decoder);

    csv_reader
        .deserialize()
        .enumerate()
        .map(|(index, row)| row.with_context(|| format!("Failed to parse CSV row {}", index + 1)))
        .collect()
}
