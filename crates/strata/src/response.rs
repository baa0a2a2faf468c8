//! Query response stream.
//!
//! ```text
//! {"start":0,"end":990,"step":100,"series":[...]}\n      manifest
//! {"series":0,"values":2,"points":10}\n                    chunk descriptor
//! points x i64 LE                                          times
//! values x points x f64 LE                                 one array per column
//! ...                                                      more chunks
//! ```

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::query::QueryBuffer;
use crate::schema::Tags;

/// One output column of a matched series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestColumn {
    /// Column tags.
    pub tags: Tags,
    /// Function evaluated per window.
    pub function: String,
}

/// One matched series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSeries {
    /// Series name.
    pub name: String,
    /// Series tags.
    pub tags: Tags,
    /// Output columns, in chunk order.
    pub columns: Vec<ManifestColumn>,
}

/// Description of every series and column a response carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Range start (inclusive).
    pub start: i64,
    /// Range end (inclusive).
    pub end: i64,
    /// Window length in seconds.
    pub step: i64,
    /// Matched series; chunks refer to them by index.
    pub series: Vec<ManifestSeries>,
}

/// Header line of a binary chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Index into the manifest series.
    pub series: usize,
    /// Number of value arrays.
    pub values: usize,
    /// Number of points per array.
    pub points: usize,
}

/// Writes the manifest line.
pub fn write_manifest<W: Write>(writer: &mut W, manifest: &Manifest) -> Result<()> {
    serde_json::to_writer(&mut *writer, manifest)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Writes one chunk: descriptor line, times, then each value array.
///
/// Ragged buffers are rejected before anything is written.
pub fn write_chunk<W: Write>(writer: &mut W, series: usize, buffer: &QueryBuffer) -> Result<()> {
    if let Some(column) = buffer.values.iter().find(|c| c.len() != buffer.len()) {
        return Err(StrataError::ColumnMismatch {
            expected: buffer.len(),
            actual: column.len(),
        });
    }
    let descriptor = ChunkDescriptor {
        series,
        values: buffer.values.len(),
        points: buffer.len(),
    };
    serde_json::to_writer(&mut *writer, &descriptor)?;
    writer.write_all(b"\n")?;

    let mut bytes = Vec::with_capacity(8 * buffer.len() * (1 + buffer.values.len()));
    for t in &buffer.times {
        bytes.extend_from_slice(&t.to_le_bytes());
    }
    for column in &buffer.values {
        for v in column {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    writer.write_all(&bytes)?;
    Ok(())
}

/// Writes a complete response.
pub fn write_response<W, I>(writer: &mut W, manifest: &Manifest, chunks: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = Result<(usize, QueryBuffer)>>,
{
    write_manifest(writer, manifest)?;
    for chunk in chunks {
        let (series, buffer) = chunk?;
        if !buffer.is_empty() {
            write_chunk(writer, series, &buffer)?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Reads the manifest line.
pub fn read_manifest<R: BufRead>(reader: &mut R) -> Result<Manifest> {
    let line = read_line(reader)?
        .ok_or_else(|| StrataError::Decode("missing response manifest".into()))?;
    Ok(serde_json::from_str(&line)?)
}

/// Reads the next chunk, or `None` at the end of the stream.
pub fn read_chunk<R: BufRead>(reader: &mut R) -> Result<Option<(usize, QueryBuffer)>> {
    let Some(line) = read_line(reader)? else {
        return Ok(None);
    };
    let descriptor: ChunkDescriptor = serde_json::from_str(&line)?;
    let mut word = [0u8; 8];
    let mut buffer = QueryBuffer::new(descriptor.values);
    for _ in 0..descriptor.points {
        reader.read_exact(&mut word)?;
        buffer.times.push(i64::from_le_bytes(word));
    }
    for column in &mut buffer.values {
        for _ in 0..descriptor.points {
            reader.read_exact(&mut word)?;
            column.push(f64::from_le_bytes(word));
        }
    }
    Ok(Some((descriptor.series, buffer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn manifest() -> Manifest {
        let mut tags = Tags::new();
        tags.insert("host".into(), "web1".into());
        Manifest {
            start: 0,
            end: 99,
            step: 10,
            series: vec![ManifestSeries {
                name: "web".into(),
                tags: tags.clone(),
                columns: vec![ManifestColumn {
                    tags,
                    function: "sum".into(),
                }],
            }],
        }
    }

    #[test]
    fn test_chunk_layout() {
        let buffer = QueryBuffer {
            times: vec![0, 10],
            values: vec![vec![1.5, -2.0]],
        };
        let mut out = Vec::new();
        write_chunk(&mut out, 3, &buffer).unwrap();
        let header = b"{\"series\":3,\"values\":1,\"points\":2}\n";
        assert_eq!(&out[..header.len()], header);
        let body = &out[header.len()..];
        assert_eq!(body.len(), 32);
        assert_eq!(&body[8..16], &10i64.to_le_bytes());
        assert_eq!(&body[16..24], &1.5f64.to_le_bytes());
    }

    #[test]
    fn test_response_stream() {
        let chunks = vec![
            Ok((
                0,
                QueryBuffer {
                    times: vec![0, 10],
                    values: vec![vec![1.0, 2.0]],
                },
            )),
            Ok((0, QueryBuffer::new(1))),
            Ok((
                0,
                QueryBuffer {
                    times: vec![20],
                    values: vec![vec![3.0]],
                },
            )),
        ];
        let mut out = Vec::new();
        write_response(&mut out, &manifest(), chunks).unwrap();

        let mut reader = Cursor::new(out);
        assert_eq!(read_manifest(&mut reader).unwrap(), manifest());
        let (series, first) = read_chunk(&mut reader).unwrap().unwrap();
        assert_eq!(series, 0);
        assert_eq!(first.values[0], vec![1.0, 2.0]);
        let (_, second) = read_chunk(&mut reader).unwrap().unwrap();
        assert_eq!(second.times, vec![20]);
        assert!(read_chunk(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_ragged_buffer_rejected() {
        let buffer = QueryBuffer {
            times: vec![0, 10],
            values: vec![vec![1.0]],
        };
        let mut out = Vec::new();
        assert!(matches!(
            write_chunk(&mut out, 0, &buffer),
            Err(StrataError::ColumnMismatch {
                expected: 2,
                actual: 1
            })
        ));
        assert!(out.is_empty());
    }
}
