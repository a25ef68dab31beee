//! Flat binary dataset files.
//!
//! Points are stored row-major as little-endian elements after a header
//! `[cols: u32][rows: u32][type tag: u8]`. Writes go through buffered file
//! I/O; whole-file reads use a read-only memory map.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::dataset::Dataset;
use crate::element::Element;
use crate::error::{AnnError, Result};

const HEADER_SIZE: usize = 9;

/// Shape and element type recorded in a dataset file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetHeader {
    pub cols: usize,
    pub rows: usize,
    pub type_tag: u8,
}

impl DatasetHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&(self.cols as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&(self.rows as u32).to_le_bytes());
        buf[8] = self.type_tag;
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            cols: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize,
            rows: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize,
            type_tag: buf[8],
        }
    }
}

/// Read just the header of a dataset file.
pub fn read_header(path: impl AsRef<Path>) -> Result<DatasetHeader> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut buf)
        .map_err(|_| AnnError::DatasetMismatch("File too small for header".to_string()))?;
    Ok(DatasetHeader::decode(&buf))
}

/// Append-only writer for a dataset file of fixed dimensionality.
pub struct DatasetFile<T: Element> {
    path: PathBuf,
    cols: usize,
    rows: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> DatasetFile<T> {
    /// Create (or truncate) a file for `cols`-dimensional points.
    pub fn create(path: impl AsRef<Path>, cols: usize) -> Result<Self> {
        if cols == 0 || u32::try_from(cols).is_err() {
            return Err(AnnError::invalid(format!("Unsupported dimensionality {}", cols)));
        }
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let header = DatasetHeader {
            cols,
            rows: 0,
            type_tag: T::TYPE_TAG,
        };
        file.write_all(&header.encode())?;
        file.sync_all()?;
        Ok(Self {
            path,
            cols,
            rows: 0,
            _marker: PhantomData,
        })
    }

    /// Open an existing file for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let header = read_header(&path)?;
        check_tag::<T>(&header)?;
        Ok(Self {
            path,
            cols: header.cols,
            rows: header.rows,
            _marker: PhantomData,
        })
    }

    /// Append row-major points; returns the number of rows written.
    pub fn append(&mut self, points: &[T]) -> Result<usize> {
        if points.len() % self.cols != 0 {
            return Err(AnnError::DimensionMismatch {
                expected: self.cols,
                actual: points.len() % self.cols,
            });
        }
        let added = points.len() / self.cols;
        let rows = u32::try_from(self.rows + added)
            .map_err(|_| AnnError::invalid("Dataset file cannot hold more than u32::MAX rows"))?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let row_bytes = self.cols * (T::BITS as usize / 8);
        file.seek(SeekFrom::Start((HEADER_SIZE + self.rows * row_bytes) as u64))?;
        {
            let mut writer = BufWriter::new(&mut file);
            let mut buf = Vec::with_capacity(row_bytes);
            for row in points.chunks(self.cols) {
                buf.clear();
                for &v in row {
                    v.write_le(&mut buf);
                }
                writer.write_all(&buf)?;
            }
            writer.flush()?;
        }

        self.rows = rows as usize;
        let header = DatasetHeader {
            cols: self.cols,
            rows: self.rows,
            type_tag: T::TYPE_TAG,
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_all()?;
        Ok(added)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dimension(&self) -> usize {
        self.cols
    }
}

/// Write every row of `dataset` (tombstoned rows included) to `path`.
pub fn write_dataset<T: Element>(path: impl AsRef<Path>, dataset: &Dataset<T>) -> Result<()> {
    let mut file = DatasetFile::<T>::create(path, dataset.dimension())?;
    file.append(dataset.as_flat())?;
    Ok(())
}

/// Load a whole dataset file through a read-only memory map.
pub fn read_dataset<T: Element>(path: impl AsRef<Path>) -> Result<Dataset<T>> {
    let file = File::open(path.as_ref())?;
    // SAFETY: the map is read-only and dropped before returning; the data is
    // copied out immediately.
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    if mmap.len() < HEADER_SIZE {
        return Err(AnnError::DatasetMismatch("File too small for header".to_string()));
    }
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&mmap[..HEADER_SIZE]);
    let header = DatasetHeader::decode(&raw);
    check_tag::<T>(&header)?;

    let width = T::BITS as usize / 8;
    let expected = HEADER_SIZE + header.rows * header.cols * width;
    if mmap.len() != expected {
        return Err(AnnError::DatasetMismatch(format!(
            "Header describes {} x {} points but the file holds {} bytes",
            header.rows,
            header.cols,
            mmap.len()
        )));
    }
    let data: Vec<T> = mmap[HEADER_SIZE..].chunks_exact(width).map(T::read_le).collect();
    Dataset::from_flat(header.cols, data)
}

fn check_tag<T: Element>(header: &DatasetHeader) -> Result<()> {
    if header.type_tag != T::TYPE_TAG {
        return Err(AnnError::DatasetMismatch(format!(
            "File holds element type tag {}, expected {} ({})",
            header.type_tag,
            T::TYPE_TAG,
            T::NAME
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_append_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("points.bin");

        let mut file = DatasetFile::<f32>::create(&path, 3).unwrap();
        assert_eq!(file.append(&[1.0, 2.0, 3.0]).unwrap(), 1);
        assert_eq!(file.append(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]).unwrap(), 2);
        assert_eq!(file.rows(), 3);

        let ds = read_dataset::<f32>(&path).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.get(1).unwrap(), &[4.0, 5.0, 6.0]);
        assert_eq!(
            read_header(&path).unwrap(),
            DatasetHeader {
                cols: 3,
                rows: 3,
                type_tag: 1
            }
        );
    }

    #[test]
    fn test_reopen_and_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("points.bin");
        {
            let mut file = DatasetFile::<i16>::create(&path, 2).unwrap();
            file.append(&[-1, 2]).unwrap();
        }
        let mut file = DatasetFile::<i16>::open(&path).unwrap();
        assert_eq!(file.dimension(), 2);
        file.append(&[300, -400]).unwrap();
        let ds = read_dataset::<i16>(&path).unwrap();
        assert_eq!(ds.as_flat(), &[-1, 2, 300, -400]);
    }

    #[test]
    fn test_dimension_mismatch_on_append() {
        let dir = TempDir::new().unwrap();
        let mut file = DatasetFile::<u8>::create(dir.path().join("p.bin"), 3).unwrap();
        assert!(matches!(
            file.append(&[1, 2]),
            Err(AnnError::DimensionMismatch { expected: 3, .. })
        ));
    }

    #[test]
    fn test_wrong_element_type() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.bin");
        let ds = Dataset::from_flat(2, vec![1u8, 2, 3, 4]).unwrap();
        write_dataset(&path, &ds).unwrap();
        assert!(matches!(read_dataset::<f32>(&path), Err(AnnError::DatasetMismatch(_))));
        assert_eq!(read_dataset::<u8>(&path).unwrap().as_flat(), ds.as_flat());
    }

    #[test]
    fn test_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.bin");
        write_dataset(&path, &Dataset::from_flat(2, vec![1.0f64, 2.0, 3.0, 4.0]).unwrap()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(read_dataset::<f64>(&path), Err(AnnError::DatasetMismatch(_))));
    }
}
