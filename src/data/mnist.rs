use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ReadBytesExt};
use log::info;

use crate::{
    data::{Dataset, Sample, Split, Transform},
    error::{Error, Result},
    tensor::Shape,
};

#[derive(Clone, Copy, Debug, PartialEq)]
enum DataType {
    UnsignedByte,
    SignedByte,
    Short,
    Int,
    Float,
    Double,
    Unknown,
}

impl From<u32> for DataType {
    fn from(v: u32) -> Self {
        match (v >> 8) & 0xFF {
            0x08 => Self::UnsignedByte,
            0x09 => Self::SignedByte,
            0x0B => Self::Short,
            0x0C => Self::Int,
            0x0D => Self::Float,
            0x0E => Self::Double,
            _ => Self::Unknown,
        }
    }
}

/// Checks an IDX magic number: unsigned bytes with `dims` dimensions.
fn check_magic(magic: u32, dims: u32) -> io::Result<()> {
    let data_type = DataType::from(magic);
    if data_type != DataType::UnsignedByte {
        return Err(invalid(format!(
            "expected unsigned byte data, found {data_type:?}"
        )));
    }
    if magic & 0xFF != dims {
        return Err(invalid(format!(
            "expected {dims} dimensions, found {}",
            magic & 0xFF
        )));
    }

    Ok(())
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Reads a body of `dims.product()` bytes. The buffer grows only as data
/// arrives, so a corrupt header cannot force a huge allocation.
fn read_body(src: &mut impl Read, dims: &[u32]) -> io::Result<Vec<u8>> {
    let size = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
        .ok_or_else(|| invalid(format!("header dimensions {dims:?} overflow")))?;

    let mut data = Vec::new();
    src.take(size as u64).read_to_end(&mut data)?;
    if data.len() != size {
        return Err(invalid(format!(
            "header promises {size} bytes, file holds {}",
            data.len()
        )));
    }

    Ok(data)
}

#[derive(Debug)]
struct RawImages {
    dims: (u32, u32),
    data: Vec<u8>,
}

impl RawImages {
    fn parse(src: &mut impl Read) -> io::Result<Self> {
        let magic = src.read_u32::<BigEndian>()?;
        check_magic(magic, 3)?;

        let count = src.read_u32::<BigEndian>()?;
        let d1 = src.read_u32::<BigEndian>()?;
        let d2 = src.read_u32::<BigEndian>()?;

        let data = read_body(src, &[count, d1, d2])?;

        Ok(RawImages {
            dims: (d1, d2),
            data,
        })
    }
}

#[derive(Debug)]
struct RawLabels(Vec<u8>);

impl RawLabels {
    fn parse(src: &mut impl Read) -> io::Result<Self> {
        let magic = src.read_u32::<BigEndian>()?;
        check_magic(magic, 1)?;

        let count = src.read_u32::<BigEndian>()?;

        Ok(RawLabels(read_body(src, &[count])?))
    }
}

/// Handwritten digits read from the four uncompressed IDX files under a
/// root directory.
#[derive(Debug)]
pub struct Mnist {
    split: Split,
    rows: usize,
    cols: usize,
    images: Vec<u8>,
    labels: Vec<u8>,
    transform: Transform,
}

impl Mnist {
    pub const CLASSES: usize = 10;

    pub fn file_names(split: Split) -> (&'static str, &'static str) {
        match split {
            Split::Train => ("train-images-idx3-ubyte", "train-labels-idx1-ubyte"),
            Split::Test => ("t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte"),
        }
    }

    pub fn load(root: &Path, split: Split, transform: Transform) -> Result<Self> {
        let (images_name, labels_name) = Self::file_names(split);
        let images_path = root.join(images_name);
        let labels_path = root.join(labels_name);

        let images = RawImages::parse(&mut open(&images_path)?)
            .map_err(|e| dataset_err(&images_path, e.to_string()))?;
        let labels = RawLabels::parse(&mut open(&labels_path)?)
            .map_err(|e| dataset_err(&labels_path, e.to_string()))?;

        let mnist = Self::from_raw(split, images.dims, images.data, labels.0, transform)
            .map_err(|e| dataset_err(&images_path, e.to_string()))?;
        info!(
            "loaded {} {split} digits of {}x{} from {}",
            mnist.len(),
            mnist.rows,
            mnist.cols,
            root.display()
        );

        Ok(mnist)
    }

    /// Builds the dataset from already decoded pixel and label buffers.
    pub fn from_raw(
        split: Split,
        (rows, cols): (u32, u32),
        images: Vec<u8>,
        labels: Vec<u8>,
        transform: Transform,
    ) -> Result<Self> {
        let (rows, cols) = (rows as usize, cols as usize);
        if rows * cols == 0 || images.len() != labels.len() * rows * cols {
            return Err(Error::ShapeMismatch {
                what: "mnist images",
                got: images.len(),
                expected: labels.len() * rows * cols,
            });
        }

        Ok(Self {
            split,
            rows,
            cols,
            images,
            labels,
            transform,
        })
    }
}

impl Dataset for Mnist {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn split(&self) -> Split {
        self.split
    }

    fn sample_shape(&self) -> Shape {
        Shape::image(1, self.rows, self.cols)
    }

    fn get(&self, idx: usize) -> Result<Sample> {
        let size = self.rows * self.cols;
        let raw = self
            .images
            .get(idx * size..(idx + 1) * size)
            .ok_or(Error::ShapeMismatch {
                what: "sample index",
                got: idx,
                expected: self.len(),
            })?;

        Ok(Sample {
            input: self.transform.apply(raw, 1)?,
            label: Some(self.labels[idx] as usize),
        })
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| dataset_err(path, e.to_string()))
}

fn dataset_err(path: &Path, reason: String) -> Error {
    Error::Dataset {
        path: PathBuf::from(path),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use byteorder::WriteBytesExt;

    use super::*;

    fn idx_images(count: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(0x0803).unwrap();
        for v in [count, rows, cols] {
            buf.write_u32::<BigEndian>(v).unwrap();
        }
        buf.extend_from_slice(pixels);
        buf
    }

    #[test]
    fn parses_image_header() {
        let bytes = idx_images(2, 2, 2, &[0, 1, 2, 3, 4, 5, 6, 7]);
        let images = RawImages::parse(&mut Cursor::new(bytes)).unwrap();

        assert_eq!(images.dims, (2, 2));
        assert_eq!(images.data, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn rejects_label_file_as_images() {
        let mut bytes = Vec::new();
        bytes.write_u32::<BigEndian>(0x0801).unwrap();
        bytes.write_u32::<BigEndian>(0).unwrap();

        let err = RawImages::parse(&mut Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("3 dimensions"), "{err}");
    }

    #[test]
    fn truncated_file_is_invalid_data() {
        let bytes = idx_images(2, 2, 2, &[0, 1, 2]);
        let err = RawImages::parse(&mut Cursor::new(bytes)).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("8 bytes"), "{err}");
    }

    #[test]
    fn overflowing_header_is_rejected() {
        let bytes = idx_images(u32::MAX, u32::MAX, u32::MAX, &[]);
        let err = RawImages::parse(&mut Cursor::new(bytes)).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("overflow"), "{err}");
    }

    #[test]
    fn oversized_header_names_the_file() {
        let dir = std::env::temp_dir().join(format!("digitnets-idx-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t10k-images-idx3-ubyte");
        std::fs::write(&path, idx_images(0x10000, 0x10000, 1, &[0; 16])).unwrap();

        let err = Mnist::load(&dir, Split::Test, Transform::default()).unwrap_err();
        std::fs::remove_dir_all(&dir).unwrap();

        match err {
            Error::Dataset { path, reason } => {
                assert!(path.ends_with("t10k-images-idx3-ubyte"));
                assert!(reason.contains("bytes"), "{reason}");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn missing_directory_names_the_file() {
        let err = Mnist::load(Path::new("/nonexistent/mnist"), Split::Test, Transform::default())
            .unwrap_err();

        match err {
            Error::Dataset { path, .. } => assert!(path.ends_with("t10k-images-idx3-ubyte")),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn samples_are_transformed() {
        let mnist = Mnist::from_raw(
            Split::Train,
            (1, 2),
            vec![0, 255, 255, 0],
            vec![3, 7],
            Transform::default(),
        )
        .unwrap();

        assert_eq!(mnist.len(), 2);
        assert_eq!(
            mnist.get(1).unwrap(),
            Sample {
                input: vec![1.0, 0.0],
                label: Some(7)
            }
        );
        assert!(mnist.get(2).is_err());
    }
}
