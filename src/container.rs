//! Binary field container: a fixed header, a directory of named arrays, then
//! row-major little-endian `f64` payloads.
//!
//! Layout:
//!   [0..8]    magic `FLDSTORE`
//!   [8..12]   version (u32)
//!   [12..16]  array count (u32)
//!   per array, `ENTRY_SIZE` bytes starting at `FILE_HEADER_SIZE`:
//!     [0..64]   name, NUL padded ASCII
//!     [64..68]  ndim (u32)
//!     [72..96]  dims (3 x u64, unused trailing dims are 0)
//!     [96..104] payload offset (u64)

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::error::{format_ranges, CorrelationError, Result};
use crate::store::{check_ranges, FieldRef, FieldStore};

const MAGIC: &[u8; 8] = b"FLDSTORE";
const VERSION: u32 = 1;
const FILE_HEADER_SIZE: usize = 64;
const ENTRY_SIZE: usize = 128;
const NAME_LEN: usize = 64;
const NDIM_OFFSET: usize = 64;
const DIMS_OFFSET: usize = 72;
const PAYLOAD_OFFSET: usize = 96;
const MAX_DIMS: usize = 3;
const VALUE_SIZE: u64 = 8;

fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    if offset + 4 <= buf.len() {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

fn write_u64_le(buf: &mut [u8], offset: usize, value: u64) {
    if offset + 8 <= buf.len() {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

fn write_fixed_ascii(buf: &mut [u8], offset: usize, len: usize, value: &str) {
    if offset + len > buf.len() {
        return;
    }
    let dst = &mut buf[offset..offset + len];
    dst.fill(0);
    let src = value.as_bytes();
    let n = src.len().min(len);
    dst[..n].copy_from_slice(&src[..n]);
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64_le(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn read_fixed_ascii(buf: &[u8], offset: usize, len: usize) -> String {
    let raw = &buf[offset..offset + len];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(target_os = "linux")]
fn advise_random_access(file: &File) {
    use std::os::fd::AsRawFd;
    let fd = file.as_raw_fd();
    unsafe {
        let _ = libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_RANDOM);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_random_access(_file: &File) {}

fn malformed(path: &Path, reason: impl Into<String>) -> CorrelationError {
    CorrelationError::MalformedContainer {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

pub fn write_container(path: &Path, arrays: &[(&str, ArrayViewD<'_, f64>)]) -> Result<()> {
    let count = u32::try_from(arrays.len()).map_err(|_| malformed(path, "too many arrays"))?;
    let mut header = vec![0u8; FILE_HEADER_SIZE + ENTRY_SIZE * arrays.len()];
    header[0..8].copy_from_slice(MAGIC);
    write_u32_le(&mut header, 8, VERSION);
    write_u32_le(&mut header, 12, count);

    let mut payload_offset = header.len() as u64;
    for (slot, (name, data)) in arrays.iter().enumerate() {
        if !(2..=MAX_DIMS).contains(&data.ndim()) {
            return Err(CorrelationError::Dimensionality { ndim: data.ndim() });
        }
        if name.is_empty() || name.len() > NAME_LEN {
            return Err(malformed(path, format!("array name '{name}' must be 1..={NAME_LEN} bytes")));
        }
        let base = FILE_HEADER_SIZE + slot * ENTRY_SIZE;
        write_fixed_ascii(&mut header, base, NAME_LEN, name);
        write_u32_le(&mut header, base + NDIM_OFFSET, data.ndim() as u32);
        for (axis, &len) in data.shape().iter().enumerate() {
            write_u64_le(&mut header, base + DIMS_OFFSET + 8 * axis, len as u64);
        }
        write_u64_le(&mut header, base + PAYLOAD_OFFSET, payload_offset);
        payload_offset += data.len() as u64 * VALUE_SIZE;
    }

    let write_err = |name: &str, e: io::Error| CorrelationError::store(name, "write", e);
    let file = File::create(path).map_err(|e| write_err("<header>", e))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&header)
        .map_err(|e| write_err("<header>", e))?;
    for (name, data) in arrays {
        // iter() walks logical (row-major) order regardless of memory layout
        for value in data.iter() {
            writer
                .write_all(&value.to_le_bytes())
                .map_err(|e| write_err(*name, e))?;
        }
    }
    writer.flush().map_err(|e| write_err("<header>", e))?;
    Ok(())
}

pub struct ContainerStore {
    path: PathBuf,
    name: String,
    shape: Vec<usize>,
    payload_offset: u64,
    reader: BufReader<File>,
    position: Option<u64>,
}

impl ContainerStore {
    pub fn open(reference: &FieldRef) -> Result<Self> {
        let path = reference.container.clone();
        let array = reference.array.as_str();
        let file = File::open(&path).map_err(|e| CorrelationError::store(array, "open", e))?;
        advise_random_access(&file);
        let file_len = file
            .metadata()
            .map_err(|e| CorrelationError::store(array, "open", e))?
            .len();
        let mut reader = BufReader::new(file);

        let mut header = [0u8; FILE_HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .map_err(|_| malformed(&path, "truncated file header"))?;
        if &header[0..8] != MAGIC {
            return Err(malformed(&path, "bad magic"));
        }
        let version = read_u32_le(&header, 8);
        if version != VERSION {
            return Err(malformed(&path, format!("unsupported version {version}")));
        }
        let count = read_u32_le(&header, 12) as usize;
        if (FILE_HEADER_SIZE + count * ENTRY_SIZE) as u64 > file_len {
            return Err(malformed(&path, format!("directory of {count} arrays exceeds file size")));
        }

        let mut directory = vec![0u8; count * ENTRY_SIZE];
        reader
            .read_exact(&mut directory)
            .map_err(|_| malformed(&path, "truncated array directory"))?;

        for entry in directory.chunks_exact(ENTRY_SIZE) {
            if read_fixed_ascii(entry, 0, NAME_LEN) != array {
                continue;
            }
            let ndim = read_u32_le(entry, NDIM_OFFSET) as usize;
            if !(2..=MAX_DIMS).contains(&ndim) {
                return Err(CorrelationError::Dimensionality { ndim });
            }
            let dims: Vec<u64> = (0..ndim)
                .map(|axis| read_u64_le(entry, DIMS_OFFSET + 8 * axis))
                .collect();
            let payload_offset = read_u64_le(entry, PAYLOAD_OFFSET);
            let payload_end = dims
                .iter()
                .try_fold(VALUE_SIZE, |len, &n| len.checked_mul(n))
                .and_then(|len| len.checked_add(payload_offset));
            match payload_end {
                Some(end) if end <= file_len => {}
                _ => {
                    return Err(malformed(
                        &path,
                        format!("array '{array}' payload runs past end of file"),
                    ))
                }
            }
            let shape = dims
                .iter()
                .map(|&n| usize::try_from(n))
                .collect::<std::result::Result<Vec<usize>, _>>()
                .map_err(|_| malformed(&path, format!("array '{array}' is too large")))?;
            return Ok(Self {
                path,
                name: array.to_string(),
                shape,
                payload_offset,
                reader,
                position: None,
            });
        }

        Err(CorrelationError::store(
            array,
            "open",
            io::Error::new(
                ErrorKind::NotFound,
                format!("no array named '{array}' in {}", path.display()),
            ),
        ))
    }

    pub fn load(&mut self) -> Result<ArrayD<f64>> {
        let ranges: Vec<Range<usize>> = self.shape.iter().map(|&n| 0..n).collect();
        self.read_block(&ranges)
    }

    /// Consecutive rows of a full-width block are read without seeking.
    fn read_row(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if self.position != Some(offset) {
            self.position = None;
            self.reader.seek(SeekFrom::Start(offset))?;
        }
        self.reader.read_exact(buf)?;
        self.position = Some(offset + buf.len() as u64);
        Ok(())
    }
}

impl FieldStore for ContainerStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn read_block(&mut self, ranges: &[Range<usize>]) -> Result<ArrayD<f64>> {
        check_ranges(&self.shape, ranges)?;
        let block_shape: Vec<usize> = ranges.iter().map(|r| r.end - r.start).collect();
        let mut values = Vec::with_capacity(block_shape.iter().product());
        if block_shape.iter().any(|&n| n == 0) {
            return ArrayD::from_shape_vec(IxDyn(&block_shape), values)
                .map_err(|e| malformed(&self.path, e.to_string()));
        }

        let ndim = self.shape.len();
        let mut strides = vec![1usize; ndim];
        for axis in (0..ndim - 1).rev() {
            strides[axis] = strides[axis + 1] * self.shape[axis + 1];
        }

        let (last_range, leading) = ranges
            .split_last()
            .ok_or(CorrelationError::Dimensionality { ndim: 0 })?;
        let row_len = last_range.end - last_range.start;
        let mut row = vec![0u8; row_len * VALUE_SIZE as usize];
        let leading_shape: Vec<usize> = block_shape[..ndim - 1].to_vec();

        for prefix in ndarray::indices(IxDyn(&leading_shape)) {
            let mut flat = last_range.start;
            for (axis, range) in leading.iter().enumerate() {
                flat += (range.start + prefix[axis]) * strides[axis];
            }
            let offset = self.payload_offset + flat as u64 * VALUE_SIZE;
            self.read_row(offset, &mut row)
                .map_err(|e| CorrelationError::store(&self.name, format_ranges(ranges), e))?;
            values.extend(row.chunks_exact(VALUE_SIZE as usize).map(|bytes| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                f64::from_le_bytes(raw)
            }));
        }

        ArrayD::from_shape_vec(IxDyn(&block_shape), values)
            .map_err(|e| malformed(&self.path, e.to_string()))
    }
}
