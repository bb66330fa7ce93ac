use std::fs::File;
use std::path::{Path, PathBuf};
use std::collections::BTreeMap;
use std::io::{BufReader, Read, Seek};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use memmap2::Mmap;
use tracing::{debug, info};
use super::types::{GGUFValue, GGUFError, GGUFValueType, TensorInfo, GGMLType};
use super::gguf_utils::{self, GGUF_MAGIC, GGUF_DEFAULT_ALIGNMENT};

/// Parsed header, metadata and tensor directory of a GGUF file.
///
/// Tensor data is not read eagerly; use [`GGUFReader::tensor_f32`] to map
/// and copy a single tensor out of the data section.
#[derive(Debug)]
pub struct GGUFReader {
    /// Path to the GGUF file
    pub path: PathBuf,
    /// Format version from the header
    pub version: u32,
    /// Metadata key-value pairs, with the value type name for display
    pub metadata: BTreeMap<String, (String, GGUFValue)>,
    /// Information about each tensor
    pub tensors: Vec<TensorInfo>,
    /// Absolute file offset where the tensor data section starts
    pub data_offset: u64,
}

impl GGUFReader {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, GGUFError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != GGUF_MAGIC {
            return Err(GGUFError::InvalidFormat(format!("Invalid magic number {:#010x}", magic)));
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if !(2..=3).contains(&version) {
            return Err(GGUFError::InvalidFormat(format!("Unsupported GGUF version {}", version)));
        }

        let tensor_count = gguf_utils::read_len(&mut reader, version)?;
        let metadata_count = gguf_utils::read_len(&mut reader, version)?;
        debug!("Reading GGUF file: {} tensors, {} metadata entries", tensor_count, metadata_count);

        let mut metadata: BTreeMap<String, (String, GGUFValue)> = BTreeMap::new();
        for _ in 0..metadata_count {
            let (key, type_str, value) = read_metadata_kv(&mut reader, version)?;
            metadata.insert(key, (type_str, value));
        }

        let tensors = read_tensor_info(&mut reader, tensor_count, version)?;

        let alignment = metadata
            .get("general.alignment")
            .and_then(|(_, v)| v.as_int())
            .filter(|a| *a > 0)
            .map(|a| a as u64)
            .unwrap_or(GGUF_DEFAULT_ALIGNMENT);
        let data_offset = gguf_utils::align_offset(reader.stream_position()?, alignment);

        info!(
            path = %path.display(),
            version,
            tensors = tensors.len(),
            metadata = metadata.len(),
            "Read GGUF header"
        );

        Ok(Self {
            path: path.to_path_buf(),
            version,
            metadata,
            tensors,
            data_offset,
        })
    }

    pub fn get_metadata_value(&self, key: &str) -> Result<&GGUFValue, GGUFError> {
        match self.metadata.get(key) {
            Some((_, value)) => Ok(value),
            None => Err(GGUFError::MetadataNotFound(key.to_string())),
        }
    }

    /// Returns the metadata value for `key`, or `None` when absent.
    pub fn metadata_value(&self, key: &str) -> Option<&GGUFValue> {
        self.metadata.get(key).map(|(_, value)| value)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Copies an F32 tensor out of the data section through a memory map.
    ///
    /// Returns `Ok(None)` when no tensor with that name exists.
    pub fn tensor_f32(&self, name: &str) -> Result<Option<Vec<f32>>, GGUFError> {
        let info = match self.tensor(name) {
            Some(info) => info,
            None => return Ok(None),
        };
        if info.data_type != GGMLType::F32 {
            return Err(GGUFError::InvalidFormat(format!(
                "Tensor {} has type {}, only F32 can be read directly",
                name,
                info.data_type.type_string()
            )));
        }

        let file = File::open(&self.path)?;
        // SAFETY: the map is read-only and dropped before this function returns.
        let mmap = unsafe { Mmap::map(&file)? };

        let out_of_bounds = || GGUFError::InvalidFormat(format!("Tensor {} extends past the end of the file", name));
        let count = info.element_count().ok_or_else(out_of_bounds)?;
        let start = self.data_offset.checked_add(info.offset).ok_or_else(out_of_bounds)?;
        let end = count
            .checked_mul(4)
            .and_then(|len| start.checked_add(len))
            .filter(|end| *end <= mmap.len() as u64)
            .ok_or_else(out_of_bounds)?;

        let mut values = vec![0f32; count as usize];
        LittleEndian::read_f32_into(&mmap[start as usize..end as usize], &mut values);
        Ok(Some(values))
    }
}

fn read_metadata_kv<R: Read>(reader: &mut R, version: u32) -> Result<(String, String, GGUFValue), GGUFError> {
    let key = gguf_utils::read_string(reader, version)?;
    let value_type = GGUFValueType::try_from(reader.read_u32::<LittleEndian>()?)?;
    let value = gguf_utils::read_value_by_type(reader, value_type, version)?;
    Ok((key, value_type.type_string().to_string(), value))
}

fn read_tensor_info<R: Read>(reader: &mut R, tensor_count: u64, version: u32) -> Result<Vec<TensorInfo>, GGUFError> {
    let mut tensors = Vec::with_capacity(tensor_count.min(1 << 16) as usize);

    for _ in 0..tensor_count {
        let name = gguf_utils::read_string(reader, version)?;
        let n_dims = reader.read_u32::<LittleEndian>()?;
        if n_dims > 4 {
            return Err(GGUFError::InvalidFormat(format!("Tensor {} has {} dimensions", name, n_dims)));
        }

        let mut dims = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            dims.push(gguf_utils::read_len(reader, version)?);
        }

        let data_type = GGMLType::from(reader.read_u32::<LittleEndian>()?);
        let offset = reader.read_u64::<LittleEndian>()?;

        tensors.push(TensorInfo {
            name,
            dims,
            data_type,
            offset,
        });
    }

    Ok(tensors)
}
