use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use byteorder::{LittleEndian, WriteBytesExt};
use super::types::{GGUFError, GGUFValueType, GGMLType};
use super::gguf_utils::{align_offset, GGUF_MAGIC, GGUF_DEFAULT_ALIGNMENT};

/// A metadata value as it will be laid out on disk.
#[derive(Debug, Clone)]
enum RawValue {
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    Str(String),
    StrArray(Vec<String>),
    I32Array(Vec<i32>),
}

struct PendingTensor {
    name: String,
    dims: Vec<u64>,
    data: Vec<f32>,
}

/// Builds a version 3 GGUF file in memory and writes it out.
///
/// Only what model files for the reference engine need is supported:
/// scalar and array metadata, and F32 tensors.
#[derive(Default)]
pub struct GGUFWriter {
    metadata: Vec<(String, RawValue)>,
    tensors: Vec<PendingTensor>,
}

impl GGUFWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_u32(mut self, key: &str, value: u32) -> Self {
        self.metadata.push((key.to_string(), RawValue::U32(value)));
        self
    }

    pub fn add_i32(mut self, key: &str, value: i32) -> Self {
        self.metadata.push((key.to_string(), RawValue::I32(value)));
        self
    }

    pub fn add_f32(mut self, key: &str, value: f32) -> Self {
        self.metadata.push((key.to_string(), RawValue::F32(value)));
        self
    }

    pub fn add_bool(mut self, key: &str, value: bool) -> Self {
        self.metadata.push((key.to_string(), RawValue::Bool(value)));
        self
    }

    pub fn add_string(mut self, key: &str, value: &str) -> Self {
        self.metadata.push((key.to_string(), RawValue::Str(value.to_string())));
        self
    }

    pub fn add_string_array<S: AsRef<str>>(mut self, key: &str, values: &[S]) -> Self {
        let values = values.iter().map(|s| s.as_ref().to_string()).collect();
        self.metadata.push((key.to_string(), RawValue::StrArray(values)));
        self
    }

    pub fn add_i32_array(mut self, key: &str, values: &[i32]) -> Self {
        self.metadata.push((key.to_string(), RawValue::I32Array(values.to_vec())));
        self
    }

    /// Adds an F32 tensor. `dims` are listed innermost first, as GGUF stores them.
    pub fn add_tensor_f32(mut self, name: &str, dims: &[u64], data: Vec<f32>) -> Result<Self, GGUFError> {
        let expected = dims.iter().try_fold(1u64, |acc, d| acc.checked_mul(*d));
        if expected != Some(data.len() as u64) {
            return Err(GGUFError::InvalidFormat(format!(
                "Tensor {} declares dimensions {:?} but {} elements were supplied",
                name, dims, data.len()
            )));
        }
        self.tensors.push(PendingTensor { name: name.to_string(), dims: dims.to_vec(), data });
        Ok(self)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, GGUFError> {
        let mut out: Vec<u8> = Vec::new();
        out.write_u32::<LittleEndian>(GGUF_MAGIC)?;
        out.write_u32::<LittleEndian>(3)?;
        out.write_u64::<LittleEndian>(self.tensors.len() as u64)?;
        out.write_u64::<LittleEndian>(self.metadata.len() as u64)?;

        for (key, value) in &self.metadata {
            write_string(&mut out, key)?;
            write_value(&mut out, value)?;
        }

        let mut offset = 0u64;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for tensor in &self.tensors {
            write_string(&mut out, &tensor.name)?;
            out.write_u32::<LittleEndian>(tensor.dims.len() as u32)?;
            for dim in &tensor.dims {
                out.write_u64::<LittleEndian>(*dim)?;
            }
            out.write_u32::<LittleEndian>(GGMLType::F32.id())?;
            out.write_u64::<LittleEndian>(offset)?;
            offsets.push(offset);
            offset = align_offset(offset + tensor.data.len() as u64 * 4, GGUF_DEFAULT_ALIGNMENT);
        }

        let data_start = align_offset(out.len() as u64, GGUF_DEFAULT_ALIGNMENT);
        out.resize(data_start as usize, 0);

        for (tensor, tensor_offset) in self.tensors.iter().zip(offsets) {
            out.resize((data_start + tensor_offset) as usize, 0);
            for value in &tensor.data {
                out.write_f32::<LittleEndian>(*value)?;
            }
        }

        Ok(out)
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), GGUFError> {
        let bytes = self.to_bytes()?;
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    }
}

fn write_string(out: &mut Vec<u8>, value: &str) -> Result<(), GGUFError> {
    out.write_u64::<LittleEndian>(value.len() as u64)?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn write_value(out: &mut Vec<u8>, value: &RawValue) -> Result<(), GGUFError> {
    match value {
        RawValue::U32(v) => {
            out.write_u32::<LittleEndian>(GGUFValueType::UINT32 as u32)?;
            out.write_u32::<LittleEndian>(*v)?;
        }
        RawValue::I32(v) => {
            out.write_u32::<LittleEndian>(GGUFValueType::INT32 as u32)?;
            out.write_i32::<LittleEndian>(*v)?;
        }
        RawValue::F32(v) => {
            out.write_u32::<LittleEndian>(GGUFValueType::FLOAT32 as u32)?;
            out.write_f32::<LittleEndian>(*v)?;
        }
        RawValue::Bool(v) => {
            out.write_u32::<LittleEndian>(GGUFValueType::BOOL as u32)?;
            out.write_u8(*v as u8)?;
        }
        RawValue::Str(v) => {
            out.write_u32::<LittleEndian>(GGUFValueType::STRING as u32)?;
            write_string(out, v)?;
        }
        RawValue::StrArray(items) => {
            out.write_u32::<LittleEndian>(GGUFValueType::ARRAY as u32)?;
            out.write_u32::<LittleEndian>(GGUFValueType::STRING as u32)?;
            out.write_u64::<LittleEndian>(items.len() as u64)?;
            for item in items {
                write_string(out, item)?;
            }
        }
        RawValue::I32Array(items) => {
            out.write_u32::<LittleEndian>(GGUFValueType::ARRAY as u32)?;
            out.write_u32::<LittleEndian>(GGUFValueType::INT32 as u32)?;
            out.write_u64::<LittleEndian>(items.len() as u64)?;
            for item in items {
                out.write_i32::<LittleEndian>(*item)?;
            }
        }
    }
    Ok(())
}
