use std::fs::File;
use std::path::Path;
use std::io::Read;
use byteorder::{LittleEndian, ReadBytesExt};
use super::types::{GGUFValue, GGUFValueType, GGUFError};

/// The magic number that identifies GGUF files
pub const GGUF_MAGIC: u32 = 0x46554747; // "GGUF" in ASCII

/// Default alignment of the tensor data section
pub const GGUF_DEFAULT_ALIGNMENT: u64 = 32;

/// Upper bound on any single length prefix; anything larger is a corrupt file
const MAX_LENGTH: u64 = 1 << 30;

/// Read a length prefix, which is u32 in version 1 files and u64 from version 2 on
pub fn read_len<R: Read>(reader: &mut R, version: u32) -> Result<u64, GGUFError> {
    let len = if version >= 2 {
        reader.read_u64::<LittleEndian>()?
    } else {
        reader.read_u32::<LittleEndian>()? as u64
    };
    if len > MAX_LENGTH {
        return Err(GGUFError::InvalidFormat(format!("Length prefix {} is implausibly large", len)));
    }
    Ok(len)
}

/// Read a string value from the file
pub fn read_string<R: Read>(reader: &mut R, version: u32) -> Result<String, GGUFError> {
    let str_len = read_len(reader, version)?;
    let mut buffer = vec![0u8; str_len as usize];
    reader.read_exact(&mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| GGUFError::InvalidFormat(format!("Invalid UTF-8 in string: {}", e)))
}

/// Read a GGUF value of the specified type from the file
pub fn read_value_by_type<R: Read>(reader: &mut R, value_type: GGUFValueType, version: u32) -> Result<GGUFValue, GGUFError> {
    Ok(match value_type {
        GGUFValueType::UINT8 => GGUFValue::Int(reader.read_u8()? as i64),
        GGUFValueType::INT8 => GGUFValue::Int(reader.read_i8()? as i64),
        GGUFValueType::UINT16 => GGUFValue::Int(reader.read_u16::<LittleEndian>()? as i64),
        GGUFValueType::INT16 => GGUFValue::Int(reader.read_i16::<LittleEndian>()? as i64),
        GGUFValueType::UINT32 => GGUFValue::Int(reader.read_u32::<LittleEndian>()? as i64),
        GGUFValueType::INT32 => GGUFValue::Int(reader.read_i32::<LittleEndian>()? as i64),
        GGUFValueType::FLOAT32 => GGUFValue::Float(reader.read_f32::<LittleEndian>()? as f64),
        GGUFValueType::BOOL => GGUFValue::Bool(reader.read_u8()? != 0),
        GGUFValueType::STRING => GGUFValue::String(read_string(reader, version)?),
        GGUFValueType::UINT64 => GGUFValue::Int(reader.read_u64::<LittleEndian>()? as i64),
        GGUFValueType::INT64 => GGUFValue::Int(reader.read_i64::<LittleEndian>()?),
        GGUFValueType::FLOAT64 => GGUFValue::Float(reader.read_f64::<LittleEndian>()?),
        GGUFValueType::ARRAY => {
            let element_type = GGUFValueType::try_from(reader.read_u32::<LittleEndian>()?)?;
            if element_type == GGUFValueType::ARRAY {
                return Err(GGUFError::InvalidFormat("Nested arrays are not supported".into()));
            }
            let arr_len = read_len(reader, version)?;
            let mut array = Vec::with_capacity(arr_len.min(1 << 16) as usize);
            for _ in 0..arr_len {
                array.push(read_value_by_type(reader, element_type, version)?);
            }
            GGUFValue::Array(array)
        }
    })
}

/// Rounds `offset` up to the next multiple of `alignment`
pub fn align_offset(offset: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return offset;
    }
    offset.div_ceil(alignment) * alignment
}

/// Checks if a file at the given path is a GGUF format file by verifying its magic number.
///
/// # Returns
///
/// `true` if the file exists and has a valid GGUF magic number, `false` otherwise
pub fn is_gguf_file<P: AsRef<Path>>(path: P) -> bool {
    if let Ok(mut file) = File::open(path) {
        if let Ok(magic) = file.read_u32::<LittleEndian>() {
            return magic == GGUF_MAGIC;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_align_offset() {
        assert_eq!(align_offset(0, 32), 0);
        assert_eq!(align_offset(1, 32), 32);
        assert_eq!(align_offset(32, 32), 32);
        assert_eq!(align_offset(33, 32), 64);
        assert_eq!(align_offset(7, 0), 7);
    }

    #[test]
    fn test_read_string_v1_uses_u32_length() {
        let mut bytes = vec![3u8, 0, 0, 0];
        bytes.extend_from_slice(b"abc");
        let s = read_string(&mut Cursor::new(bytes), 1).unwrap();
        assert_eq!(s, "abc");
    }

    #[test]
    fn test_implausible_length_rejected() {
        let bytes = u64::MAX.to_le_bytes().to_vec();
        let result = read_string(&mut Cursor::new(bytes), 3);
        assert!(matches!(result, Err(GGUFError::InvalidFormat(_))));
    }

    #[test]
    fn test_is_gguf_file_checks_magic() {
        let dir = std::env::temp_dir().join(format!("llamabridge-magic-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let good = dir.join("good.gguf");
        let bad = dir.join("bad.gguf");
        std::fs::write(&good, GGUF_MAGIC.to_le_bytes()).unwrap();
        std::fs::write(&bad, b"GGML").unwrap();

        assert!(is_gguf_file(&good));
        assert!(!is_gguf_file(&bad));
        assert!(!is_gguf_file(dir.join("missing.gguf")));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_unknown_value_type() {
        assert!(GGUFValueType::try_from(42).is_err());
    }
}
