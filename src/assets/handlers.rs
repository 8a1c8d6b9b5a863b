use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use memmap2::{Mmap, MmapOptions};
use serde_json::{Map, Value};
use crate::assets::handler::{factory, Handler};
use crate::assets::registry::Registry;
use crate::core::error::{Error, ErrorKind, Result};
use crate::query::matcher::lookup;

pub const JSON_SPEC: &str = "JSON";
pub const LZ4_FRAMES_SPEC: &str = "LZ4_FRAMES";

/// Install the built-in handlers, keeping any already registered for the same spec.
pub fn register_builtin_handlers(registry: &Registry) -> Result<()> {
    let specs = registry.registered_specs();
    if !specs.iter().any(|s| s == JSON_SPEC) {
        registry.register_handler(JSON_SPEC, factory(JsonHandler::open), false)?;
    }
    if !specs.iter().any(|s| s == LZ4_FRAMES_SPEC) {
        registry.register_handler(LZ4_FRAMES_SPEC, factory(Lz4FrameHandler::open), false)?;
    }
    Ok(())
}

fn kwarg_u64(kwargs: &Map<String, Value>, key: &str) -> Result<u64> {
    kwargs
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::invalid_argument(format!("datum_kwargs must contain integer '{}'", key)))
}

/// Resource is one JSON file; datums address into it with
/// `{"key": "dotted.path"}` or `{"index": n}`.
pub struct JsonHandler {
    path: PathBuf,
    document: Value,
}

impl JsonHandler {
    pub fn open(path: &Path, _resource_kwargs: &Map<String, Value>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(JsonHandler {
            path: path.to_path_buf(),
            document: serde_json::from_str(&text)?,
        })
    }
}

impl Handler for JsonHandler {
    fn retrieve(&self, datum_kwargs: &Map<String, Value>) -> Result<Value> {
        if let Some(key) = datum_kwargs.get("key").and_then(Value::as_str) {
            return lookup(&self.document, key).cloned().ok_or_else(|| {
                Error::not_found(format!("Key {} not found in {}", key, self.path.display()))
            });
        }
        let index = kwarg_u64(datum_kwargs, "index")? as usize;
        self.document
            .as_array()
            .and_then(|items| items.get(index))
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::IndexOutOfRange,
                    format!("Index {} out of range in {}", index, self.path.display()),
                )
            })
    }

    fn get_file_list(&self, _datum_kwargs: &[Map<String, Value>]) -> Result<Vec<PathBuf>> {
        Ok(vec![self.path.clone()])
    }
}

/// Element type of decompressed frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDtype {
    U8,
    F64,
}

impl FrameDtype {
    fn parse(kwargs: &Map<String, Value>) -> Result<Self> {
        match kwargs.get("dtype").and_then(Value::as_str).unwrap_or("u8") {
            "u8" => Ok(FrameDtype::U8),
            "f64" => Ok(FrameDtype::F64),
            other => Err(Error::invalid_argument(format!("Unsupported frame dtype '{}'", other))),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        match self {
            FrameDtype::U8 => Ok(Value::from(bytes.to_vec())),
            FrameDtype::F64 => {
                if bytes.len() % 8 != 0 {
                    return Err(Error::new(
                        ErrorKind::Parse,
                        format!("Frame of {} bytes is not a whole number of f64", bytes.len()),
                    ));
                }
                let values: Vec<f64> = bytes
                    .chunks_exact(8)
                    .map(|chunk| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(chunk);
                        f64::from_le_bytes(raw)
                    })
                    .collect();
                Ok(Value::from(values))
            }
        }
    }
}

/// Resource is a file of LZ4 blocks written by `Lz4FrameWriter`; datums
/// address one block with `{"offset": o, "length": n}`.
///
/// `resource_kwargs.dtype` is `"u8"` (default) or `"f64"`.
pub struct Lz4FrameHandler {
    path: PathBuf,
    mmap: Option<Mmap>,
    dtype: FrameDtype,
}

impl Lz4FrameHandler {
    pub fn open(path: &Path, resource_kwargs: &Map<String, Value>) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().len(len).map(&file)? })
        };
        Ok(Lz4FrameHandler {
            path: path.to_path_buf(),
            mmap,
            dtype: FrameDtype::parse(resource_kwargs)?,
        })
    }

    fn data(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

impl Handler for Lz4FrameHandler {
    fn retrieve(&self, datum_kwargs: &Map<String, Value>) -> Result<Value> {
        let offset = kwarg_u64(datum_kwargs, "offset")? as usize;
        let length = kwarg_u64(datum_kwargs, "length")? as usize;
        let frame = offset
            .checked_add(length)
            .and_then(|end| self.data().get(offset..end))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::IndexOutOfRange,
                    format!(
                        "Frame {}..{} is outside {}",
                        offset,
                        offset.saturating_add(length),
                        self.path.display()
                    ),
                )
            })?;
        let bytes = lz4_flex::decompress_size_prepended(frame)?;
        self.dtype.decode(&bytes)
    }

    fn get_file_list(&self, _datum_kwargs: &[Map<String, Value>]) -> Result<Vec<PathBuf>> {
        Ok(vec![self.path.clone()])
    }
}

/// Appends LZ4 blocks to a frame file, returning the datum kwargs of each.
pub struct Lz4FrameWriter {
    file: File,
    position: u64,
}

impl Lz4FrameWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let position = file.metadata()?.len();
        Ok(Lz4FrameWriter { file, position })
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<Map<String, Value>> {
        let frame = lz4_flex::compress_prepend_size(bytes);
        self.file.write_all(&frame)?;

        let mut kwargs = Map::new();
        kwargs.insert("offset".to_string(), Value::from(self.position));
        kwargs.insert("length".to_string(), Value::from(frame.len() as u64));
        self.position += frame.len() as u64;
        Ok(kwargs)
    }

    pub fn append_f64(&mut self, values: &[f64]) -> Result<Map<String, Value>> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.append_bytes(&bytes)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_handler_by_key_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        fs::write(&path, r#"{"a": {"b": [1, 2]}}"#).unwrap();
        let handler = JsonHandler::open(&path, &Map::new()).unwrap();

        let by_key = json!({"key": "a.b"});
        assert_eq!(handler.retrieve(by_key.as_object().unwrap()).unwrap(), json!([1, 2]));

        let list = dir.path().join("list.json");
        fs::write(&list, "[10, 20]").unwrap();
        let handler = JsonHandler::open(&list, &Map::new()).unwrap();
        let by_index = json!({"index": 1});
        assert_eq!(handler.retrieve(by_index.as_object().unwrap()).unwrap(), json!(20));
        let missing = json!({"index": 5});
        assert!(handler.retrieve(missing.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_lz4_frames_written_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.lz4");
        let mut writer = Lz4FrameWriter::create(&path).unwrap();
        let first = writer.append_f64(&[1.0, 2.5]).unwrap();
        let second = writer.append_f64(&[-3.0]).unwrap();
        writer.flush().unwrap();

        let kwargs = json!({"dtype": "f64"});
        let handler = Lz4FrameHandler::open(&path, kwargs.as_object().unwrap()).unwrap();
        assert_eq!(handler.retrieve(&first).unwrap(), json!([1.0, 2.5]));
        assert_eq!(handler.retrieve(&second).unwrap(), json!([-3.0]));
        assert_eq!(handler.get_file_list(&[first]).unwrap(), vec![path]);
    }

    #[test]
    fn test_builtins_do_not_replace_custom_handlers() {
        let registry = Registry::default();
        registry
            .register_handler(JSON_SPEC, factory(Lz4FrameHandler::open), false)
            .unwrap();
        register_builtin_handlers(&registry).unwrap();
        assert_eq!(registry.registered_specs(), vec![JSON_SPEC, LZ4_FRAMES_SPEC]);
    }
}
