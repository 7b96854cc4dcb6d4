//! Struct decoder registry
//!
//! Turns caller-supplied struct definitions into byte-level layouts and
//! decodes fixed-size kernel samples into structured [`Value`]s. Offsets
//! follow C natural-alignment rules for a 64-bit target, matching the
//! layout the kernel side of an object file emits for its event structs.

use std::collections::HashMap;

use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::value::{StructValue, Value};

/// Scalar types available to struct definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    /// One C `char`; decodes as text when used as an array.
    Char,
    /// Pointer-width slot, always 8 bytes on the supported targets.
    Ptr,
}

impl FieldType {
    /// Size in bytes of one scalar element.
    pub fn size(self) -> usize {
        match self {
            FieldType::U8 | FieldType::Char => 1,
            FieldType::U16 => 2,
            FieldType::U32 => 4,
            FieldType::U64 | FieldType::Ptr => 8,
        }
    }

    /// Natural alignment; for these scalars it equals the size.
    pub fn align(self) -> usize {
        self.size()
    }
}

/// One field in a struct definition.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Element count for array fields; scalar when absent.
    #[serde(default)]
    pub count: Option<u32>,
}

/// A named struct definition: ordered fields, offsets not yet computed.
#[derive(Debug, Clone, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

/// Parse struct definitions from their JSON form: an object mapping struct
/// name to an ordered field array, e.g.
///
/// ```json
/// {
///   "execve_event": [
///     {"name": "pid", "type": "u32"},
///     {"name": "comm", "type": "char", "count": 16}
///   ]
/// }
/// ```
pub fn defs_from_json(text: &str) -> serde_json::Result<Vec<StructDef>> {
    let raw: HashMap<String, Vec<FieldDef>> = serde_json::from_str(text)?;
    let mut defs: Vec<StructDef> = raw
        .into_iter()
        .map(|(name, fields)| StructDef { name, fields })
        .collect();
    // Registration order is irrelevant to lookups; sort for stable logs.
    defs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(defs)
}

#[derive(Debug, Clone)]
struct LayoutField {
    name: String,
    ty: FieldType,
    count: Option<u32>,
    offset: usize,
}

impl LayoutField {
    fn decode(&self, data: &[u8]) -> Value {
        match self.count {
            None => decode_scalar(self.ty, &data[self.offset..]),
            Some(n) if self.ty == FieldType::Char => {
                // Char arrays are C strings: text up to the first NUL.
                let raw = &data[self.offset..self.offset + n as usize];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                Value::Str(String::from_utf8_lossy(&raw[..end]).into_owned())
            }
            Some(n) => {
                let mut items = Vec::with_capacity(n as usize);
                for i in 0..n as usize {
                    let at = self.offset + i * self.ty.size();
                    items.push(decode_scalar(self.ty, &data[at..]));
                }
                Value::List(items)
            }
        }
    }
}

fn decode_scalar(ty: FieldType, data: &[u8]) -> Value {
    let v: u64 = match ty {
        FieldType::U8 | FieldType::Char => u64::from(data[0]),
        FieldType::U16 => u64::from(u16::from_le_bytes([data[0], data[1]])),
        FieldType::U32 => u64::from(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
        FieldType::U64 | FieldType::Ptr => u64::from_le_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]),
    };
    Value::Int(v.into())
}

/// A struct definition with field offsets and total size computed.
#[derive(Debug, Clone)]
pub struct StructLayout {
    name: String,
    fields: Vec<LayoutField>,
    size: usize,
    align: usize,
}

impl StructLayout {
    /// Compute offsets for `def` under C natural-alignment rules.
    pub fn new(def: &StructDef) -> Self {
        let mut fields = Vec::with_capacity(def.fields.len());
        let mut offset = 0usize;
        let mut align = 1usize;

        for field in &def.fields {
            let a = field.ty.align();
            offset = round_up(offset, a);
            fields.push(LayoutField {
                name: field.name.clone(),
                ty: field.ty,
                count: field.count,
                offset,
            });
            offset += field.ty.size() * field.count.unwrap_or(1) as usize;
            align = align.max(a);
        }

        Self {
            name: def.name.clone(),
            fields,
            size: round_up(offset, align),
            align,
        }
    }

    /// Struct type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total size in bytes, including tail padding.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Struct alignment in bytes.
    pub fn align(&self) -> usize {
        self.align
    }

    /// Decode `data` into a structured value.
    ///
    /// `data` must be at least [`size`](Self::size) bytes; trailing bytes
    /// are ignored, since perf rounds sample payloads up.
    pub fn decode(&self, data: &[u8]) -> Result<Value> {
        if data.len() < self.size {
            return Err(Error::SampleTooShort {
                name: self.name.clone(),
                need: self.size,
                got: data.len(),
            });
        }

        let mut out = StructValue::new(&self.name);
        for field in &self.fields {
            out.push(&field.name, field.decode(data));
        }
        Ok(Value::Struct(out))
    }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Name-keyed store of computed struct layouts; read-only once built.
#[derive(Debug, Clone, Default)]
pub struct StructRegistry {
    layouts: HashMap<String, StructLayout>,
}

impl StructRegistry {
    /// Compute layouts for every definition and index them by name.
    pub fn build(defs: &[StructDef]) -> Self {
        let mut layouts = HashMap::with_capacity(defs.len());
        for def in defs {
            let layout = StructLayout::new(def);
            debug!(
                "registered struct '{}' ({} bytes, {} fields)",
                layout.name(),
                layout.size(),
                def.fields.len()
            );
            layouts.insert(def.name.clone(), layout);
        }
        Self { layouts }
    }

    /// True when a layout is registered under `name`.
    pub fn has(&self, name: &str) -> bool {
        self.layouts.contains_key(name)
    }

    /// Layout registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&StructLayout> {
        self.layouts.get(name)
    }

    /// Number of registered layouts.
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    /// True when no layouts are registered.
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Decode `data` as the struct registered under `name`.
    pub fn decode(&self, name: &str, data: &[u8]) -> Result<Value> {
        let layout = self.layouts.get(name).ok_or_else(|| Error::UnknownStruct {
            name: name.to_string(),
        })?;
        layout.decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(name: &str, ty: FieldType) -> FieldDef {
        FieldDef {
            name: name.into(),
            ty,
            count: None,
        }
    }

    fn array(name: &str, ty: FieldType, count: u32) -> FieldDef {
        FieldDef {
            name: name.into(),
            ty,
            count: Some(count),
        }
    }

    #[test]
    fn test_layout_inserts_padding() {
        let def = StructDef {
            name: "mixed".into(),
            fields: vec![
                scalar("a", FieldType::U8),
                scalar("b", FieldType::U32),
                scalar("c", FieldType::U8),
            ],
        };
        let layout = StructLayout::new(&def);

        assert_eq!(layout.fields[0].offset, 0);
        assert_eq!(layout.fields[1].offset, 4);
        assert_eq!(layout.fields[2].offset, 8);
        assert_eq!(layout.size(), 12);
        assert_eq!(layout.align(), 4);
    }

    #[test]
    fn test_layout_u64_alignment() {
        let def = StructDef {
            name: "wide".into(),
            fields: vec![scalar("a", FieldType::U32), scalar("b", FieldType::U64)],
        };
        let layout = StructLayout::new(&def);

        assert_eq!(layout.fields[1].offset, 8);
        assert_eq!(layout.size(), 16);
        assert_eq!(layout.align(), 8);
    }

    #[test]
    fn test_pointer_is_eight_bytes() {
        let def = StructDef {
            name: "p".into(),
            fields: vec![scalar("addr", FieldType::Ptr)],
        };
        let layout = StructLayout::new(&def);
        assert_eq!(layout.size(), 8);
        assert_eq!(layout.align(), 8);
    }

    #[test]
    fn test_decode_event_struct() {
        let def = StructDef {
            name: "execve_event".into(),
            fields: vec![scalar("pid", FieldType::U32), array("comm", FieldType::Char, 16)],
        };
        let layout = StructLayout::new(&def);
        assert_eq!(layout.size(), 20);

        let mut data = vec![0u8; 20];
        data[..4].copy_from_slice(&1234u32.to_le_bytes());
        data[4..8].copy_from_slice(b"bash");

        let value = layout.decode(&data).unwrap();
        let s = value.as_struct().unwrap();
        assert_eq!(s.field("pid"), Some(&Value::Int(1234)));
        assert_eq!(s.field("comm"), Some(&Value::Str("bash".into())));
    }

    #[test]
    fn test_decode_numeric_array() {
        let def = StructDef {
            name: "counters".into(),
            fields: vec![array("vals", FieldType::U16, 3)],
        };
        let layout = StructLayout::new(&def);
        assert_eq!(layout.size(), 6);

        let data = [1u8, 0, 2, 0, 3, 0];
        let value = layout.decode(&data).unwrap();
        let s = value.as_struct().unwrap();
        assert_eq!(
            s.field("vals"),
            Some(&Value::List(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3)
            ]))
        );
    }

    #[test]
    fn test_decode_tolerates_trailing_bytes() {
        let def = StructDef {
            name: "small".into(),
            fields: vec![scalar("v", FieldType::U32)],
        };
        let layout = StructLayout::new(&def);

        // Perf pads samples to 8-byte boundaries.
        let data = [7u8, 0, 0, 0, 0xaa, 0xbb, 0xcc, 0xdd];
        let value = layout.decode(&data).unwrap();
        assert_eq!(
            value.as_struct().unwrap().field("v"),
            Some(&Value::Int(7))
        );
    }

    #[test]
    fn test_decode_short_sample() {
        let def = StructDef {
            name: "small".into(),
            fields: vec![scalar("v", FieldType::U64)],
        };
        let layout = StructLayout::new(&def);

        assert!(matches!(
            layout.decode(&[0u8; 4]),
            Err(Error::SampleTooShort {
                need: 8,
                got: 4,
                ..
            })
        ));
    }

    #[test]
    fn test_registry_lookup_and_decode() {
        let defs = vec![StructDef {
            name: "evt".into(),
            fields: vec![scalar("id", FieldType::U32)],
        }];
        let registry = StructRegistry::build(&defs);

        assert!(registry.has("evt"));
        assert!(!registry.has("other"));
        assert_eq!(registry.len(), 1);

        let value = registry.decode("evt", &[9, 0, 0, 0]).unwrap();
        assert_eq!(value.as_struct().unwrap().field("id"), Some(&Value::Int(9)));

        assert!(matches!(
            registry.decode("other", &[0; 4]),
            Err(Error::UnknownStruct { .. })
        ));
    }

    #[test]
    fn test_defs_from_json() {
        let text = r#"{
            "execve_event": [
                {"name": "pid", "type": "u32"},
                {"name": "comm", "type": "char", "count": 16}
            ],
            "addr_event": [
                {"name": "ptr", "type": "ptr"}
            ]
        }"#;

        let defs = defs_from_json(text).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "addr_event");
        assert_eq!(defs[1].name, "execve_event");
        assert_eq!(defs[1].fields[1].count, Some(16));
        assert_eq!(defs[1].fields[1].ty, FieldType::Char);

        let registry = StructRegistry::build(&defs);
        assert_eq!(registry.get("execve_event").unwrap().size(), 20);
        assert_eq!(registry.get("addr_event").unwrap().size(), 8);
    }

    #[test]
    fn test_defs_from_json_rejects_bad_type() {
        let text = r#"{"evt": [{"name": "x", "type": "f32"}]}"#;
        assert!(defs_from_json(text).is_err());
    }
}
