//! BPF Object Binding Library
//!
//! Provides cached handles over loaded BPF objects, typed marshalling for
//! map keys and values, and perf event streaming with struct decoding.

pub mod error;
pub mod map;
pub mod marshal;
pub mod object;
pub mod perf;
pub mod program;
pub mod structs;
mod util;
pub mod value;

pub use error::{Error, Result};
pub use map::{BpfMap, MapType};
pub use object::BpfObject;
pub use perf::{PerfEventStream, PerfEventStreamBuilder, DEFAULT_PAGE_COUNT};
pub use program::BpfProgram;
pub use structs::{defs_from_json, FieldDef, FieldType, StructDef, StructLayout, StructRegistry};
pub use value::{StructValue, Value};
