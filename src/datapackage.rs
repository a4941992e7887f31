use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Field types the loader knows how to coerce. Unrecognized type names
/// fall back to `Any` and are stored as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Datetime,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "string" => FieldType::String,
            "integer" => FieldType::Integer,
            "number" => FieldType::Number,
            "datetime" => FieldType::Datetime,
            "boolean" => FieldType::Boolean,
            "array" => FieldType::Array,
            "object" => FieldType::Object,
            _ => FieldType::Any,
        }
    }
}

/// One typed field of a resource schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
}

impl Field {
    pub fn field_type(&self) -> FieldType {
        FieldType::from_name(&self.type_name)
    }
}

/// Descriptor values that may be a single string or a list of strings
/// (`primaryKey`, foreign-key `fields`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn as_vec(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(s) => vec![s.as_str()],
            OneOrMany::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// CSV dialect settings, camelCase on the wire as in table-schema
/// descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Dialect {
    pub delimiter: String,
    pub double_quote: bool,
    pub line_terminator: String,
    pub skip_initial_space: bool,
    pub header: bool,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            delimiter: ",".to_string(),
            double_quote: true,
            line_terminator: "\r\n".to_string(),
            skip_initial_space: false,
            header: true,
        }
    }
}

impl Dialect {
    /// The canonical tab-separated dialect injected for `.tsv` sources
    /// that declare none.
    pub fn tsv() -> Self {
        Self {
            delimiter: "\t".to_string(),
            double_quote: false,
            line_terminator: "\n".to_string(),
            skip_initial_space: true,
            header: true,
        }
    }

    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter.as_bytes().first().copied().unwrap_or(b',')
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FkReference {
    #[serde(default)]
    pub resource: String,
    pub fields: OneOrMany,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub fields: OneOrMany,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<FkReference>,
}

/// Ordered field list plus key declarations for one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Declared primary-key fields, or `None` when no key is declared.
    pub fn primary_key_fields(&self) -> Option<Vec<&str>> {
        self.primary_key.as_ref().map(OneOrMany::as_vec)
    }
}

/// One named tabular dataset definition with schema and source location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<Dialect>,
    pub schema: TableSchema,
}

impl Resource {
    /// Patch missing dialect/format metadata in place, once per
    /// resource. Tab-separated sources that declare no dialect get the
    /// canonical TSV dialect; everything else keeps its format
    /// auto-detected from the path extension. Returns true if the
    /// descriptor changed.
    pub fn apply_format_patch(&mut self) -> bool {
        if self.path.ends_with(".tsv") && self.dialect.is_none() {
            self.dialect = Some(Dialect::tsv());
            return true;
        }
        false
    }

}

/// Top-level datapackage descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub resources: Vec<Resource>,
}

/// A datapackage on disk: descriptor plus the directory resource paths
/// resolve against.
#[derive(Debug, Clone)]
pub struct Bundle {
    base_dir: PathBuf,
    pub descriptor: Descriptor,
}

impl Bundle {
    /// Open a datapackage from its descriptor file, or from a directory
    /// containing `datapackage.json`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let descriptor_path = if path.is_dir() {
            path.join("datapackage.json")
        } else {
            path.to_path_buf()
        };
        let file = File::open(&descriptor_path)
            .with_context(|| format!("failed to open datapackage descriptor {:?}", descriptor_path))?;
        let descriptor: Descriptor = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse datapackage descriptor {:?}", descriptor_path))?;
        let base_dir = descriptor_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self { base_dir, descriptor })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Absolute path of a resource's data file.
    pub fn resource_path(&self, resource: &Resource) -> PathBuf {
        self.base_dir.join(&resource.path)
    }
}
