// src/core/protocol/dictionary.rs

//! The reference data dictionary: field definitions and enum tables, plus the
//! multi-part encode used to serve a resident dictionary to late consumers.
//!
//! Dictionary payloads are large enough to require chunking. Each encode call
//! carries a cursor (the current field id, or the current enum table
//! position); a [`EncodeResult::DictPartEncoded`] result means more remains
//! and the caller must continue from the updated cursor.

use crate::core::errors::SessionError;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Upper bound on the number of entries encoded into one refresh part.
const ENTRIES_PER_PART: usize = 512;

/// The outcome of encoding one dictionary part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeResult {
    /// The encoded part was the final one.
    Success,
    /// A part was encoded but more entries remain beyond the cursor.
    DictPartEncoded,
}

/// One field definition from the field dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub fid: i16,
    pub acronym: String,
    pub field_type: String,
    pub length: u32,
}

/// One enum table: a set of field ids sharing a value/display mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnumTable {
    pub fids: Vec<i16>,
    pub values: Vec<(u16, String)>,
}

/// The decoded payload of one dictionary refresh part.
#[derive(Debug, Clone, PartialEq)]
pub enum DictionaryPayload {
    Fields(Vec<FieldDef>),
    EnumTables(Vec<EnumTable>),
}

/// A complete (or in-progress) field/enum reference dictionary.
#[derive(Debug, Clone, Default)]
pub struct DataDictionary {
    fields: BTreeMap<i16, FieldDef>,
    enum_tables: Vec<EnumTable>,
}

impl DataDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// The smallest field id present, or 0 for an empty dictionary. The
    /// first part of a multi-part field encode starts here.
    pub fn min_fid(&self) -> i32 {
        self.fields.keys().next().map(|f| *f as i32).unwrap_or(0)
    }

    pub fn entry_count(&self) -> usize {
        self.fields.len()
    }

    pub fn enum_table_count(&self) -> usize {
        self.enum_tables.len()
    }

    pub fn field(&self, fid: i16) -> Option<&FieldDef> {
        self.fields.get(&fid)
    }

    /// Merges one decoded field dictionary part into this dictionary.
    pub fn add_fields(&mut self, defs: Vec<FieldDef>) {
        for def in defs {
            self.fields.insert(def.fid, def);
        }
    }

    /// Merges one decoded enum dictionary part into this dictionary.
    pub fn add_enum_tables(&mut self, tables: Vec<EnumTable>) {
        self.enum_tables.extend(tables);
    }

    /// Encodes one part of the field dictionary starting at `cursor` (a field
    /// id). On return the cursor points at the next field id to encode; a
    /// `DictPartEncoded` result means a further call is required.
    pub fn encode_field_part(&self, cursor: &mut i32) -> (DictionaryPayload, EncodeResult) {
        let start = (*cursor).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        let mut part = Vec::with_capacity(ENTRIES_PER_PART);
        let mut next = *cursor;
        for def in self.fields.range(start..).map(|(_, d)| d) {
            if part.len() == ENTRIES_PER_PART {
                *cursor = next;
                return (DictionaryPayload::Fields(part), EncodeResult::DictPartEncoded);
            }
            next = def.fid as i32 + 1;
            part.push(def.clone());
        }
        *cursor = next;
        (DictionaryPayload::Fields(part), EncodeResult::Success)
    }

    /// Encodes one part of the enum dictionary starting at `cursor` (a table
    /// position, 0-based).
    pub fn encode_enum_part(&self, cursor: &mut i32) -> (DictionaryPayload, EncodeResult) {
        let start = (*cursor).max(0) as usize;
        let end = (start + ENTRIES_PER_PART).min(self.enum_tables.len());
        let part = self.enum_tables[start..end].to_vec();
        *cursor = end as i32;
        let result = if end < self.enum_tables.len() {
            EncodeResult::DictPartEncoded
        } else {
            EncodeResult::Success
        };
        (DictionaryPayload::EnumTables(part), result)
    }

    /// Loads field definitions from a local dictionary file.
    ///
    /// The expected format is line-oriented: comment lines start with `!`,
    /// definition lines carry `ACRONYM "DDE ACRONYM" FID RIPPLES-TO TYPE LENGTH ...`
    /// with whitespace separation. Quoted columns are skipped over.
    pub fn load_field_dictionary(&mut self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            SessionError::DictionaryLoad(format!(
                "Unable to read field dictionary file '{}': {e}",
                path.display()
            ))
        })?;

        let mut loaded = 0usize;
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('!') {
                continue;
            }
            let cols = split_columns(line);
            if cols.len() < 3 {
                continue;
            }
            let fid: i16 = cols[2].parse().map_err(|_| {
                SessionError::DictionaryLoad(format!(
                    "Malformed field id '{}' at {}:{}",
                    cols[2],
                    path.display(),
                    line_no + 1
                ))
            })?;
            let field_type = cols.get(4).cloned().unwrap_or_default();
            let length = cols.get(5).and_then(|c| c.parse().ok()).unwrap_or(0);
            self.fields.insert(
                fid,
                FieldDef {
                    fid,
                    acronym: cols[0].clone(),
                    field_type,
                    length,
                },
            );
            loaded += 1;
        }

        if loaded == 0 {
            return Err(SessionError::DictionaryLoad(format!(
                "Field dictionary file '{}' contains no definitions",
                path.display()
            )));
        }
        Ok(())
    }

    /// Loads enum tables from a local enum type definition file.
    ///
    /// Header lines carry `ACRONYM FID` pairs (one per line, a run of headers
    /// opens a new table); value lines carry `VALUE "DISPLAY"`.
    pub fn load_enum_type_dictionary(&mut self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            SessionError::DictionaryLoad(format!(
                "Unable to read enum type file '{}': {e}",
                path.display()
            ))
        })?;

        let mut current: Option<EnumTable> = None;
        let mut in_values = false;
        for line in text.lines() {
            let line = line.trim_end();
            if line.trim().is_empty() || line.trim_start().starts_with('!') {
                continue;
            }
            let cols = split_columns(line);
            let is_value_row = cols
                .first()
                .map(|c| c.parse::<u16>().is_ok())
                .unwrap_or(false);

            if is_value_row {
                let Some(table) = current.as_mut() else {
                    return Err(SessionError::DictionaryLoad(format!(
                        "Enum value row before any table header in '{}'",
                        path.display()
                    )));
                };
                let value = cols[0].parse::<u16>().unwrap_or_default();
                let display = cols.get(1).cloned().unwrap_or_default();
                table.values.push((value, display));
                in_values = true;
            } else {
                if cols.len() < 2 {
                    continue;
                }
                let fid: i16 = cols[1].parse().map_err(|_| {
                    SessionError::DictionaryLoad(format!(
                        "Malformed enum header fid '{}' in '{}'",
                        cols[1],
                        path.display()
                    ))
                })?;
                // A header row after value rows starts a new table.
                if in_values {
                    if let Some(done) = current.take() {
                        self.enum_tables.push(done);
                    }
                    in_values = false;
                }
                current.get_or_insert_with(EnumTable::default).fids.push(fid);
            }
        }
        if let Some(done) = current.take() {
            self.enum_tables.push(done);
        }

        if self.enum_tables.is_empty() {
            return Err(SessionError::DictionaryLoad(format!(
                "Enum type file '{}' contains no tables",
                path.display()
            )));
        }
        Ok(())
    }
}

/// Splits a dictionary line into columns, treating a quoted run as one
/// column (without the quotes).
fn split_columns(line: &str) -> Vec<String> {
    let mut cols = Vec::new();
    let mut rest = line.trim_start();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            cols.push(stripped[..end].to_string());
            rest = stripped[end..].strip_prefix('"').unwrap_or("").trim_start();
        } else {
            let end = rest
                .find(char::is_whitespace)
                .unwrap_or(rest.len());
            cols.push(rest[..end].to_string());
            rest = rest[end..].trim_start();
        }
    }
    cols
}
