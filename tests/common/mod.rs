//! Writes small SPSS system files for the integration tests.
//!
//! Only the records the reader needs are produced: the header, variable
//! records (one slot per variable, strings up to eight bytes) with their
//! user-missing declarations, value labels, the long-name and encoding
//! extensions, and the case data in any of the three compression modes.
//! Text is written as given, so callers choose its byte encoding.

use flate2::Compression as Level;
use flate2::write::ZlibEncoder;
use std::fs;
use std::io::Write;
use std::path::Path;

pub const BIAS: f64 = 100.0;
pub const SYSMIS: f64 = -f64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Plain,
    Bytecode,
    Zlib,
}

#[derive(Clone)]
pub enum Cell {
    Num(f64),
    Text(Vec<u8>),
}

pub struct Column {
    pub name: String,
    pub label: Option<Vec<u8>>,
    /// Zero for numeric columns, otherwise the string width (at most 8).
    pub width: usize,
    pub value_labels: Vec<(f64, String)>,
    /// Declared discrete missing values.
    pub missing: Vec<Cell>,
    pub missing_range: Option<(f64, f64)>,
    pub cells: Vec<Cell>,
}

impl Column {
    pub fn numeric(name: &str, values: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            label: None,
            width: 0,
            value_labels: Vec::new(),
            missing: Vec::new(),
            missing_range: None,
            cells: values.iter().map(|&v| Cell::Num(v)).collect(),
        }
    }

    pub fn text(name: &str, width: usize, values: &[&str]) -> Self {
        let bytes: Vec<&[u8]> = values.iter().map(|v| v.as_bytes()).collect();
        Self::encoded_text(name, width, &bytes)
    }

    /// String column whose cells are already encoded.
    pub fn encoded_text(name: &str, width: usize, values: &[&[u8]]) -> Self {
        Self {
            name: name.to_string(),
            label: None,
            width,
            value_labels: Vec::new(),
            missing: Vec::new(),
            missing_range: None,
            cells: values.iter().map(|v| Cell::Text(v.to_vec())).collect(),
        }
    }

    pub fn labelled(self, label: &str) -> Self {
        self.encoded_label(label.as_bytes())
    }

    pub fn encoded_label(mut self, label: &[u8]) -> Self {
        self.label = Some(label.to_vec());
        self
    }

    pub fn with_missing_codes(mut self, codes: &[f64]) -> Self {
        self.missing = codes.iter().map(|&c| Cell::Num(c)).collect();
        self
    }

    pub fn with_missing_text(mut self, codes: &[&str]) -> Self {
        self.missing = codes.iter().map(|c| Cell::Text(c.as_bytes().to_vec())).collect();
        self
    }

    pub fn with_missing_range(mut self, low: f64, high: f64) -> Self {
        self.missing_range = Some((low, high));
        self
    }

    pub fn with_value_labels(mut self, labels: &[(f64, &str)]) -> Self {
        self.value_labels = labels.iter().map(|(v, l)| (*v, l.to_string())).collect();
        self
    }
}

fn padded(text: &str, len: usize) -> Vec<u8> {
    padded_bytes(text.as_bytes(), len)
}

fn padded_bytes(text: &[u8], len: usize) -> Vec<u8> {
    let mut bytes = text.to_vec();
    bytes.resize(len, b' ');
    bytes
}

fn push_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_f64(out: &mut Vec<u8>, value: f64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn header(columns: &[Column], cases: usize, mode: Mode) -> Vec<u8> {
    let mut out = Vec::with_capacity(176);
    out.extend_from_slice(if mode == Mode::Zlib { b"$FL3" } else { b"$FL2" });
    out.extend_from_slice(&padded("@(#) SPSS DATA FILE test writer", 60));
    push_i32(&mut out, 2);
    push_i32(&mut out, columns.len() as i32);
    push_i32(
        &mut out,
        match mode {
            Mode::Plain => 0,
            Mode::Bytecode => 1,
            Mode::Zlib => 2,
        },
    );
    push_i32(&mut out, 0);
    push_i32(&mut out, cases as i32);
    push_f64(&mut out, BIAS);
    out.extend_from_slice(&padded("19 Oct 26", 9));
    out.extend_from_slice(&padded("10:00:00", 8));
    out.extend_from_slice(&padded("synthetic survey", 64));
    out.extend_from_slice(&[0, 0, 0]);
    out
}

fn short_name(index: usize) -> String {
    format!("V{index:07}")
}

fn dictionary(columns: &[Column], encoding: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for (index, column) in columns.iter().enumerate() {
        let discrete = column.missing.len() as i32;
        let missing_count = match column.missing_range {
            Some(_) => -(2 + discrete),
            None => discrete,
        };
        push_i32(&mut out, 2);
        push_i32(&mut out, column.width as i32);
        push_i32(&mut out, i32::from(column.label.is_some()));
        push_i32(&mut out, missing_count);
        push_i32(&mut out, 0x050802);
        push_i32(&mut out, 0x050802);
        out.extend_from_slice(&padded(&short_name(index), 8));
        if let Some(label) = &column.label {
            push_i32(&mut out, label.len() as i32);
            out.extend_from_slice(&padded_bytes(label, label.len().div_ceil(4) * 4));
        }
        if let Some((low, high)) = column.missing_range {
            push_f64(&mut out, low);
            push_f64(&mut out, high);
        }
        for code in &column.missing {
            out.extend_from_slice(&raw_slot(code));
        }
    }

    for (index, column) in columns.iter().enumerate() {
        if column.value_labels.is_empty() {
            continue;
        }
        push_i32(&mut out, 3);
        push_i32(&mut out, column.value_labels.len() as i32);
        for (value, label) in &column.value_labels {
            push_f64(&mut out, *value);
            out.push(label.len() as u8);
            out.extend_from_slice(&padded(label, (label.len() + 1).div_ceil(8) * 8 - 1));
        }
        push_i32(&mut out, 4);
        push_i32(&mut out, 1);
        push_i32(&mut out, index as i32 + 1);
    }

    let long_names = columns
        .iter()
        .enumerate()
        .map(|(index, column)| format!("{}={}", short_name(index), column.name))
        .collect::<Vec<_>>()
        .join("\t");
    push_i32(&mut out, 7);
    push_i32(&mut out, 13);
    push_i32(&mut out, 1);
    push_i32(&mut out, long_names.len() as i32);
    out.extend_from_slice(long_names.as_bytes());

    push_i32(&mut out, 7);
    push_i32(&mut out, 20);
    push_i32(&mut out, 1);
    push_i32(&mut out, encoding.len() as i32);
    out.extend_from_slice(encoding.as_bytes());

    push_i32(&mut out, 999);
    push_i32(&mut out, 0);
    out
}

fn raw_slot(cell: &Cell) -> [u8; 8] {
    match cell {
        Cell::Num(value) if value.is_nan() => SYSMIS.to_le_bytes(),
        Cell::Num(value) => value.to_le_bytes(),
        Cell::Text(text) => {
            let mut slot = [b' '; 8];
            slot[..text.len()].copy_from_slice(text);
            slot
        }
    }
}

fn plain_data(columns: &[Column], cases: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for case in 0..cases {
        for column in columns {
            out.extend_from_slice(&raw_slot(&column.cells[case]));
        }
    }
    out
}

/// Bytecode stream: blocks of eight command bytes, each followed by the raw
/// slots its 253 codes refer to.
fn bytecode_data(columns: &[Column], cases: usize) -> Vec<u8> {
    let mut commands: Vec<(u8, Option<[u8; 8]>)> = Vec::new();
    for case in 0..cases {
        for column in columns {
            let cell = &column.cells[case];
            let command = match cell {
                Cell::Num(value) if value.is_nan() => (255, None),
                Cell::Num(value)
                    if value.fract() == 0.0 && (1.0..=251.0).contains(&(value + BIAS)) =>
                {
                    ((value + BIAS) as u8, None)
                }
                Cell::Text(text) if text.iter().all(|b| *b == b' ') => (254, None),
                other => (253, Some(raw_slot(other))),
            };
            commands.push(command);
        }
    }
    commands.push((252, None));

    let mut out = Vec::new();
    for block in commands.chunks(8) {
        let mut codes = [0u8; 8];
        for (slot, (code, _)) in codes.iter_mut().zip(block) {
            *slot = *code;
        }
        out.extend_from_slice(&codes);
        for (_, raw) in block {
            if let Some(raw) = raw {
                out.extend_from_slice(raw);
            }
        }
    }
    out
}

fn zlib_data(columns: &[Column], cases: usize, data_offset: usize) -> Vec<u8> {
    let uncompressed = bytecode_data(columns, cases);
    let mut encoder = ZlibEncoder::new(Vec::new(), Level::default());
    encoder
        .write_all(&uncompressed)
        .expect("in-memory zlib write");
    let compressed = encoder.finish().expect("in-memory zlib finish");

    let zheader_len = 24;
    let block_offset = data_offset + zheader_len;
    let trailer_offset = block_offset + compressed.len();
    let trailer_len = 24 + 24;

    let mut out = Vec::new();
    push_i64(&mut out, data_offset as i64);
    push_i64(&mut out, trailer_offset as i64);
    push_i64(&mut out, trailer_len as i64);
    out.extend_from_slice(&compressed);

    push_i64(&mut out, -(BIAS as i64));
    push_i64(&mut out, 0);
    push_i32(&mut out, 0x3ff000);
    push_i32(&mut out, 1);
    push_i64(&mut out, data_offset as i64);
    push_i64(&mut out, block_offset as i64);
    push_i32(&mut out, uncompressed.len() as i32);
    push_i32(&mut out, compressed.len() as i32);
    out
}

/// Writes `columns` to `path` as a UTF-8 file. Every column must hold the
/// same number of cells.
pub fn write_sav(path: &Path, columns: &[Column], mode: Mode) {
    write_sav_encoded(path, columns, mode, "UTF-8");
}

/// Like [`write_sav`], declaring `encoding` in the character-set extension.
pub fn write_sav_encoded(path: &Path, columns: &[Column], mode: Mode, encoding: &str) {
    let cases = columns.first().map_or(0, |c| c.cells.len());
    assert!(columns.iter().all(|c| c.cells.len() == cases));
    assert!(columns.iter().all(|c| c.width <= 8));

    let mut bytes = header(columns, cases, mode);
    bytes.extend(dictionary(columns, encoding));
    let data_offset = bytes.len();
    let data = match mode {
        Mode::Plain => plain_data(columns, cases),
        Mode::Bytecode => bytecode_data(columns, cases),
        Mode::Zlib => zlib_data(columns, cases, data_offset),
    };
    bytes.extend(data);
    fs::write(path, bytes).expect("write synthetic sav file");
}
