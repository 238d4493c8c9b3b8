//! # SPSS System File Reader
//!
//! Reads `.sav` (and zlib-compressed `.zsav`) system files without any
//! external runtime. The file is memory-mapped; the dictionary is parsed once
//! on open and cases are decoded lazily, one record at a time, so a multi
//! gigabyte survey file can be streamed with a constant memory footprint.
//!
//! Supported layout:
//!
//! - File header (`$FL2` / `$FL3`), both byte orders, detected from the layout code.
//! - Variable records (type 2) with labels and missing-value specifications,
//!   including string continuation slots.
//! - Value labels (types 3 and 4), documents (type 6).
//! - Extension records (type 7): machine integer info (subtype 3), long
//!   variable names (subtype 13), 64-bit case count (subtype 16) and character
//!   encoding (subtype 20). Other subtypes are skipped.
//! - Case data: uncompressed, bytecode compressed, or zlib compressed.
//!
//! Declared user-missing values (discrete codes and ranges) decode as missing,
//! exactly like system-missing cells. Text is decoded with the file's declared
//! character set; files without one are read as UTF-8.
//!
//! Strings longer than 255 bytes are stored by SPSS as several segment
//! variables; they are exposed here as those segments.

use crate::shared::stats::canonical_key;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use flate2::read::ZlibDecoder;
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The value SPSS writes for a system-missing numeric cell.
pub const SYSMIS: f64 = -f64::MAX;

const HEADER_LEN: usize = 176;
const SLOT: usize = 8;

#[derive(Error, Debug)]
pub enum SavError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The SPSS file was not found at '{}'. Please check the path.", .0.display())]
    FileNotFound(PathBuf),
    #[error("Not an SPSS system file (bad magic or layout code).")]
    NotSystemFile,
    #[error("Unexpected end of file at byte {offset} while reading {what}.")]
    Truncated { offset: usize, what: &'static str },
    #[error("Unsupported dictionary record type {record_type} at byte {offset}.")]
    UnsupportedRecord { record_type: i32, offset: usize },
    #[error("Unsupported compression code {0}.")]
    UnsupportedCompression(i32),
    #[error("Variable '{0}' is not present in the SPSS file.")]
    VariableNotFound(String),
    #[error("Case {case} is corrupt: {reason}")]
    CorruptCase { case: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    fn i32(self, bytes: [u8; 4]) -> i32 {
        match self {
            Endian::Little => i32::from_le_bytes(bytes),
            Endian::Big => i32::from_be_bytes(bytes),
        }
    }

    fn i64(self, bytes: [u8; 8]) -> i64 {
        match self {
            Endian::Little => i64::from_le_bytes(bytes),
            Endian::Big => i64::from_be_bytes(bytes),
        }
    }

    fn f64(self, bytes: [u8; 8]) -> f64 {
        match self {
            Endian::Little => f64::from_le_bytes(bytes),
            Endian::Big => f64::from_be_bytes(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Bytecode,
    Zlib,
}

#[derive(Debug, Clone)]
pub struct SavHeader {
    pub product: String,
    pub endian: Endian,
    pub nominal_case_size: usize,
    pub compression: Compression,
    pub case_count: Option<usize>,
    pub bias: f64,
    pub creation_date: String,
    pub creation_time: String,
    pub file_label: String,
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub short_name: String,
    pub label: Option<String>,
    /// Zero for numeric variables, the declared byte width for strings.
    pub width: usize,
    pub missing: MissingValues,
    slots: usize,
}

impl Variable {
    pub fn is_numeric(&self) -> bool {
        self.width == 0
    }
}

/// User-missing declaration of one variable: up to three discrete codes, or a
/// closed numeric range plus at most one discrete code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissingValues {
    pub codes: Vec<Value>,
    pub range: Option<(f64, f64)>,
}

impl MissingValues {
    fn parse(
        count: i32,
        raw: &[[u8; 8]],
        numeric: bool,
        endian: Endian,
        codec: TextCodec,
    ) -> Self {
        let (range, discrete) = match raw {
            [low, high, rest @ ..] if count < 0 && numeric => {
                (Some((endian.f64(*low), endian.f64(*high))), rest)
            }
            _ => (None, raw),
        };
        let codes = discrete
            .iter()
            .map(|slot| {
                if numeric {
                    Value::Number(endian.f64(*slot))
                } else {
                    Value::Text(codec.decode(slot))
                }
            })
            .collect();
        Self { codes, range }
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty() && self.range.is_none()
    }

    /// Whether `value` is one of the declared missing values.
    pub fn covers(&self, value: &Value) -> bool {
        match value {
            Value::Number(number) if number.is_nan() => false,
            Value::Number(number) => {
                self.range
                    .is_some_and(|(low, high)| (low..=high).contains(number))
                    || self
                        .codes
                        .iter()
                        .any(|code| matches!(code, Value::Number(c) if c == number))
            }
            Value::Text(text) => {
                let text = text.trim_end();
                self.codes
                    .iter()
                    .any(|code| matches!(code, Value::Text(c) if c.trim_end() == text))
            }
        }
    }

    /// Replaces a declared missing value with the missing cell of its kind.
    fn mask(&self, value: Value) -> Value {
        if self.is_empty() || !self.covers(&value) {
            return value;
        }
        match value {
            Value::Number(_) => Value::Number(f64::NAN),
            Value::Text(_) => Value::Text(String::new()),
        }
    }
}

/// Character set of names, labels and string cells.
#[derive(Debug, Clone, Copy)]
struct TextCodec(&'static Encoding);

impl TextCodec {
    /// Subtype 20 names the encoding; older files only carry the code page in
    /// the machine integer record.
    fn resolve(label: Option<&str>, character_code: Option<i32>) -> Self {
        let named = label.and_then(|label| {
            let encoding = Encoding::for_label(label.trim().as_bytes());
            if encoding.is_none() {
                log::warn!("Unknown character encoding '{label}'; falling back to the code page.");
            }
            encoding
        });
        let from_code = character_code.and_then(|code| match code {
            65001 => Some(UTF_8),
            2 | 20127 => Some(WINDOWS_1252),
            code => Encoding::for_label(format!("windows-{code}").as_bytes())
                .or_else(|| Encoding::for_label(format!("cp{code}").as_bytes())),
        });
        Self(named.or(from_code).unwrap_or(UTF_8))
    }

    fn decode(self, raw: &[u8]) -> String {
        let (text, _) = self.0.decode_without_bom_handling(raw);
        text.trim_end_matches([' ', '\0']).to_string()
    }
}

/// A decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Numeric cell; system-missing is `NaN`.
    Number(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the cell; unparseable text is `NaN`.
    pub fn as_number(&self) -> f64 {
        match self {
            Value::Number(value) => *value,
            Value::Text(text) => text.trim().parse().unwrap_or(f64::NAN),
        }
    }

    /// Comparable key; `None` for missing cells.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Value::Number(value) if value.is_finite() => Some(canonical_key(*value)),
            Value::Number(_) => None,
            Value::Text(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
        }
    }

    /// CSV rendering: missing numbers are empty cells.
    pub fn to_field(&self, buffer: &mut ryu::Buffer) -> String {
        match self {
            Value::Number(value) if value.is_finite() => buffer.format(*value).to_string(),
            Value::Number(_) => String::new(),
            Value::Text(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValueLabels {
    pub variables: Vec<usize>,
    pub labels: Vec<(Value, String)>,
}

#[derive(Debug, Clone, Copy)]
struct ZBlock {
    compressed_offset: usize,
    compressed_size: usize,
}

pub struct SavFile {
    mmap: Mmap,
    header: SavHeader,
    variables: Vec<Variable>,
    value_labels: Vec<ValueLabels>,
    encoding: Option<String>,
    codec: TextCodec,
    data_offset: usize,
    zblocks: Vec<ZBlock>,
}

struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> ByteCursor<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], SavError> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(SavError::Truncated {
                offset: self.pos,
                what,
            }),
        }
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, SavError> {
        let raw = self.take(4, what)?;
        Ok(self.endian.i32([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn i64(&mut self, what: &'static str) -> Result<i64, SavError> {
        Ok(self.endian.i64(to_slot(self.take(SLOT, what)?)))
    }

    fn slot(&mut self, what: &'static str) -> Result<[u8; 8], SavError> {
        Ok(to_slot(self.take(SLOT, what)?))
    }

    fn count(&mut self, what: &'static str) -> Result<usize, SavError> {
        let offset = self.pos;
        let value = self.i32(what)?;
        usize::try_from(value).map_err(|_| SavError::Truncated { offset, what })
    }
}

fn to_slot(raw: &[u8]) -> [u8; 8] {
    let mut slot = [0u8; SLOT];
    slot.copy_from_slice(&raw[..SLOT]);
    slot
}

fn round_up(len: usize, multiple: usize) -> usize {
    len.div_ceil(multiple) * multiple
}

fn parse_header(bytes: &[u8]) -> Result<SavHeader, SavError> {
    if bytes.len() < HEADER_LEN {
        return Err(SavError::NotSystemFile);
    }
    let magic = &bytes[0..4];
    if magic != b"$FL2" && magic != b"$FL3" {
        return Err(SavError::NotSystemFile);
    }
    let layout = [bytes[64], bytes[65], bytes[66], bytes[67]];
    let endian = if matches!(i32::from_le_bytes(layout), 2 | 3) {
        Endian::Little
    } else if matches!(i32::from_be_bytes(layout), 2 | 3) {
        Endian::Big
    } else {
        return Err(SavError::NotSystemFile);
    };

    let mut cursor = ByteCursor {
        bytes,
        pos: 68,
        endian,
    };
    let nominal_case_size = cursor.i32("header case size")?;
    let compression = match cursor.i32("header compression")? {
        0 => Compression::None,
        1 => Compression::Bytecode,
        2 => Compression::Zlib,
        other => return Err(SavError::UnsupportedCompression(other)),
    };
    cursor.i32("header weight index")?;
    let case_count = cursor.i32("header case count")?;
    let bias = endian.f64(cursor.slot("header bias")?);

    // Re-decoded once the dictionary names the character set.
    let ascii = TextCodec(UTF_8);
    Ok(SavHeader {
        product: ascii.decode(&bytes[4..64]),
        endian,
        nominal_case_size: usize::try_from(nominal_case_size).unwrap_or(0),
        compression,
        case_count: usize::try_from(case_count).ok(),
        bias,
        creation_date: ascii.decode(&bytes[92..101]),
        creation_time: ascii.decode(&bytes[101..109]),
        file_label: ascii.decode(&bytes[109..173]),
    })
}

struct Dictionary {
    variables: Vec<Variable>,
    value_labels: Vec<ValueLabels>,
    encoding: Option<String>,
    codec: TextCodec,
    case_count: Option<usize>,
    data_offset: usize,
}

/// Variable record with its text still undecoded.
struct RawVariable<'a> {
    short_name: &'a [u8],
    label: Option<&'a [u8]>,
    width: usize,
    missing_count: i32,
    missing: Vec<[u8; 8]>,
    slots: usize,
}

/// Value label record with its text still undecoded.
struct RawLabels<'a> {
    values: Vec<[u8; 8]>,
    texts: Vec<&'a [u8]>,
    slots: Vec<usize>,
}

fn parse_dictionary(bytes: &[u8], endian: Endian) -> Result<Dictionary, SavError> {
    let mut cursor = ByteCursor {
        bytes,
        pos: HEADER_LEN,
        endian,
    };
    let mut raw_variables: Vec<RawVariable<'_>> = Vec::new();
    // Maps a 0-based dictionary slot to the variable that owns it.
    let mut slot_owner: Vec<usize> = Vec::new();
    let mut raw_labels: Vec<RawLabels<'_>> = Vec::new();
    let mut long_names: Option<&[u8]> = None;
    let mut encoding = None;
    let mut character_code = None;
    let mut case_count = None;

    loop {
        let offset = cursor.pos;
        let record_type = cursor.i32("record type")?;
        match record_type {
            2 => {
                let kind = cursor.i32("variable type")?;
                let has_label = cursor.i32("variable label flag")?;
                let missing_count = cursor.i32("missing value count")?;
                cursor.i32("print format")?;
                cursor.i32("write format")?;
                let short_name = cursor.take(8, "variable name")?;
                let label = if has_label == 1 {
                    let len = cursor.count("variable label length")?;
                    let raw = cursor.take(round_up(len, 4), "variable label")?;
                    Some(&raw[..len])
                } else {
                    None
                };
                let missing_slots = missing_count.unsigned_abs() as usize;
                let missing = (0..missing_slots)
                    .map(|_| cursor.slot("missing values"))
                    .collect::<Result<Vec<_>, _>>()?;

                if kind == -1 {
                    // Continuation slot of the preceding string variable.
                    if let Some(owner) = raw_variables.last_mut() {
                        owner.slots += 1;
                        slot_owner.push(raw_variables.len() - 1);
                    }
                    continue;
                }
                slot_owner.push(raw_variables.len());
                raw_variables.push(RawVariable {
                    short_name,
                    label,
                    width: usize::try_from(kind).unwrap_or(0),
                    missing_count,
                    missing,
                    slots: 1,
                });
            }
            3 => {
                let count = cursor.count("value label count")?;
                let mut values = Vec::with_capacity(count);
                let mut texts = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(cursor.slot("value label value")?);
                    let len = cursor.take(1, "value label length")?[0] as usize;
                    let padded = round_up(len + 1, SLOT) - 1;
                    let raw = cursor.take(padded, "value label text")?;
                    texts.push(&raw[..len]);
                }
                let follow_offset = cursor.pos;
                if cursor.i32("value label variables record")? != 4 {
                    return Err(SavError::UnsupportedRecord {
                        record_type: 3,
                        offset: follow_offset,
                    });
                }
                let var_count = cursor.count("value label variable count")?;
                let mut slots = Vec::with_capacity(var_count);
                for _ in 0..var_count {
                    let index = cursor.count("value label variable index")?;
                    slots.push(index.saturating_sub(1));
                }
                raw_labels.push(RawLabels {
                    values,
                    texts,
                    slots,
                });
            }
            6 => {
                let lines = cursor.count("document line count")?;
                cursor.take(lines * 80, "document lines")?;
            }
            7 => {
                let subtype = cursor.i32("extension subtype")?;
                let size = cursor.count("extension element size")?;
                let count = cursor.count("extension element count")?;
                let payload = cursor.take(size * count, "extension payload")?;
                match subtype {
                    3 if payload.len() >= 32 => {
                        let code = [payload[28], payload[29], payload[30], payload[31]];
                        character_code = Some(endian.i32(code));
                    }
                    13 => long_names = Some(payload),
                    16 if payload.len() >= 16 => {
                        let cases = endian.i64(to_slot(&payload[8..16]));
                        case_count = usize::try_from(cases).ok();
                    }
                    20 => encoding = Some(TextCodec(UTF_8).decode(payload)),
                    _ => {}
                }
            }
            999 => {
                cursor.i32("dictionary terminator filler")?;
                break;
            }
            other => {
                return Err(SavError::UnsupportedRecord {
                    record_type: other,
                    offset,
                });
            }
        }
    }

    let codec = TextCodec::resolve(encoding.as_deref(), character_code);
    let mut variables: Vec<Variable> = raw_variables
        .into_iter()
        .map(|raw| {
            let short_name = codec.decode(raw.short_name);
            Variable {
                name: short_name.clone(),
                short_name,
                label: raw.label.map(|label| codec.decode(label)),
                width: raw.width,
                missing: MissingValues::parse(
                    raw.missing_count,
                    &raw.missing,
                    raw.width == 0,
                    endian,
                    codec,
                ),
                slots: raw.slots,
            }
        })
        .collect();
    if let Some(payload) = long_names {
        apply_long_names(&mut variables, &codec.decode(payload));
    }

    let mut value_labels = Vec::with_capacity(raw_labels.len());
    for raw in raw_labels {
        let targets: Vec<usize> = raw
            .slots
            .iter()
            .filter_map(|slot| slot_owner.get(*slot).copied())
            .collect();
        let numeric = targets
            .first()
            .is_none_or(|&index| variables[index].is_numeric());
        let labels = raw
            .values
            .into_iter()
            .zip(raw.texts)
            .map(|(value, text)| {
                let value = if numeric {
                    Value::Number(endian.f64(value))
                } else {
                    Value::Text(codec.decode(&value))
                };
                (value, codec.decode(text))
            })
            .collect();
        value_labels.push(ValueLabels {
            variables: targets,
            labels,
        });
    }

    Ok(Dictionary {
        variables,
        value_labels,
        encoding,
        codec,
        case_count,
        data_offset: cursor.pos,
    })
}

fn apply_long_names(variables: &mut [Variable], text: &str) {
    for pair in text.split('\t') {
        let Some((short, long)) = pair.split_once('=') else {
            continue;
        };
        let short = short.trim();
        if let Some(variable) = variables
            .iter_mut()
            .find(|v| v.short_name.eq_ignore_ascii_case(short))
        {
            variable.name = long.trim_end_matches(['\0', ' ']).to_string();
        }
    }
}

fn parse_zlib_blocks(
    bytes: &[u8],
    data_offset: usize,
    endian: Endian,
) -> Result<Vec<ZBlock>, SavError> {
    let mut cursor = ByteCursor {
        bytes,
        pos: data_offset,
        endian,
    };
    cursor.i64("zlib header offset")?;
    let trailer_offset = cursor.i64("zlib trailer offset")?;
    cursor.i64("zlib trailer length")?;

    let mut trailer = ByteCursor {
        bytes,
        pos: usize::try_from(trailer_offset).map_err(|_| SavError::Truncated {
            offset: data_offset,
            what: "zlib trailer offset",
        })?,
        endian,
    };
    trailer.i64("zlib trailer bias")?;
    trailer.i64("zlib trailer zero")?;
    trailer.i32("zlib block size")?;
    let block_count = trailer.count("zlib block count")?;
    let mut blocks = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        trailer.i64("zlib uncompressed offset")?;
        let compressed_offset = trailer.i64("zlib compressed offset")?;
        trailer.i32("zlib uncompressed size")?;
        let compressed_size = trailer.count("zlib compressed size")?;
        blocks.push(ZBlock {
            compressed_offset: usize::try_from(compressed_offset).unwrap_or(usize::MAX),
            compressed_size,
        });
    }
    Ok(blocks)
}

impl SavFile {
    pub fn open(path: &Path) -> Result<Self, SavError> {
        if !path.exists() {
            return Err(SavError::FileNotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and the file is not modified while mapped.
        let mmap = unsafe { Mmap::map(&file)? };

        let mut header = parse_header(&mmap)?;
        let dictionary = parse_dictionary(&mmap, header.endian)?;
        if dictionary.case_count.is_some() {
            header.case_count = dictionary.case_count;
        }
        header.file_label = dictionary.codec.decode(&mmap[109..173]);
        let zblocks = if header.compression == Compression::Zlib {
            parse_zlib_blocks(&mmap, dictionary.data_offset, header.endian)?
        } else {
            Vec::new()
        };

        log::info!(
            "Opened SPSS file '{}': {} variables, {} cases, {:?} compression",
            path.display(),
            dictionary.variables.len(),
            header
                .case_count
                .map_or_else(|| "unknown".to_string(), |n| n.to_string()),
            header.compression
        );

        Ok(Self {
            mmap,
            header,
            variables: dictionary.variables,
            value_labels: dictionary.value_labels,
            encoding: dictionary.encoding,
            codec: dictionary.codec,
            data_offset: dictionary.data_offset,
            zblocks,
        })
    }

    pub fn header(&self) -> &SavHeader {
        &self.header
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    pub fn case_count(&self) -> Option<usize> {
        self.header.case_count
    }

    pub fn variable_index(&self, name: &str) -> Result<usize, SavError> {
        self.variables
            .iter()
            .position(|variable| variable.name == name)
            .ok_or_else(|| SavError::VariableNotFound(name.to_string()))
    }

    /// Value labels attached to the variable at `index`, if any.
    pub fn value_labels(&self, index: usize) -> Option<&[(Value, String)]> {
        self.value_labels
            .iter()
            .find(|set| set.variables.contains(&index))
            .map(|set| set.labels.as_slice())
    }

    /// Streams every case in file order.
    pub fn records(&self) -> RecordIter<'_> {
        let source = match self.header.compression {
            Compression::Zlib => SlotSource::Zlib {
                file: &self.mmap,
                blocks: self.zblocks.clone(),
                next_block: 0,
                buffer: Vec::new(),
                pos: 0,
            },
            Compression::None | Compression::Bytecode => SlotSource::Plain {
                bytes: &self.mmap[self.data_offset..],
                pos: 0,
            },
        };
        RecordIter {
            decoder: CaseDecoder::new(
                source,
                self.header.compression,
                self.header.bias,
                self.header.endian,
            ),
            variables: &self.variables,
            codec: self.codec,
            case: 0,
            limit: self.header.case_count,
        }
    }

    /// Reads the named columns into memory, column-major.
    pub fn read_columns(&self, names: &[&str]) -> Result<Vec<Vec<Value>>, SavError> {
        let indices = names
            .iter()
            .map(|name| self.variable_index(name))
            .collect::<Result<Vec<_>, _>>()?;
        let mut columns: Vec<Vec<Value>> = vec![Vec::new(); indices.len()];
        for record in self.records() {
            let mut record = record?;
            for (column, &index) in columns.iter_mut().zip(&indices) {
                column.push(std::mem::replace(
                    &mut record[index],
                    Value::Number(f64::NAN),
                ));
            }
        }
        Ok(columns)
    }
}

/// Producer of raw 8-byte slots from the data section.
enum SlotSource<'a> {
    Plain {
        bytes: &'a [u8],
        pos: usize,
    },
    Zlib {
        file: &'a [u8],
        blocks: Vec<ZBlock>,
        next_block: usize,
        buffer: Vec<u8>,
        pos: usize,
    },
}

impl SlotSource<'_> {
    fn next_chunk(&mut self) -> Result<Option<[u8; 8]>, SavError> {
        match self {
            SlotSource::Plain { bytes, pos } => {
                if *pos + SLOT > bytes.len() {
                    return Ok(None);
                }
                let chunk = to_slot(&bytes[*pos..*pos + SLOT]);
                *pos += SLOT;
                Ok(Some(chunk))
            }
            SlotSource::Zlib {
                file,
                blocks,
                next_block,
                buffer,
                pos,
            } => loop {
                if *pos + SLOT <= buffer.len() {
                    let chunk = to_slot(&buffer[*pos..*pos + SLOT]);
                    *pos += SLOT;
                    return Ok(Some(chunk));
                }
                let Some(block) = blocks.get(*next_block).copied() else {
                    return Ok(None);
                };
                *next_block += 1;
                let end = block
                    .compressed_offset
                    .checked_add(block.compressed_size)
                    .filter(|&end| end <= file.len())
                    .ok_or(SavError::Truncated {
                        offset: block.compressed_offset,
                        what: "zlib block",
                    })?;
                buffer.drain(..*pos);
                *pos = 0;
                let mut decoder = ZlibDecoder::new(&file[block.compressed_offset..end]);
                decoder.read_to_end(buffer)?;
            },
        }
    }
}

enum Slot {
    Raw([u8; 8]),
    Number(f64),
    Spaces,
    Missing,
}

struct CaseDecoder<'a> {
    source: SlotSource<'a>,
    compressed: bool,
    bias: f64,
    endian: Endian,
    codes: [u8; 8],
    code_pos: usize,
    finished: bool,
}

impl<'a> CaseDecoder<'a> {
    fn new(source: SlotSource<'a>, compression: Compression, bias: f64, endian: Endian) -> Self {
        Self {
            source,
            compressed: compression != Compression::None,
            bias,
            endian,
            codes: [0; 8],
            code_pos: SLOT,
            finished: false,
        }
    }

    fn next_slot(&mut self) -> Result<Option<Slot>, SavError> {
        if !self.compressed {
            return Ok(self.source.next_chunk()?.map(Slot::Raw));
        }
        loop {
            if self.finished {
                return Ok(None);
            }
            if self.code_pos == SLOT {
                match self.source.next_chunk()? {
                    Some(codes) => {
                        self.codes = codes;
                        self.code_pos = 0;
                    }
                    None => return Ok(None),
                }
            }
            let code = self.codes[self.code_pos];
            self.code_pos += 1;
            match code {
                0 => continue,
                1..=251 => return Ok(Some(Slot::Number(f64::from(code) - self.bias))),
                252 => {
                    self.finished = true;
                    return Ok(None);
                }
                253 => {
                    return match self.source.next_chunk()? {
                        Some(raw) => Ok(Some(Slot::Raw(raw))),
                        None => Err(SavError::Truncated {
                            offset: 0,
                            what: "uncompressed slot after bytecode 253",
                        }),
                    };
                }
                254 => return Ok(Some(Slot::Spaces)),
                _ => return Ok(Some(Slot::Missing)),
            }
        }
    }

    fn numeric(&self, slot: Slot) -> f64 {
        match slot {
            Slot::Raw(raw) => {
                let value = self.endian.f64(raw);
                if value == SYSMIS { f64::NAN } else { value }
            }
            Slot::Number(value) => value,
            Slot::Spaces | Slot::Missing => f64::NAN,
        }
    }
}

/// Iterator over decoded cases. Each item holds one value per variable.
pub struct RecordIter<'a> {
    decoder: CaseDecoder<'a>,
    variables: &'a [Variable],
    codec: TextCodec,
    case: usize,
    limit: Option<usize>,
}

impl RecordIter<'_> {
    fn corrupt(&self, reason: &str) -> SavError {
        SavError::CorruptCase {
            case: self.case,
            reason: reason.to_string(),
        }
    }

    fn read_case(&mut self) -> Result<Option<Vec<Value>>, SavError> {
        let mut values = Vec::with_capacity(self.variables.len());
        let mut first_slot = true;
        for variable in self.variables {
            if variable.is_numeric() {
                match self.decoder.next_slot()? {
                    Some(slot) => {
                        let value = Value::Number(self.decoder.numeric(slot));
                        values.push(variable.missing.mask(value));
                    }
                    None if first_slot => return Ok(None),
                    None => return Err(self.corrupt("data ended mid-case")),
                }
                first_slot = false;
                continue;
            }
            let mut bytes = Vec::with_capacity(variable.slots * SLOT);
            for _ in 0..variable.slots {
                match self.decoder.next_slot()? {
                    Some(Slot::Raw(raw)) => bytes.extend_from_slice(&raw),
                    Some(Slot::Spaces) | Some(Slot::Missing) => bytes.extend_from_slice(b"        "),
                    Some(Slot::Number(_)) => {
                        return Err(self.corrupt("numeric bytecode inside a string variable"));
                    }
                    None if first_slot => return Ok(None),
                    None => return Err(self.corrupt("data ended mid-case")),
                }
                first_slot = false;
            }
            bytes.truncate(variable.width);
            let value = Value::Text(self.codec.decode(&bytes));
            values.push(variable.missing.mask(value));
        }
        Ok(Some(values))
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<Vec<Value>, SavError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.limit.is_some_and(|limit| self.case >= limit) {
            return None;
        }
        match self.read_case() {
            Ok(Some(values)) => {
                self.case += 1;
                Some(Ok(values))
            }
            Ok(None) => None,
            Err(err) => {
                // A corrupt case ends the stream.
                self.limit = Some(self.case);
                Some(Err(err))
            }
        }
    }
}
