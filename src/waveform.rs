//! Waveform descriptors and sample decoding.
//!
//! Raw descriptor text is typed through a static per-vendor field table.
//! Samples are reinterpreted as fixed-width integers and converted to
//! physical units with the vendor's affine formula.

use crate::protocol::Vendor;
use crate::{DaqError, Result};
use ndarray::{s, Array2};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Float,
    Str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Str(String),
}

pub type FieldMap = BTreeMap<String, FieldValue>;

/// Vendor A descriptor fields, each fetched with its own attribute query.
pub const LECROY_FIELDS: &[(&str, FieldKind)] = &[
    ("WAVE_SOURCE", FieldKind::Str),
    ("COMM_TYPE", FieldKind::Str),
    ("COMM_ORDER", FieldKind::Str),
    ("WAVE_ARRAY_COUNT", FieldKind::Int),
    ("SUBARRAY_COUNT", FieldKind::Int),
    ("NOMINAL_BITS", FieldKind::Int),
    ("VERTICAL_GAIN", FieldKind::Float),
    ("VERTICAL_OFFSET", FieldKind::Float),
    ("VERTUNIT", FieldKind::Str),
    ("HORIZ_INTERVAL", FieldKind::Float),
    ("HORIZ_OFFSET", FieldKind::Float),
    ("HORUNIT", FieldKind::Str),
];

/// Vendor B preamble fields (`WFMPRE?`).
pub const TEKTRONIX_FIELDS: &[(&str, FieldKind)] = &[
    ("BYT_NR", FieldKind::Int),
    ("BIT_NR", FieldKind::Int),
    ("ENCDG", FieldKind::Str),
    ("BN_FMT", FieldKind::Str),
    ("BYT_OR", FieldKind::Str),
    ("NR_PT", FieldKind::Int),
    ("WFID", FieldKind::Str),
    ("PT_FMT", FieldKind::Str),
    ("XINCR", FieldKind::Float),
    ("PT_OFF", FieldKind::Int),
    ("XZERO", FieldKind::Float),
    ("XUNIT", FieldKind::Str),
    ("YMULT", FieldKind::Float),
    ("YZERO", FieldKind::Float),
    ("YOFF", FieldKind::Float),
    ("YUNIT", FieldKind::Str),
    ("NR_FR", FieldKind::Int),
];

/// Split a `KEY VALUE;KEY VALUE` preamble reply into pairs.
///
/// A leading `:WFMPRE:` header (present when headers are enabled) is dropped.
pub fn split_preamble(reply: &str) -> Result<Vec<(String, String)>> {
    let body = reply.trim();
    let body = match body.get(..8) {
        Some(prefix) if prefix.eq_ignore_ascii_case(":WFMPRE:") => &body[8..],
        _ => body,
    };
    body.split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (key, value) = item
                .split_once(' ')
                .ok_or_else(|| DaqError::descriptor(item, "missing value"))?;
            Ok((key.trim().to_ascii_uppercase(), value.trim().to_string()))
        })
        .collect()
}

/// Type every raw field through `table`. Unknown keys are rejected.
pub fn parse_descriptor(
    table: &[(&str, FieldKind)],
    raw_fields: &[(String, String)],
) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    for (key, raw) in raw_fields {
        let kind = table
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, kind)| *kind)
            .ok_or_else(|| DaqError::descriptor(key, "unknown field"))?;
        let raw = raw.trim();
        let value = match kind {
            FieldKind::Int => raw
                .parse::<i64>()
                .ok()
                .or_else(|| {
                    raw.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite() && f.fract() == 0.0)
                        .map(|f| f as i64)
                })
                .map(FieldValue::Int)
                .ok_or_else(|| DaqError::descriptor(key, format!("'{raw}' is not an integer")))?,
            FieldKind::Float => raw
                .parse::<f64>()
                .map(FieldValue::Float)
                .map_err(|_| DaqError::descriptor(key, format!("'{raw}' is not a number")))?,
            FieldKind::Str => FieldValue::Str(raw.trim_matches('"').to_string()),
        };
        fields.insert(key.to_ascii_uppercase(), value);
    }
    Ok(fields)
}

fn int_field(fields: &FieldMap, key: &str) -> Result<i64> {
    match fields.get(key) {
        Some(FieldValue::Int(v)) => Ok(*v),
        Some(_) => Err(DaqError::descriptor(key, "expected an integer")),
        None => Err(DaqError::descriptor(key, "missing")),
    }
}

fn float_field(fields: &FieldMap, key: &str) -> Result<f64> {
    match fields.get(key) {
        Some(FieldValue::Float(v)) => Ok(*v),
        Some(FieldValue::Int(v)) => Ok(*v as f64),
        Some(_) => Err(DaqError::descriptor(key, "expected a number")),
        None => Err(DaqError::descriptor(key, "missing")),
    }
}

fn str_field<'a>(fields: &'a FieldMap, key: &str) -> Result<&'a str> {
    match fields.get(key) {
        Some(FieldValue::Str(v)) => Ok(v.as_str()),
        Some(_) => Err(DaqError::descriptor(key, "expected a string")),
        None => Err(DaqError::descriptor(key, "missing")),
    }
}

fn non_negative(key: &str, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| DaqError::descriptor(key, format!("{value} is negative")))
}

/// How raw integers become physical values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltageConversion {
    /// `raw * gain - offset`
    GainMinusOffset,
    /// `zero + (raw - offset) * gain`
    ZeroPlusScaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLayout {
    pub byte_width: usize,
    pub signed: bool,
    pub byte_order: ByteOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDtype {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
}

impl SampleLayout {
    pub fn dtype(&self) -> SampleDtype {
        match (self.byte_width, self.signed) {
            (1, true) => SampleDtype::I8,
            (1, false) => SampleDtype::U8,
            (2, true) => SampleDtype::I16,
            (2, false) => SampleDtype::U16,
            (_, true) => SampleDtype::I32,
            (_, false) => SampleDtype::U32,
        }
    }
}

/// Per-channel metadata describing one transferred block.
///
/// `sample_count` is the length of the whole block; in sequence mode it holds
/// `sequence_count` events back to back.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformDescriptor {
    pub vendor: Vendor,
    pub sample_count: usize,
    pub byte_width: usize,
    pub number_format: String,
    pub byte_order: String,
    pub vertical_gain: f64,
    pub vertical_offset: f64,
    pub vertical_zero: f64,
    pub horizontal_interval: f64,
    pub horizontal_offset: f64,
    pub sample_reference_offset: i64,
    pub sequence_count: Option<usize>,
    pub conversion: VoltageConversion,
    pub fields: FieldMap,
}

impl WaveformDescriptor {
    /// Build a vendor A descriptor. LeCroy transmits two's complement samples
    /// whose width follows `COMM_TYPE`.
    pub fn lecroy(fields: FieldMap, sequence_count: usize) -> Result<Self> {
        let comm_type = str_field(&fields, "COMM_TYPE")?;
        let byte_width = if comm_type.eq_ignore_ascii_case("byte") {
            1
        } else if comm_type.eq_ignore_ascii_case("word") {
            2
        } else {
            return Err(DaqError::unsupported("COMM_TYPE", comm_type));
        };

        let desc = Self {
            vendor: Vendor::LeCroy,
            sample_count: non_negative(
                "WAVE_ARRAY_COUNT",
                int_field(&fields, "WAVE_ARRAY_COUNT")?,
            )?,
            byte_width,
            number_format: "SIGNED".to_string(),
            byte_order: str_field(&fields, "COMM_ORDER")?.to_string(),
            vertical_gain: float_field(&fields, "VERTICAL_GAIN")?,
            vertical_offset: float_field(&fields, "VERTICAL_OFFSET")?,
            vertical_zero: 0.0,
            horizontal_interval: float_field(&fields, "HORIZ_INTERVAL")?,
            horizontal_offset: float_field(&fields, "HORIZ_OFFSET")?,
            sample_reference_offset: 0,
            sequence_count: None,
            conversion: VoltageConversion::GainMinusOffset,
            fields,
        };
        desc.with_sequence(sequence_count)
    }

    /// Build a vendor B descriptor. `NR_PT` is the per-frame record length, so
    /// the block holds `NR_PT * sequence_count` samples in fastframe mode.
    pub fn tektronix(fields: FieldMap, sequence_count: usize) -> Result<Self> {
        let record = non_negative("NR_PT", int_field(&fields, "NR_PT")?)?;
        let desc = Self {
            vendor: Vendor::Tektronix,
            sample_count: record * sequence_count.max(1),
            byte_width: non_negative("BYT_NR", int_field(&fields, "BYT_NR")?)?,
            number_format: str_field(&fields, "BN_FMT")?.to_string(),
            byte_order: str_field(&fields, "BYT_OR")?.to_string(),
            vertical_gain: float_field(&fields, "YMULT")?,
            vertical_offset: float_field(&fields, "YOFF")?,
            vertical_zero: float_field(&fields, "YZERO")?,
            horizontal_interval: float_field(&fields, "XINCR")?,
            horizontal_offset: float_field(&fields, "XZERO")?,
            sample_reference_offset: int_field(&fields, "PT_OFF")?,
            sequence_count: None,
            conversion: VoltageConversion::ZeroPlusScaled,
            fields,
        };
        desc.with_sequence(sequence_count)
    }

    fn with_sequence(mut self, sequence_count: usize) -> Result<Self> {
        if sequence_count == 0 {
            return Err(DaqError::Configuration(
                "sequence count must be a positive number".into(),
            ));
        }
        if sequence_count > 1 {
            if self.sample_count % sequence_count != 0 {
                return Err(DaqError::Configuration(format!(
                    "{} samples do not split into {} sequence events",
                    self.sample_count, sequence_count
                )));
            }
            self.sequence_count = Some(sequence_count);
        }
        Ok(self)
    }

    pub fn events_per_block(&self) -> usize {
        self.sequence_count.unwrap_or(1)
    }

    pub fn samples_per_event(&self) -> usize {
        self.sample_count / self.events_per_block()
    }

    pub fn block_bytes(&self) -> usize {
        self.sample_count * self.byte_width
    }

    pub fn to_physical(&self, raw: f64) -> f64 {
        match self.conversion {
            VoltageConversion::GainMinusOffset => raw * self.vertical_gain - self.vertical_offset,
            VoltageConversion::ZeroPlusScaled => {
                self.vertical_zero + (raw - self.vertical_offset) * self.vertical_gain
            }
        }
    }
}

/// Map the descriptor's enumerated encoding fields onto a concrete layout.
pub fn derive_sample_layout(desc: &WaveformDescriptor) -> Result<SampleLayout> {
    let byte_order = match desc.byte_order.to_ascii_uppercase().as_str() {
        "MSB" | "HIFIRST" => ByteOrder::Big,
        "LSB" | "LOFIRST" => ByteOrder::Little,
        other => return Err(DaqError::unsupported("byte order", other)),
    };
    let signed = match desc.number_format.to_ascii_uppercase().as_str() {
        "RI" | "SIGNED" => true,
        "RP" | "UNSIGNED" => false,
        other => return Err(DaqError::unsupported("binary format", other)),
    };
    if !matches!(desc.byte_width, 1 | 2 | 4) {
        return Err(DaqError::unsupported("byte width", desc.byte_width.to_string()));
    }
    Ok(SampleLayout {
        byte_width: desc.byte_width,
        signed,
        byte_order,
    })
}

/// Fixed-width integer samples as they came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RawSamples {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
}

macro_rules! from_wire {
    ($bytes:expr, $order:expr, $ty:ty, $width:literal) => {
        $bytes
            .chunks_exact($width)
            .map(|c| {
                let mut buf = [0u8; $width];
                buf.copy_from_slice(c);
                match $order {
                    ByteOrder::Big => <$ty>::from_be_bytes(buf),
                    ByteOrder::Little => <$ty>::from_le_bytes(buf),
                }
            })
            .collect()
    };
}

impl RawSamples {
    pub fn from_bytes(bytes: &[u8], layout: SampleLayout) -> Result<Self> {
        if bytes.len() % layout.byte_width != 0 {
            return Err(DaqError::MalformedBlock {
                expected: bytes.len() - bytes.len() % layout.byte_width,
                actual: bytes.len(),
            });
        }
        let order = layout.byte_order;
        Ok(match layout.dtype() {
            SampleDtype::I8 => RawSamples::I8(bytes.iter().map(|&b| b as i8).collect()),
            SampleDtype::U8 => RawSamples::U8(bytes.to_vec()),
            SampleDtype::I16 => RawSamples::I16(from_wire!(bytes, order, i16, 2)),
            SampleDtype::U16 => RawSamples::U16(from_wire!(bytes, order, u16, 2)),
            SampleDtype::I32 => RawSamples::I32(from_wire!(bytes, order, i32, 4)),
            SampleDtype::U32 => RawSamples::U32(from_wire!(bytes, order, u32, 4)),
        })
    }

    pub fn len(&self) -> usize {
        match self {
            RawSamples::I8(v) => v.len(),
            RawSamples::U8(v) => v.len(),
            RawSamples::I16(v) => v.len(),
            RawSamples::U16(v) => v.len(),
            RawSamples::I32(v) => v.len(),
            RawSamples::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            RawSamples::I8(v) => v.iter().map(|&x| x as f64).collect(),
            RawSamples::U8(v) => v.iter().map(|&x| x as f64).collect(),
            RawSamples::I16(v) => v.iter().map(|&x| x as f64).collect(),
            RawSamples::U16(v) => v.iter().map(|&x| x as f64).collect(),
            RawSamples::I32(v) => v.iter().map(|&x| x as f64).collect(),
            RawSamples::U32(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }

    /// Reshape a flat block into `events` rows of equal length.
    pub fn into_events(self, events: usize) -> Result<EventBatch> {
        let len = self.len();
        if events == 0 || len % events != 0 {
            return Err(DaqError::MalformedBlock {
                expected: len - len % events.max(1),
                actual: len,
            });
        }
        let shape = (events, len / events);
        let shape_err = |_| DaqError::MalformedBlock {
            expected: shape.0 * shape.1,
            actual: len,
        };
        Ok(match self {
            RawSamples::I8(v) => EventBatch::I8(Array2::from_shape_vec(shape, v).map_err(shape_err)?),
            RawSamples::U8(v) => EventBatch::U8(Array2::from_shape_vec(shape, v).map_err(shape_err)?),
            RawSamples::I16(v) => EventBatch::I16(Array2::from_shape_vec(shape, v).map_err(shape_err)?),
            RawSamples::U16(v) => EventBatch::U16(Array2::from_shape_vec(shape, v).map_err(shape_err)?),
            RawSamples::I32(v) => EventBatch::I32(Array2::from_shape_vec(shape, v).map_err(shape_err)?),
            RawSamples::U32(v) => EventBatch::U32(Array2::from_shape_vec(shape, v).map_err(shape_err)?),
        })
    }
}

/// Decode a raw block into physical values.
pub fn decode(raw_bytes: &[u8], desc: &WaveformDescriptor) -> Result<Vec<f64>> {
    let layout = derive_sample_layout(desc)?;
    let samples = RawSamples::from_bytes(raw_bytes, layout)?;
    Ok(samples
        .to_f64()
        .into_iter()
        .map(|raw| desc.to_physical(raw))
        .collect())
}

/// Sample times for one event.
pub fn build_time_axis(desc: &WaveformDescriptor) -> Vec<f64> {
    let reference = desc.sample_reference_offset as f64;
    (0..desc.samples_per_event())
        .map(|i| desc.horizontal_offset + (i as f64 - reference) * desc.horizontal_interval)
        .collect()
}

/// Raw events from one trigger cycle, one row per event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBatch {
    I8(Array2<i8>),
    U8(Array2<u8>),
    I16(Array2<i16>),
    U16(Array2<u16>),
    I32(Array2<i32>),
    U32(Array2<u32>),
}

impl EventBatch {
    pub fn dim(&self) -> (usize, usize) {
        match self {
            EventBatch::I8(a) => a.dim(),
            EventBatch::U8(a) => a.dim(),
            EventBatch::I16(a) => a.dim(),
            EventBatch::U16(a) => a.dim(),
            EventBatch::I32(a) => a.dim(),
            EventBatch::U32(a) => a.dim(),
        }
    }

    pub fn events(&self) -> usize {
        self.dim().0
    }

    pub fn samples_per_event(&self) -> usize {
        self.dim().1
    }

    pub fn dtype(&self) -> SampleDtype {
        match self {
            EventBatch::I8(_) => SampleDtype::I8,
            EventBatch::U8(_) => SampleDtype::U8,
            EventBatch::I16(_) => SampleDtype::I16,
            EventBatch::U16(_) => SampleDtype::U16,
            EventBatch::I32(_) => SampleDtype::I32,
            EventBatch::U32(_) => SampleDtype::U32,
        }
    }

    /// Keep only the first `events` rows.
    pub fn truncate(self, events: usize) -> Self {
        let n = events.min(self.events());
        match self {
            EventBatch::I8(a) => EventBatch::I8(a.slice_move(s![..n, ..])),
            EventBatch::U8(a) => EventBatch::U8(a.slice_move(s![..n, ..])),
            EventBatch::I16(a) => EventBatch::I16(a.slice_move(s![..n, ..])),
            EventBatch::U16(a) => EventBatch::U16(a.slice_move(s![..n, ..])),
            EventBatch::I32(a) => EventBatch::I32(a.slice_move(s![..n, ..])),
            EventBatch::U32(a) => EventBatch::U32(a.slice_move(s![..n, ..])),
        }
    }

    /// Serialise the samples back to wire order, event after event.
    pub fn to_bytes(&self, order: ByteOrder) -> Vec<u8> {
        macro_rules! wire {
            ($a:expr) => {
                $a.iter()
                    .flat_map(|x| match order {
                        ByteOrder::Big => x.to_be_bytes().to_vec(),
                        ByteOrder::Little => x.to_le_bytes().to_vec(),
                    })
                    .collect()
            };
        }
        match self {
            EventBatch::I8(a) => wire!(a),
            EventBatch::U8(a) => wire!(a),
            EventBatch::I16(a) => wire!(a),
            EventBatch::U16(a) => wire!(a),
            EventBatch::I32(a) => wire!(a),
            EventBatch::U32(a) => wire!(a),
        }
    }
}
