use crate::protocol::Settings;
use crate::waveform::{EventBatch, FieldValue, SampleDtype, WaveformDescriptor};
use crate::{DaqError, Result};
use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, File, H5Type, Location};
use log::{debug, info, warn};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Largest number of events per HDF5 chunk.
const MAX_CHUNK_EVENTS: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct Compression {
    /// Blosc/Zstd level; 0 disables compression.
    pub level: u8,
    pub threads: u8,
}

impl Default for Compression {
    fn default() -> Self {
        Self {
            level: 2,
            threads: 5,
        }
    }
}

/// Events per chunk for a dataset declared with `target_events` rows.
pub fn chunk_events(target_events: usize) -> usize {
    MAX_CHUNK_EVENTS.min((target_events / 100).max(1))
}

pub fn channel_name(channel: u8) -> String {
    format!("channel{channel}")
}

/// One growable `(events, samples)` array.
pub struct ChannelData {
    pub dataset: Dataset,
    pub declared: usize,
    pub samples: usize,
    pub dtype: SampleDtype,
    pub written: usize,
}

/// HDF5 container holding one dataset per channel.
pub struct Store {
    path: PathBuf,
    file: Option<File>,
    compression: Compression,
    channels: BTreeMap<u8, ChannelData>,
}

impl Store {
    pub fn open(path: &Path, compression: Compression) -> Result<Self> {
        let file = File::create(path)?;
        if compression.level > 0 {
            hdf5::filters::blosc_set_nthreads(compression.threads);
        }
        let created = time::OffsetDateTime::now_utc().unix_timestamp();
        file.new_attr::<i64>()
            .create("created_unix")?
            .write_scalar(&created)?;
        debug!("opened {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            compression,
            channels: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| DaqError::Configuration(format!("{} is closed", self.path.display())))
    }

    /// Attach the instrument configuration as root string attributes.
    pub fn set_settings(&self, settings: &Settings) -> Result<()> {
        self.set_attributes(settings.iter())
    }

    /// Attach string attributes to the container root.
    pub fn set_attributes<'a, I>(&self, attributes: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let file = self.file()?;
        for (key, value) in attributes {
            if let Err(e) = write_attr(file, key, &FieldValue::Str(value.clone())) {
                warn!("skipping attribute {key}: {e}");
            }
        }
        Ok(())
    }

    /// Create the dataset for `channel` and attach its descriptor fields.
    pub fn declare_channel(
        &mut self,
        channel: u8,
        target_events: usize,
        samples_per_event: usize,
        dtype: SampleDtype,
        desc: &WaveformDescriptor,
    ) -> Result<()> {
        if samples_per_event == 0 {
            return Err(DaqError::Configuration(format!(
                "channel {channel} has no samples per event"
            )));
        }
        let name = channel_name(channel);
        let chunk = chunk_events(target_events);
        let file = self.file()?;
        let dataset = match dtype {
            SampleDtype::I8 => create::<i8>(file, &name, target_events, samples_per_event, chunk, self.compression),
            SampleDtype::U8 => create::<u8>(file, &name, target_events, samples_per_event, chunk, self.compression),
            SampleDtype::I16 => create::<i16>(file, &name, target_events, samples_per_event, chunk, self.compression),
            SampleDtype::U16 => create::<u16>(file, &name, target_events, samples_per_event, chunk, self.compression),
            SampleDtype::I32 => create::<i32>(file, &name, target_events, samples_per_event, chunk, self.compression),
            SampleDtype::U32 => create::<u32>(file, &name, target_events, samples_per_event, chunk, self.compression),
        }?;

        for (key, value) in &desc.fields {
            if let Err(e) = write_attr(&dataset, key, value) {
                warn!("skipping {name} attribute {key}: {e}");
            }
        }
        let sequence = FieldValue::Int(desc.events_per_block() as i64);
        if let Err(e) = write_attr(&dataset, "sequence_count", &sequence) {
            warn!("skipping {name} attribute sequence_count: {e}");
        }

        debug!("declared {name} ({target_events}, {samples_per_event}) chunk {chunk}");
        self.channels.insert(
            channel,
            ChannelData {
                dataset,
                declared: target_events,
                samples: samples_per_event,
                dtype,
                written: 0,
            },
        );
        Ok(())
    }

    pub fn channel(&self, channel: u8) -> Option<&ChannelData> {
        self.channels.get(&channel)
    }

    pub fn written(&self, channel: u8) -> usize {
        self.channels.get(&channel).map_or(0, |c| c.written)
    }

    /// Write `batch` as rows `start..start + batch.events()`.
    pub fn write_batch(&mut self, channel: u8, start: usize, batch: &EventBatch) -> Result<()> {
        let data = self
            .channels
            .get_mut(&channel)
            .ok_or_else(|| DaqError::Configuration(format!("channel {channel} not declared")))?;
        let (events, samples) = batch.dim();
        if events == 0 {
            return Ok(());
        }
        if samples != data.samples || batch.dtype() != data.dtype {
            return Err(DaqError::MalformedBlock {
                expected: data.samples,
                actual: samples,
            });
        }
        if start + events > data.declared {
            return Err(DaqError::Configuration(format!(
                "channel {channel}: rows {}..{} exceed {} declared events",
                start,
                start + events,
                data.declared
            )));
        }

        match batch {
            EventBatch::I8(a) => write_rows(&data.dataset, a, start),
            EventBatch::U8(a) => write_rows(&data.dataset, a, start),
            EventBatch::I16(a) => write_rows(&data.dataset, a, start),
            EventBatch::U16(a) => write_rows(&data.dataset, a, start),
            EventBatch::I32(a) => write_rows(&data.dataset, a, start),
            EventBatch::U32(a) => write_rows(&data.dataset, a, start),
        }?;
        data.written = data.written.max(start + events);
        Ok(())
    }

    /// Shrink every channel whose actual count differs from its declared size.
    ///
    /// Channels missing from `actual` keep the number of rows written so far.
    pub fn finalize(&mut self, actual: &BTreeMap<u8, usize>) -> Result<()> {
        for (channel, data) in self.channels.iter_mut() {
            let count = actual
                .get(channel)
                .copied()
                .unwrap_or(data.written)
                .min(data.declared);
            if count != data.declared {
                info!(
                    "resizing {} from {} to {} events",
                    channel_name(*channel),
                    data.declared,
                    count
                );
                data.dataset.resize((count, data.samples))?;
                data.declared = count;
            }
        }
        Ok(())
    }

    /// Flush and release the container. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<()> {
        self.channels.clear();
        if let Some(file) = self.file.take() {
            file.flush()?;
            debug!("closed {}", self.path.display());
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing {}: {e}", self.path.display());
        }
    }
}

fn create<T: H5Type>(
    file: &File,
    name: &str,
    events: usize,
    samples: usize,
    chunk: usize,
    compression: Compression,
) -> Result<Dataset> {
    let builder = file
        .new_dataset::<T>()
        .shape((events.., samples))
        .chunk((chunk, samples));
    let dataset = if compression.level > 0 {
        builder.blosc_zstd(compression.level, true).create(name)?
    } else {
        builder.create(name)?
    };
    Ok(dataset)
}

fn write_rows<T: H5Type>(dataset: &Dataset, rows: &Array2<T>, start: usize) -> Result<()> {
    dataset.write_slice(rows, (start..start + rows.nrows(), ..))?;
    Ok(())
}

/// Write one scalar attribute. Values hdf5 cannot encode are reported back.
fn write_attr(location: &Location, name: &str, value: &FieldValue) -> std::result::Result<(), String> {
    match value {
        FieldValue::Int(v) => location
            .new_attr::<i64>()
            .create(name)
            .and_then(|attr| attr.write_scalar(v))
            .map_err(|e| e.to_string()),
        FieldValue::Float(v) => location
            .new_attr::<f64>()
            .create(name)
            .and_then(|attr| attr.write_scalar(v))
            .map_err(|e| e.to_string()),
        FieldValue::Str(s) => {
            let encoded = s.parse::<VarLenUnicode>().map_err(|e| e.to_string())?;
            location
                .new_attr::<VarLenUnicode>()
                .create(name)
                .and_then(|attr| attr.write_scalar(&encoded))
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Vendor;
    use crate::waveform::{RawSamples, VoltageConversion};
    use tempfile::tempdir;

    fn descriptor(samples: usize) -> WaveformDescriptor {
        let mut fields = crate::waveform::FieldMap::new();
        fields.insert("WAVE_ARRAY_COUNT".into(), FieldValue::Int(samples as i64));
        fields.insert("VERTICAL_GAIN".into(), FieldValue::Float(0.5));
        fields.insert("VERTUNIT".into(), FieldValue::Str("V".into()));
        fields.insert("BAD".into(), FieldValue::Str("nul\0byte".into()));
        WaveformDescriptor {
            vendor: Vendor::LeCroy,
            sample_count: samples,
            byte_width: 2,
            number_format: "SIGNED".into(),
            byte_order: "HIFIRST".into(),
            vertical_gain: 0.5,
            vertical_offset: 0.0,
            vertical_zero: 0.0,
            horizontal_interval: 1e-9,
            horizontal_offset: 0.0,
            sample_reference_offset: 0,
            sequence_count: None,
            conversion: VoltageConversion::GainMinusOffset,
            fields,
        }
    }

    fn batch(events: usize, samples: usize, base: i16) -> EventBatch {
        let flat: Vec<i16> = (0..events * samples).map(|i| base + i as i16).collect();
        RawSamples::I16(flat).into_events(events).unwrap()
    }

    #[test]
    fn chunk_size_is_bounded() {
        assert_eq!(chunk_events(1), 1);
        assert_eq!(chunk_events(250), 2);
        assert_eq!(chunk_events(10_000), 100);
        assert_eq!(chunk_events(1_000_000), 100);
    }

    #[test]
    fn cancelled_run_is_truncated_per_channel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.h5");
        let mut store = Store::open(&path, Compression::default()).unwrap();
        let mut settings = Settings::new();
        settings.insert("TIME_DIV".into(), "TDIV 1E-6 S".into());
        store.set_settings(&settings).unwrap();

        store.declare_channel(1, 10, 4, SampleDtype::I16, &descriptor(4)).unwrap();
        store.declare_channel(2, 10, 4, SampleDtype::I16, &descriptor(4)).unwrap();
        store.write_batch(1, 0, &batch(3, 4, 0)).unwrap();
        store.write_batch(2, 0, &batch(2, 4, 100)).unwrap();

        let actual = BTreeMap::from([(1, 3), (2, 2)]);
        store.finalize(&actual).unwrap();
        store.close().unwrap();
        store.close().unwrap();

        let file = File::open(&path).unwrap();
        let ch1 = file.dataset("channel1").unwrap();
        assert_eq!(ch1.shape(), vec![3, 4]);
        assert_eq!(file.dataset("channel2").unwrap().shape(), vec![2, 4]);
        let rows: Array2<i16> = ch1.read_2d().unwrap();
        assert_eq!(rows[[2, 3]], 11);

        let unit: VarLenUnicode = ch1.attr("VERTUNIT").unwrap().read_scalar().unwrap();
        assert_eq!(unit.as_str(), "V");
        assert!(ch1.attr("BAD").is_err());
        let tdiv: VarLenUnicode = file.attr("TIME_DIV").unwrap().read_scalar().unwrap();
        assert_eq!(tdiv.as_str(), "TDIV 1E-6 S");
    }

    #[test]
    fn complete_run_keeps_declared_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.h5");
        let mut store = Store::open(&path, Compression { level: 0, threads: 1 }).unwrap();
        store.declare_channel(3, 4, 2, SampleDtype::I16, &descriptor(2)).unwrap();
        store.write_batch(3, 0, &batch(4, 2, 0)).unwrap();
        store.finalize(&BTreeMap::from([(3, 4)])).unwrap();
        store.close().unwrap();

        let file = File::open(&path).unwrap();
        assert_eq!(file.dataset("channel3").unwrap().shape(), vec![4, 2]);
    }

    #[test]
    fn writes_past_declared_rows_are_rejected() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("x.h5"), Compression::default()).unwrap();
        store.declare_channel(1, 2, 4, SampleDtype::I16, &descriptor(4)).unwrap();
        assert!(store.write_batch(1, 1, &batch(2, 4, 0)).is_err());
        assert!(store.write_batch(9, 0, &batch(1, 4, 0)).is_err());
        assert!(store.write_batch(1, 0, &batch(1, 3, 0)).is_err());
    }
}
