//! Acquisition core for networked digital oscilloscopes.
//!
//! A [`Scope`] implementation speaks one instrument family's dialect over a
//! [`Connection`]; [`fetch`] drives it through trigger/read cycles and
//! streams the raw events into an HDF5 [`Store`].

pub mod capture;
pub mod config;
pub mod error;
pub mod lecroy;
pub mod protocol;
pub mod settings;
pub mod stats;
pub mod store;
pub mod tektronix;
pub mod transport;
pub mod waveform;

pub use capture::{
    fetch, get_waveform, run_file_name, CancellationToken, CaptureOptions, CaptureSession,
    CaptureState, FetchSummary,
};
pub use config::{Conf, RunSettings, ScopeSettings};
pub use error::{DaqError, Result};
pub use lecroy::LeCroy;
pub use protocol::{open_scope, CommandTable, Scope, Settings, Vendor};
pub use stats::RunStats;
pub use store::{Compression, Store};
pub use tektronix::Tektronix;
pub use transport::Connection;
pub use waveform::{EventBatch, WaveformDescriptor};
