use crate::protocol::Vendor;
use confique::Config;
use std::collections::HashMap;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub scope_settings: ScopeSettings,
    #[config(nested)]
    pub run_settings: RunSettings,
}

#[derive(Config, Debug, Clone)]
pub struct ScopeSettings {
    /// `lecroy` (default) or `tektronix`
    pub vendor: Option<Vendor>,
    #[config(env = "SCOPE_DAQ_HOST")]
    pub host: String,
    #[config(default = 1861)]
    pub port: u16,
    #[config(default = 20.0)]
    pub timeout_secs: f64,
    #[config(default = 5.0)]
    pub connect_timeout_secs: f64,
    /// Read timeout while draining the output queue
    #[config(default = 2.0)]
    pub clear_timeout_secs: f64,
    /// LeCroy only: wait after the priming trigger
    #[config(default = 5.0)]
    pub settle_delay_secs: f64,
    /// Tektronix only: pause between acquisition state polls
    #[config(default = 0)]
    pub poll_interval_ms: u64,
    #[config(default = 100000)]
    pub max_polls: usize,
    /// Overrides the vendor's default settings command table
    pub commands: Option<Vec<String>>,
}

impl ScopeSettings {
    pub fn vendor(&self) -> Vendor {
        self.vendor.unwrap_or(Vendor::LeCroy)
    }
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = 1000)]
    pub events: usize,
    #[config(default = 1)]
    pub runs: usize,
    #[config(default = 10)]
    pub max_retries: usize,
    #[config(default = 5)]
    pub blosc_threads: u8,
    #[config(default = 2)]
    pub compression_level: u8,
    pub log_file: Option<String>,
    /// Extra string attributes attached to every output file
    pub attributes: Option<HashMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn toml_file_fills_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[scope_settings]
vendor = "tektronix"
host = "192.168.1.1"
port = 4000

[run_settings]
events = 250

[run_settings.attributes]
pmtid = "ZN0103"
"#
        )
        .unwrap();

        let conf = Conf::builder().file(file.path()).load().unwrap();
        assert_eq!(conf.scope_settings.vendor(), Vendor::Tektronix);
        assert_eq!(conf.scope_settings.port, 4000);
        assert_eq!(conf.scope_settings.timeout_secs, 20.0);
        assert!(conf.scope_settings.commands.is_none());
        assert_eq!(conf.run_settings.events, 250);
        assert_eq!(conf.run_settings.max_retries, 10);
        assert_eq!(
            conf.run_settings.attributes.unwrap()["pmtid"],
            "ZN0103"
        );
    }
}
