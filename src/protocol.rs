//! Command/query dispatch shared by both instrument families.
//!
//! Each family implements [`Scope`]; the capture loop only ever talks to the
//! trait object chosen by [`open_scope`].

use crate::config::ScopeSettings;
use crate::waveform::WaveformDescriptor;
use crate::{DaqError, LeCroy, Result, Tektronix};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Instrument configuration snapshot: command -> reply.
pub type Settings = BTreeMap<String, String>;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    LeCroy,
    Tektronix,
}

/// Setting names captured by [`Scope::settings`]. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTable {
    commands: Vec<String>,
}

impl CommandTable {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Capabilities the capture loop needs from an instrument family.
pub trait Scope {
    fn vendor(&self) -> Vendor;

    fn commands(&self) -> &CommandTable;

    /// Send a command that produces no data reply.
    fn command(&mut self, command: &str) -> Result<()>;

    /// Send a query and return its reply without the terminator.
    fn query(&mut self, query: &str) -> Result<String>;

    /// Fail if the instrument rejected the last command.
    fn check_errors(&mut self) -> Result<()>;

    /// Drop anything left in the instrument's output queue.
    fn clear(&mut self) -> Result<()>;

    fn set_display(&mut self, on: bool) -> Result<()>;

    fn active_channels(&mut self) -> Result<Vec<u8>>;

    /// Events delivered per trigger (sequence or fastframe count, >= 1).
    fn sequence_count(&mut self, settings: &Settings) -> Result<usize>;

    /// Put the instrument in a state where descriptors and blocks are valid.
    fn prepare(&mut self) -> Result<()>;

    fn descriptor(&mut self, channel: u8, sequence_count: usize) -> Result<WaveformDescriptor>;

    /// Arm, trigger and wait for the acquisition to complete.
    fn trigger(&mut self) -> Result<()>;

    /// Raw sample bytes of the current acquisition for `channel`.
    fn read_waveform_block(&mut self, channel: u8, desc: &WaveformDescriptor) -> Result<Vec<u8>>;

    fn close(&mut self);

    /// Query every entry of the command table.
    fn settings(&mut self) -> Result<Settings> {
        let commands: Vec<String> = self.commands().iter().map(str::to_string).collect();
        let mut settings = Settings::new();
        for command in commands {
            let reply = self.query(&format!("{command}?"))?;
            self.check_errors()?;
            settings.insert(command, reply);
        }
        Ok(settings)
    }
}

/// Locate a `#<d><count><bytes>` definite-length block inside `reply`.
///
/// Returns the data bytes. A reply holding fewer bytes than the declared
/// count is a malformed (retryable) block; an unparseable prefix is a
/// framing error.
pub fn parse_definite_block(reply: &[u8]) -> Result<&[u8]> {
    let start = reply
        .iter()
        .position(|&b| b == b'#')
        .ok_or_else(|| DaqError::Framing("reply holds no data block".into()))?;
    let digits = reply
        .get(start + 1)
        .and_then(|&d| (d as char).to_digit(10))
        .filter(|&d| d > 0)
        .ok_or_else(|| DaqError::Framing("bad block length digit".into()))? as usize;

    let count_start = start + 2;
    let count_field = reply
        .get(count_start..count_start + digits)
        .ok_or_else(|| DaqError::Framing("truncated block byte count".into()))?;
    let count = parse_byte_count(count_field)?;

    let data_start = count_start + digits;
    let available = reply.len() - data_start;
    if available < count {
        return Err(DaqError::MalformedBlock {
            expected: count,
            actual: available,
        });
    }
    Ok(&reply[data_start..data_start + count])
}

pub(crate) fn parse_byte_count(field: &[u8]) -> Result<usize> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return Err(DaqError::Framing(format!(
            "non-digit character in byte count field {:?}",
            String::from_utf8_lossy(field)
        )));
    }
    field.iter().try_fold(0usize, |acc, &d| {
        acc.checked_mul(10)
            .and_then(|acc| acc.checked_add(usize::from(d - b'0')))
            .ok_or_else(|| DaqError::Framing("block byte count overflows".into()))
    })
}

/// Connect to the instrument family named in `settings`.
pub fn open_scope(settings: &ScopeSettings) -> Result<Box<dyn Scope>> {
    let timeout = Duration::from_secs_f64(settings.timeout_secs);
    let mut conn = crate::Connection::new(&settings.host, settings.port, timeout)
        .with_connect_timeout(Duration::from_secs_f64(settings.connect_timeout_secs))
        .with_clear_timeout(Duration::from_secs_f64(settings.clear_timeout_secs));
    conn.connect()?;

    let scope: Box<dyn Scope> = match settings.vendor() {
        Vendor::LeCroy => {
            let commands = settings
                .commands
                .clone()
                .map(CommandTable::new)
                .unwrap_or_else(crate::settings::lecroy_commands);
            Box::new(
                LeCroy::new(conn, commands)
                    .with_settle_delay(Duration::from_secs_f64(settings.settle_delay_secs)),
            )
        }
        Vendor::Tektronix => {
            let commands = settings
                .commands
                .clone()
                .map(CommandTable::new)
                .unwrap_or_else(crate::settings::tektronix_commands);
            Box::new(
                Tektronix::new(conn, commands)
                    .with_polling(Duration::from_millis(settings.poll_interval_ms), settings.max_polls),
            )
        }
    };
    Ok(scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_inside_reply_is_located() {
        let reply = b"C1:WF DAT1,#9000000004\x01\x02\x03\x04\n";
        assert_eq!(parse_definite_block(reply).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn short_block_is_retryable() {
        let err = parse_definite_block(b"#210abc").unwrap_err();
        assert!(matches!(
            err,
            DaqError::MalformedBlock {
                expected: 10,
                actual: 3
            }
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn bad_block_prefix_is_framing() {
        assert!(matches!(
            parse_definite_block(b"no block"),
            Err(DaqError::Framing(_))
        ));
        assert!(matches!(
            parse_definite_block(b"#0abc"),
            Err(DaqError::Framing(_))
        ));
        assert!(matches!(
            parse_definite_block(b"#21x"),
            Err(DaqError::Framing(_))
        ));
    }

    #[test]
    fn command_table_preserves_order() {
        let table = CommandTable::new(["TIME_DIV", "SEQUENCE"]);
        assert_eq!(table.iter().collect::<Vec<_>>(), vec!["TIME_DIV", "SEQUENCE"]);
        assert_eq!(table.len(), 2);
    }
}
