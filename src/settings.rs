use crate::protocol::{CommandTable, Settings};
use log::info;

/// Global settings captured from a LeCroy scope at the start of a run.
const LECROY_GLOBAL: &[&str] = &[
    "TIME_DIV",
    "COMM_FORMAT",
    "COMM_HEADER",
    "COMM_ORDER",
    "TRIG_DELAY",
    "TRIG_SELECT",
    "TRIG_MODE",
    "TRIG_PATTERN",
    "SEQUENCE",
];

/// Per-channel settings, expanded for C1..C4.
const LECROY_CHANNEL: &[&str] = &[
    "COUPLING",
    "VOLT_DIV",
    "OFFSET",
    "TRIG_COUPLING",
    "TRIG_LEVEL",
    "TRIG_SLOPE",
    "TRACE",
];

pub fn lecroy_commands() -> CommandTable {
    let per_channel = LECROY_CHANNEL.iter().flat_map(|param| {
        (1..=crate::lecroy::CHANNELS).map(move |ch| format!("C{ch}:{param}"))
    });
    CommandTable::new(
        LECROY_GLOBAL
            .iter()
            .map(|c| c.to_string())
            .chain(per_channel),
    )
}

/// Tektronix scopes report their whole setup through `*LRN?`.
pub fn tektronix_commands() -> CommandTable {
    CommandTable::new(["*LRN"])
}

pub fn log_settings(settings: &Settings) {
    let mut param_log = String::new();
    for (command, value) in settings {
        param_log.push_str(&format!("{}: {}\n", command, value));
    }
    if param_log.ends_with('\n') {
        param_log.pop();
    }
    info!("Scope settings:\n{}", param_log);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lecroy_table_expands_channel_settings() {
        let table = lecroy_commands();
        assert_eq!(table.len(), LECROY_GLOBAL.len() + 4 * LECROY_CHANNEL.len());
        let commands: Vec<&str> = table.iter().collect();
        assert_eq!(commands[0], "TIME_DIV");
        assert!(commands.contains(&"SEQUENCE"));
        assert!(commands.contains(&"C1:COUPLING"));
        assert!(commands.contains(&"C4:TRACE"));
    }
}
