use clap::{Arg, ArgAction, Command, builder::ValueParser};

pub const ARG_VERBOSITY: &str = "verbosity";

/// Level names accepted by `FINORA_LOG_LEVEL`, indexed by verbosity count.
const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Accepts a level name or a numeric verbosity (0..=5).
#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(|level: &str| -> Result<u8, String> {
        if let Ok(count) = level.parse::<u8>() {
            return (count <= 5)
                .then_some(count)
                .ok_or_else(|| format!("verbosity must be 0-5, got {count}"));
        }

        let level = level.to_ascii_lowercase();
        LEVELS
            .iter()
            .position(|name| *name == level)
            .and_then(|index| u8::try_from(index).ok())
            .ok_or_else(|| format!("invalid log level: {level}"))
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
            .env("FINORA_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(level: &str) -> Option<u8> {
        Command::new("finora")
            .arg(Arg::new("level").value_parser(validator_log_level()))
            .try_get_matches_from(["finora", level])
            .ok()
            .and_then(|matches| matches.get_one::<u8>("level").copied())
    }

    #[test]
    fn names_and_numbers_are_accepted() {
        assert_eq!(parse("ERROR"), Some(0));
        assert_eq!(parse("debug"), Some(3));
        assert_eq!(parse("5"), Some(5));
    }

    #[test]
    fn unknown_levels_are_rejected() {
        assert_eq!(parse("verbose"), None);
        assert_eq!(parse("6"), None);
    }
}
