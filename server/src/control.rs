//! Operator console commands read from stdin

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    Play,
    Pause,
    /// Target position in media milliseconds
    Seek(f64),
    Rate(f64),
    Status,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),
    #[error("'{0}' is not a number")]
    InvalidNumber(String),
    #[error("unexpected trailing input '{0}'")]
    TrailingInput(String),
}

impl FromStr for ControlCommand {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let keyword = words.next().ok_or(ParseError::Empty)?;

        let command = match keyword.to_ascii_lowercase().as_str() {
            "play" => ControlCommand::Play,
            "pause" => ControlCommand::Pause,
            "status" => ControlCommand::Status,
            "seek" => ControlCommand::Seek(number(words.next(), "seek")?),
            "rate" => ControlCommand::Rate(number(words.next(), "rate")?),
            _ => return Err(ParseError::UnknownCommand(keyword.to_string())),
        };

        match words.next() {
            Some(extra) => Err(ParseError::TrailingInput(extra.to_string())),
            None => Ok(command),
        }
    }
}

fn number(word: Option<&str>, command: &'static str) -> Result<f64, ParseError> {
    let word = word.ok_or(ParseError::MissingArgument(command))?;
    word.parse::<f64>()
        .map_err(|_| ParseError::InvalidNumber(word.to_string()))
}

pub const HELP: &str = "commands: play | pause | seek <ms> | rate <x> | status";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!("play".parse(), Ok(ControlCommand::Play));
        assert_eq!("  PAUSE ".parse(), Ok(ControlCommand::Pause));
        assert_eq!("status".parse(), Ok(ControlCommand::Status));
    }

    #[test]
    fn test_parse_commands_with_arguments() {
        assert_eq!("seek 90000".parse(), Ok(ControlCommand::Seek(90_000.0)));
        assert_eq!("rate 1.25".parse(), Ok(ControlCommand::Rate(1.25)));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<ControlCommand>(), Err(ParseError::Empty));
        assert_eq!(
            "rewind".parse::<ControlCommand>(),
            Err(ParseError::UnknownCommand("rewind".to_string()))
        );
        assert_eq!(
            "seek".parse::<ControlCommand>(),
            Err(ParseError::MissingArgument("seek"))
        );
        assert_eq!(
            "rate fast".parse::<ControlCommand>(),
            Err(ParseError::InvalidNumber("fast".to_string()))
        );
        assert_eq!(
            "play now".parse::<ControlCommand>(),
            Err(ParseError::TrailingInput("now".to_string()))
        );
    }

    #[test]
    fn test_error_messages_are_readable() {
        let err = "seek".parse::<ControlCommand>().unwrap_err();
        assert_eq!(err.to_string(), "'seek' needs an argument");
    }
}
