use thiserror::Error;

use crate::codec::{decode_unit, normalize_case, CaseCode};

/// One line of operator input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorInput {
    /// Raw unit scan, classified by the session
    Scan(String),
    /// A printed case label was scanned back
    CaseLabel(CaseCode),
    Command(OperatorCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Init,
    Print,
    Confirm(Option<CaseCode>),
    Cancel,
    Reset,
    Status,
    Clear,
    End,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OperatorParseError {
    #[error("Unknown command :{0} (try :print, :confirm, :cancel, :reset, :status, :clear, :end, :quit)")]
    UnknownCommand(String),

    #[error("Invalid case code for :confirm: {0}")]
    InvalidCaseCode(String),
}

/// Lines starting with `:` are commands. Anything else is a scan; a scan
/// that is not a unit code but is a valid SSCC counts as a label scan.
pub fn parse_operator_line(line: &str) -> Result<OperatorInput, OperatorParseError> {
    let Some(command) = line.trim().strip_prefix(':') else {
        if decode_unit(line).is_err() {
            if let Ok(case_code) = normalize_case(line) {
                return Ok(OperatorInput::CaseLabel(case_code));
            }
        }
        return Ok(OperatorInput::Scan(line.to_string()));
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default().to_ascii_lowercase();
    let command = match name.as_str() {
        "init" => OperatorCommand::Init,
        "print" | "p" => OperatorCommand::Print,
        "confirm" | "c" => match parts.next() {
            Some(code) => OperatorCommand::Confirm(Some(
                normalize_case(code).map_err(|e| OperatorParseError::InvalidCaseCode(e.to_string()))?,
            )),
            None => OperatorCommand::Confirm(None),
        },
        "cancel" => OperatorCommand::Cancel,
        "reset" => OperatorCommand::Reset,
        "status" | "s" => OperatorCommand::Status,
        "clear" => OperatorCommand::Clear,
        "end" => OperatorCommand::End,
        "quit" | "q" => OperatorCommand::Quit,
        other => return Err(OperatorParseError::UnknownCommand(other.to_string())),
    };
    Ok(OperatorInput::Command(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_are_parsed() {
        assert_eq!(
            parse_operator_line(":print").unwrap(),
            OperatorInput::Command(OperatorCommand::Print)
        );
        assert_eq!(
            parse_operator_line("  :QUIT ").unwrap(),
            OperatorInput::Command(OperatorCommand::Quit)
        );
        assert_eq!(
            parse_operator_line(":confirm 376104250021234569").unwrap(),
            OperatorInput::Command(OperatorCommand::Confirm(Some(
                CaseCode::parse("376104250021234569").unwrap()
            )))
        );
        assert!(matches!(
            parse_operator_line(":confirm 376104250021234560"),
            Err(OperatorParseError::InvalidCaseCode(_))
        ));
        assert!(matches!(
            parse_operator_line(":dance"),
            Err(OperatorParseError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_unit_scans_and_case_labels_are_told_apart() {
        let unit = "0104600417010234215SER001\u{1d}93ABCD";
        assert_eq!(parse_operator_line(unit).unwrap(), OperatorInput::Scan(unit.to_string()));

        assert_eq!(
            parse_operator_line("]C100376104250021234569").unwrap(),
            OperatorInput::CaseLabel(CaseCode::parse("376104250021234569").unwrap())
        );

        assert_eq!(
            parse_operator_line("hello").unwrap(),
            OperatorInput::Scan("hello".to_string())
        );
    }
}
