//! AT command parsing and formatting.
//!
//! RFCOMM traffic is line oriented: commands from the hands-free side
//! (`AT+X=…`), responses and unsolicited indications from the gateway
//! (`+X: …`), and bare result codes.

/// Flavor of an `AT+…` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtKind {
    /// `AT+NAME=value`
    Set,
    /// `AT+NAME?`
    Get,
    /// `AT+NAME=?`
    Test,
    /// `ATX…` without a parameter, e.g. `ATA`, `ATD123;`.
    Exec,
}

/// One parsed line of AT traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtMessage {
    /// A command issued by the peer.
    Command { name: String, kind: AtKind, value: String },
    /// A response or unsolicited indication, `+NAME: value`.
    Response { name: String, value: String },
    /// `OK`
    Ok,
    /// `ERROR` or `+CME ERROR: …`
    Error,
    /// Incoming-call alert.
    Ring,
}

/// Parse one line, already stripped of CR/LF framing. Returns `None`
/// for empty or unintelligible input.
pub fn parse_line(line: &str) -> Option<AtMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match line {
        "OK" => return Some(AtMessage::Ok),
        "ERROR" => return Some(AtMessage::Error),
        "RING" => return Some(AtMessage::Ring),
        _ => {}
    }
    if let Some(rest) = line.strip_prefix("+CME ERROR") {
        let _ = rest;
        return Some(AtMessage::Error);
    }

    if let Some(rest) = line.strip_prefix("AT") {
        // `AT+NAME…` or a legacy `ATx` command.
        if let Some(body) = rest.strip_prefix('+') {
            if let Some(name) = body.strip_suffix("=?") {
                return Some(AtMessage::Command {
                    name: name.to_string(),
                    kind: AtKind::Test,
                    value: String::new(),
                });
            }
            if let Some(name) = body.strip_suffix('?') {
                return Some(AtMessage::Command {
                    name: name.to_string(),
                    kind: AtKind::Get,
                    value: String::new(),
                });
            }
            if let Some((name, value)) = body.split_once('=') {
                return Some(AtMessage::Command {
                    name: name.to_string(),
                    kind: AtKind::Set,
                    value: value.to_string(),
                });
            }
            return Some(AtMessage::Command {
                name: body.to_string(),
                kind: AtKind::Exec,
                value: String::new(),
            });
        }
        return Some(AtMessage::Command {
            name: rest.to_string(),
            kind: AtKind::Exec,
            value: String::new(),
        });
    }

    if let Some(body) = line.strip_prefix('+') {
        let (name, value) = match body.split_once(':') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => (body.trim(), ""),
        };
        return Some(AtMessage::Response { name: name.to_string(), value: value.to_string() });
    }

    None
}

/// Splits a byte stream into AT lines, keeping partial tails across
/// reads.
#[derive(Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        LineBuffer::default()
    }

    /// Feed raw bytes; returns the complete lines now available.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(data));
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find(['\r', '\n']) {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

/// Format a command line, `AT+NAME=value\r`.
pub fn format_command(name: &str, value: &str) -> String {
    if value.is_empty() {
        format!("AT+{name}\r")
    } else {
        format!("AT+{name}={value}\r")
    }
}

/// Format a response or unsolicited indication, `\r\n+NAME: value\r\n`.
pub fn format_response(name: &str, value: &str) -> String {
    format!("\r\n+{name}: {value}\r\n")
}

/// Format a bare result code.
pub fn format_result(ok: bool) -> String {
    if ok {
        "\r\nOK\r\n".to_string()
    } else {
        "\r\nERROR\r\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parsing {
        use super::*;

        #[test]
        fn set_command() {
            assert_eq!(
                parse_line("AT+BRSF=959"),
                Some(AtMessage::Command {
                    name: "BRSF".into(),
                    kind: AtKind::Set,
                    value: "959".into()
                })
            );
        }

        #[test]
        fn get_command() {
            assert_eq!(
                parse_line("AT+CIND?"),
                Some(AtMessage::Command {
                    name: "CIND".into(),
                    kind: AtKind::Get,
                    value: String::new()
                })
            );
        }

        #[test]
        fn test_command() {
            assert_eq!(
                parse_line("AT+CIND=?"),
                Some(AtMessage::Command {
                    name: "CIND".into(),
                    kind: AtKind::Test,
                    value: String::new()
                })
            );
        }

        #[test]
        fn exec_command() {
            assert_eq!(
                parse_line("ATA"),
                Some(AtMessage::Command { name: "A".into(), kind: AtKind::Exec, value: String::new() })
            );
        }

        #[test]
        fn response_with_value() {
            assert_eq!(
                parse_line("+BCS: 2"),
                Some(AtMessage::Response { name: "BCS".into(), value: "2".into() })
            );
        }

        #[test]
        fn result_codes() {
            assert_eq!(parse_line("OK"), Some(AtMessage::Ok));
            assert_eq!(parse_line("ERROR"), Some(AtMessage::Error));
            assert_eq!(parse_line("RING"), Some(AtMessage::Ring));
            assert_eq!(parse_line("+CME ERROR: 30"), Some(AtMessage::Error));
        }

        #[test]
        fn garbage_is_none() {
            assert_eq!(parse_line(""), None);
            assert_eq!(parse_line("   "), None);
            assert_eq!(parse_line("hello"), None);
        }
    }

    mod line_buffer {
        use super::*;

        #[test]
        fn reassembles_split_lines() {
            let mut buffer = LineBuffer::new();
            assert!(buffer.feed(b"AT+BR").is_empty());
            let lines = buffer.feed(b"SF=959\r");
            assert_eq!(lines, vec!["AT+BRSF=959"]);
        }

        #[test]
        fn multiple_lines_per_read() {
            let mut buffer = LineBuffer::new();
            let lines = buffer.feed(b"\r\nOK\r\n\r\n+CIEV: 1,1\r\n");
            assert_eq!(lines, vec!["OK", "+CIEV: 1,1"]);
        }
    }

    mod formatting {
        use super::*;

        #[test]
        fn command_framing() {
            assert_eq!(format_command("BCS", "2"), "AT+BCS=2\r");
            assert_eq!(format_command("CIND?", ""), "AT+CIND?\r");
        }

        #[test]
        fn response_framing() {
            assert_eq!(format_response("BRSF", "1536"), "\r\n+BRSF: 1536\r\n");
        }

        #[test]
        fn results() {
            assert_eq!(format_result(true), "\r\nOK\r\n");
            assert_eq!(format_result(false), "\r\nERROR\r\n");
        }
    }
}
