//! Wire protocol.
//!
//! One newline-terminated request per connection, one reply, then close:
//!
//! ```text
//! Request:  GET_SYS_INFO\n
//! Response: <raw stdout of the uptime command>
//!
//! Request:  <anything else>
//! Response: ERROR: Unknown command\n
//! ```
//!
//! When the server cannot create a worker it answers `SERVER_BUSY\n` without
//! reading the request.

/// The only recognized request line.
pub const GET_SYS_INFO: &[u8] = b"GET_SYS_INFO\n";

/// Reply to anything other than [`GET_SYS_INFO`].
pub const UNKNOWN_COMMAND: &[u8] = b"ERROR: Unknown command\n";

/// Reply sent by the listener when no worker could be created.
pub const SERVER_BUSY: &[u8] = b"SERVER_BUSY\n";

/// Parsed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Report system uptime.
    GetSysInfo,
    /// Anything else.
    Unknown,
}

/// Parse a request. The match is exact: no trimming, no case folding.
pub fn parse(input: &[u8]) -> Command {
    if input == GET_SYS_INFO {
        Command::GetSysInfo
    } else {
        Command::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_sys_info() {
        assert_eq!(parse(b"GET_SYS_INFO\n"), Command::GetSysInfo);
    }

    #[test]
    fn test_near_misses_are_unknown() {
        for input in [
            &b"GET_SYS_INFO"[..],
            b"GET_SYS_INFO\r\n",
            b"get_sys_info\n",
            b" GET_SYS_INFO\n",
            b"GET_SYS_INFO\nGET_SYS_INFO\n",
            b"GET_SYS_INFO\n\0",
            b"\n",
            b"",
        ] {
            assert_eq!(parse(input), Command::Unknown, "input {:?}", input);
        }
    }

    #[test]
    fn test_replies_are_single_lines() {
        for reply in [UNKNOWN_COMMAND, SERVER_BUSY] {
            assert!(reply.ends_with(b"\n"));
            assert_eq!(reply.iter().filter(|&&b| b == b'\n').count(), 1);
        }
    }
}
