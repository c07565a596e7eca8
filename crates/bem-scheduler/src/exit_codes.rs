//! Human readable notifier exit codes.

use std::borrow::Cow;

/// Describe an exit code as stored on a notification.
pub fn describe_exit_code(code: i64) -> Cow<'static, str> {
    match code {
        0 => "Success".into(),
        1 => "General failure".into(),
        2 => "Invalid arguments or usage error".into(),
        126 => "Notifier found but not executable".into(),
        127 => "Notifier not found".into(),
        255 => "No exit status (failed to start or lost)".into(),
        129..=191 => {
            let signal = (code - 128) as i32;
            match signal_name(signal) {
                Some(name) => format!("Terminated by signal {signal} ({name})").into(),
                None => format!("Terminated by signal {signal}").into(),
            }
        }
        other => format!("Unknown exit code {other}").into(),
    }
}

fn signal_name(signal: i32) -> Option<&'static str> {
    Some(match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        6 => "SIGABRT",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        _ => return None,
    })
}
