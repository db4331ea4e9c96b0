// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User-facing output.
//!
//! Supervisors read the adaptor's stdout, so every operation ends with an
//! init-script style banner such as `Service start for "vm1" [  OK  ]`.

use owo_colors::{OwoColorize, Style};
use slog::{error, info, Logger};

/// Column the status tag is aligned to on a terminal.
const TAG_COLUMN: usize = 60;

#[cfg_attr(test, mockall::automock)]
pub trait Reporter: Send + Sync {
    fn success(&self, msg: &str);
    fn failure(&self, msg: &str);

    /// A line with no status tag.
    fn message(&self, msg: &str);
}

/// Formats `msg` followed by its status tag.
///
/// With `color` set the tag is moved to a fixed column with a cursor
/// escape, wrapping to the next line if the message would overlap it.
pub fn banner(msg: &str, ok: bool, color: bool) -> String {
    let state = if ok { "OK" } else { "FAILED" };
    if !color {
        return format!("{msg} [  {state}  ]");
    }

    let wrap = if msg.chars().count() >= TAG_COLUMN { "\n" } else { "" };
    if ok {
        let state = state.style(Style::new().bold().green());
        format!("{msg}{wrap}\x1b[{TAG_COLUMN}G[  {state}  ]")
    } else {
        let state = state.style(Style::new().bold().red());
        format!("{msg}{wrap}\x1b[{TAG_COLUMN}G[{state}]")
    }
}

/// Writes banners to stdout, and records them in the log.
pub struct ConsoleReporter {
    color: bool,
    log: Logger,
}

impl ConsoleReporter {
    /// Colors output only when stdout is a terminal.
    pub fn new(log: &Logger) -> Self {
        Self::with_color(atty::is(atty::Stream::Stdout), log)
    }

    pub fn with_color(color: bool, log: &Logger) -> Self {
        Self { color, log: log.clone() }
    }
}

impl Reporter for ConsoleReporter {
    fn success(&self, msg: &str) {
        info!(self.log, "{} [  OK  ]", msg);
        println!("{}", banner(msg, true, self.color));
    }

    fn failure(&self, msg: &str) {
        error!(self.log, "{} [  FAILED  ]", msg);
        println!("{}", banner(msg, false, self.color));
    }

    fn message(&self, msg: &str) {
        info!(self.log, "{}", msg);
        println!("{msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_banners() {
        assert_eq!(
            banner("Service start for \"vm1\"", true, false),
            "Service start for \"vm1\" [  OK  ]"
        );
        assert_eq!(
            banner("Service stop for \"vm1\"", false, false),
            "Service stop for \"vm1\" [  FAILED  ]"
        );
    }

    #[test]
    fn colored_banner_aligns_tag() {
        let out = banner("short", true, true);
        assert!(out.starts_with("short\x1b[60G["));
        assert!(out.contains("[  "));
        assert!(out.contains("OK"));
        assert!(out.ends_with(']'));

        let long = "x".repeat(70);
        let out = banner(&long, false, true);
        assert!(out.starts_with(&format!("{long}\n\x1b[60G[")));
        assert!(out.contains("FAILED"));
    }
}
