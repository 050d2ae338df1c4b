//! Line-oriented terminal output
//!
//! Every user-facing line is also written to the tracing log so the per-run
//! log file holds the full transcript. Colors are disabled when stdout is not
//! a terminal or `NO_COLOR` is set.

use std::io::IsTerminal;
use std::sync::OnceLock;

static COLOR: OnceLock<bool> = OnceLock::new();

const BOLD: &str = "\x1b[1m";
const HEADER: &str = "\x1b[95m";
const CYAN: &str = "\x1b[96m";
const GREEN: &str = "\x1b[92m";
const YELLOW: &str = "\x1b[93m";
const RED: &str = "\x1b[91m";
const RESET: &str = "\x1b[0m";

fn color_enabled() -> bool {
    *COLOR.get_or_init(|| std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal())
}

/// Wrap `text` in an ANSI style when colors are on
pub fn paint(style: &str, text: &str) -> String {
    if color_enabled() {
        format!("{}{}{}", style, text, RESET)
    } else {
        text.to_string()
    }
}

pub fn header(text: &str) {
    tracing::info!(target: "tt_jukebox::display", "{}", text);
    let rule = "=".repeat(70);
    println!();
    println!("{}", paint(&format!("{}{}", HEADER, BOLD), &rule));
    println!("{}", paint(&format!("{}{}", HEADER, BOLD), text));
    println!("{}", paint(&format!("{}{}", HEADER, BOLD), &rule));
}

pub fn success(text: &str) {
    tracing::info!(target: "tt_jukebox::display", "{}", text);
    println!("{}", paint(GREEN, text));
}

pub fn info(text: &str) {
    tracing::info!(target: "tt_jukebox::display", "{}", text);
    println!("{}", paint(CYAN, text));
}

pub fn warning(text: &str) {
    tracing::warn!(target: "tt_jukebox::display", "{}", text);
    println!("{}", paint(YELLOW, text));
}

pub fn error(text: &str) {
    tracing::error!(target: "tt_jukebox::display", "{}", text);
    eprintln!("{}", paint(RED, text));
}

/// Unstyled line, e.g. rendered commands meant for copy-paste
pub fn plain(text: &str) {
    tracing::info!(target: "tt_jukebox::display", "{}", text);
    println!("{}", text);
}

pub fn bold(text: &str) -> String {
    paint(BOLD, text)
}

/// Group digits of `n` with commas: 131072 -> "131,072"
pub fn thousands(n: u32) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
