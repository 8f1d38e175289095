//! Terminal styling and utility functions.

pub fn blue(s: &str) -> String {
    format!("\x1b[38;5;39m{}\x1b[0m", s)
}
pub fn white(s: &str) -> String {
    format!("\x1b[39m{}\x1b[0m", s)
}
pub fn yellow(s: &str) -> String {
    format!("\x1b[33m{}\x1b[0m", s)
}
pub fn green(s: &str) -> String {
    format!("\x1b[32m{}\x1b[0m", s)
}
pub fn gray(s: &str) -> String {
    format!("\x1b[90m{}\x1b[0m", s)
}
pub fn red(s: &str) -> String {
    format!("\x1b[31m{}\x1b[0m", s)
}
