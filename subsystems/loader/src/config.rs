//! # Launch Configuration
//!
//! Text format describing one program to launch:
//!
//! ```text
//! filename=bin/hello        # settings, one key=value per line
//! core_start=0x4
//! verbose=3
//!
//! first argument            # arguments, one per line, until a blank line
//! second argument
//!
//! HOME=/                    # environment entries, one per line, to the end
//! TERM=dumb
//! ```
//!
//! `#` starts a comment running to the end of the line and `\` makes the next
//! character literal. Lines holding only a comment are ignored. A blank line
//! or a line that is not a known setting ends the settings section; such a
//! line is consumed.
//!
//! Recognized settings: `filename`, `core_start`, `core_size`, `verbose`
//! (`true` or a number), `noprogname`, `timeit` and `exclusive` (`true` or
//! `false`). Numbers accept `0x` hexadecimal and leading-zero octal and are
//! read up to the first character that is not a digit. A flag with any other
//! value is not a setting.

use alloc::string::String;
use alloc::vec::Vec;

use crate::context::Verbosity;
use crate::loader::{LaunchParams, LoadFlags};
use crate::{LoadError, LoadResult};

/// A parsed configuration
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// What to load
    pub params: LaunchParams,
    /// How to load it
    pub flags: LoadFlags,
}

/// One logical line after comment and escape processing
#[derive(Debug, Default)]
struct Line {
    text: String,
    /// Byte position of the first unescaped `=`
    split: Option<usize>,
    /// Had a comment and nothing else
    comment_only: bool,
}

impl Line {
    fn is_blank(&self) -> bool {
        self.text.is_empty() && !self.comment_only
    }
}

fn lines(text: &str) -> Vec<Line> {
    let mut out = Vec::new();
    let mut line = Line::default();
    let mut chars = text.chars();
    let mut pending = false;

    while let Some(c) = chars.next() {
        pending = true;
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    line.text.push(next);
                }
            },
            '#' => {
                line.comment_only = line.text.is_empty();
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        break;
                    }
                }
                out.push(core::mem::take(&mut line));
                pending = false;
            },
            '\n' => {
                out.push(core::mem::take(&mut line));
                pending = false;
            },
            '=' if line.split.is_none() => {
                line.split = Some(line.text.len());
                line.text.push('=');
            },
            other => line.text.push(other),
        }
    }
    if pending {
        out.push(line);
    }
    out.retain(|l| !(l.comment_only && l.text.is_empty()));
    out
}

/// Read the leading number of `value` the way C's `strtoul(.., 0)` does.
///
/// Parsing stops at the first character that is not a digit of the detected
/// radix; no digits at all reads as 0. Overflow saturates.
fn parse_number(value: &str) -> u64 {
    let value = value.trim_start();
    let value = value.strip_prefix('+').unwrap_or(value);
    let (radix, digits) = match value.as_bytes() {
        [b'0', b'x' | b'X', next, ..] if next.is_ascii_hexdigit() => (16, &value[2..]),
        [b'0', ..] => (8, value),
        _ => (10, value),
    };
    digits
        .chars()
        .map_while(|c| c.to_digit(radix))
        .fold(0u64, |acc, d| acc.saturating_mul(radix as u64).saturating_add(d as u64))
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Apply one setting; `false` means the line is not a recognised setting.
///
/// Flags only accept `true` or `false`, so any other value ends the settings
/// section like an unknown key.
fn apply_setting(key: &str, value: &str, params: &mut LaunchParams, flags: &mut LoadFlags) -> bool {
    let flag = match key.trim() {
        "filename" => {
            params.fname = String::from(value.trim());
            return true;
        },
        "core_start" => {
            params.core_start = saturate(parse_number(value));
            return true;
        },
        "core_size" => {
            params.core_size = saturate(parse_number(value));
            return true;
        },
        "verbose" => {
            params.verbose = match value.trim() {
                "true" => {
                    log::warn!("config: verbosity set to maximum");
                    Verbosity::MAX
                },
                other => Verbosity(parse_number(other).min(u8::MAX as u64) as u8),
            };
            return true;
        },
        "noprogname" => LoadFlags::NO_PROGNAME,
        "timeit" => LoadFlags::TIMEIT,
        "exclusive" => LoadFlags::EXCLUSIVE,
        _ => return false,
    };
    match value.trim() {
        "true" => flags.insert(flag),
        "false" => flags.remove(flag),
        _ => return false,
    }
    true
}

impl LaunchConfig {
    /// Parse configuration text.
    ///
    /// The argument vector starts with the file name unless `noprogname` is
    /// set. A missing `filename` is an error.
    pub fn parse(text: &str) -> LoadResult<Self> {
        let mut params = LaunchParams::new("");
        params.verbose = Verbosity::MAX;
        let mut flags = LoadFlags::empty();

        let mut lines = lines(text).into_iter();

        for line in lines.by_ref() {
            if line.is_blank() {
                break;
            }
            let applied = match line.split {
                Some(at) => {
                    let (key, value) = (&line.text[..at], &line.text[at + 1..]);
                    apply_setting(key, value, &mut params, &mut flags)
                },
                None => false,
            };
            if !applied {
                log::warn!("config: '{}' is not a setting, settings end here", line.text);
                break;
            }
        }

        let mut argv = Vec::new();
        for line in lines.by_ref() {
            if line.is_blank() {
                break;
            }
            argv.push(line.text);
        }

        let env: Vec<String> = lines.filter(|l| !l.is_blank()).map(|l| l.text).collect();

        if params.fname.is_empty() {
            return Err(LoadError::InvalidConfig("no filename"));
        }
        if !flags.contains(LoadFlags::NO_PROGNAME) {
            argv.insert(0, params.fname.clone());
        }
        params.argv = argv;
        params.envp = Some(env_block(&env));

        Ok(Self { params, flags })
    }
}

/// Join entries into a NUL-separated block ending in a double NUL
pub fn env_block<S: AsRef<str>>(entries: &[S]) -> Vec<u8> {
    let mut block = Vec::new();
    for entry in entries {
        block.extend_from_slice(entry.as_ref().as_bytes());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    #[test]
    fn test_full_config() {
        let text = "\
filename=bin/hello   # the program
core_start=0x4
core_size=010
verbose=3

first arg
second\\=arg

HOME=/
TERM=dumb
";
        let config = LaunchConfig::parse(text).unwrap();
        let p = &config.params;
        assert_eq!(p.fname, "bin/hello");
        assert_eq!(p.core_start, 4);
        assert_eq!(p.core_size, 8);
        assert_eq!(p.verbose, Verbosity(3));
        assert_eq!(p.argv, vec!["bin/hello", "first arg", "second=arg"]);
        assert_eq!(p.envp.as_deref(), Some(&b"HOME=/\0TERM=dumb\0\0"[..]));
        assert_eq!(config.flags, LoadFlags::empty());
    }

    #[test]
    fn test_flags_and_defaults() {
        let config = LaunchConfig::parse("filename=a\nnoprogname=true\ntimeit=true\n\nx\n").unwrap();
        assert_eq!(config.flags, LoadFlags::NO_PROGNAME | LoadFlags::TIMEIT);
        assert_eq!(config.params.argv, vec!["x"]);
        assert_eq!(config.params.core_start, 0);
        assert_eq!(config.params.core_size, 1);
        assert_eq!(config.params.verbose, Verbosity::MAX);
        assert_eq!(config.params.envp.as_deref(), Some(&b"\0\0"[..]));
    }

    #[test]
    fn test_unknown_key_ends_settings() {
        let config = LaunchConfig::parse("filename=p\nbogus=1\nverbose=2\n").unwrap();
        // The unknown line is consumed; the next line is an argument
        assert_eq!(config.params.argv, vec!["p", "verbose=2"]);
        assert_eq!(config.params.verbose, Verbosity::MAX);
    }

    #[test]
    fn test_comment_lines_are_ignored() {
        let text = "# header\nfilename=p\n# between\ncore_size=2\n\n#note\narg\n";
        let config = LaunchConfig::parse(text).unwrap();
        assert_eq!(config.params.core_size, 2);
        assert_eq!(config.params.argv, vec!["p", "arg"]);
    }

    #[test]
    fn test_escaped_hash_and_newline() {
        let config = LaunchConfig::parse("filename=p\n\nnot \\# a comment\nsplit\\\nline\n").unwrap();
        assert_eq!(config.params.argv, vec!["p", "not # a comment", "split\nline"]);
    }

    #[test]
    fn test_missing_filename() {
        assert_eq!(
            LaunchConfig::parse("verbose=1\n\narg\n").err(),
            Some(LoadError::InvalidConfig("no filename"))
        );
    }

    #[test]
    fn test_bad_numbers_read_leading_digits() {
        let config =
            LaunchConfig::parse("filename=p\ncore_start=zz\ncore_size=12ab\nverbose=abc\n\nx\n")
                .unwrap();
        assert_eq!(config.params.core_start, 0);
        assert_eq!(config.params.core_size, 12);
        assert_eq!(config.params.verbose, Verbosity(0));
        assert_eq!(config.params.argv, vec!["p", "x"]);
    }

    #[test]
    fn test_non_boolean_flag_ends_settings() {
        let config = LaunchConfig::parse("filename=p\nexclusive=maybe\ntimeit=true\n").unwrap();
        assert_eq!(config.flags, LoadFlags::empty());
        assert_eq!(config.params.argv, vec!["p", "timeit=true"]);

        let config = LaunchConfig::parse("filename=p\nnoprogname=yes\n\nx\n").unwrap();
        assert!(!config.flags.contains(LoadFlags::NO_PROGNAME));
        // The blank line is now the argument terminator
        assert_eq!(config.params.argv, vec!["p"]);
        assert_eq!(config.params.envp.as_deref(), Some(&b"x\0\0"[..]));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(parse_number("0x1f"), 31);
        assert_eq!(parse_number("017"), 15);
        assert_eq!(parse_number("0"), 0);
        assert_eq!(parse_number(" 42 "), 42);
        assert_eq!(parse_number("019"), 1);
        assert_eq!(parse_number("0xg"), 0);
        assert_eq!(parse_number("+7"), 7);
        assert_eq!(parse_number(""), 0);
        assert_eq!(parse_number("99999999999999999999999"), u64::MAX);
        assert_eq!(saturate(1 << 40), u32::MAX);
    }

    #[test]
    fn test_env_block() {
        assert_eq!(env_block(&["A=1", "B=2"]), b"A=1\0B=2\0\0".to_vec());
        assert_eq!(env_block::<&str>(&[]), b"\0\0".to_vec());
    }
}
