//! Message and line rendering
//!
//! Message texts use `printf`-style placeholders: `%s` prints a value in
//! its natural form, `%x`/`%X`/`%p` print integers in hexadecimal, and
//! flags, width and precision are honored (`%-8s`, `%08x`, `%+d`, `%.2f`).

use std::fmt::Write as _;
use std::io::{self, Write};

use crate::catalog::Descriptor;
use crate::clock::ClockOrigin;
use crate::format::value::{float_text, Value};

use super::formatter::Formatters;

/// A parsed `%` conversion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Spec {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
    width: Option<usize>,
    precision: Option<usize>,
    conv: char,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Hole(Spec),
}

fn parse_template(text: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            literal.push('%');
            continue;
        }

        let mut spec = Spec::default();
        let mut raw = String::from("%");
        while let Some(&f) = chars.peek() {
            match f {
                '-' => spec.left = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '0' => spec.zero = true,
                '#' => spec.alt = true,
                _ => break,
            }
            raw.push(f);
            chars.next();
        }
        let mut width = String::new();
        while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(d);
            raw.push(d);
            chars.next();
        }
        spec.width = width.parse().ok();
        if chars.peek() == Some(&'.') {
            raw.push('.');
            chars.next();
            let mut precision = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                precision.push(d);
                raw.push(d);
                chars.next();
            }
            spec.precision = Some(precision.parse().unwrap_or(0));
        }
        // Length modifiers carry no meaning here.
        while let Some(&m) = chars.peek().filter(|m| matches!(m, 'l' | 'h' | 'z' | 'j' | 't' | 'q')) {
            raw.push(m);
            chars.next();
        }
        match chars.peek() {
            Some(&conv) if "sdiuxXpfFeEgGcb".contains(conv) => {
                chars.next();
                spec.conv = conv;
                if !literal.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut literal)));
                }
                pieces.push(Piece::Hole(spec));
            }
            _ => literal.push_str(&raw),
        }
    }
    if !literal.is_empty() {
        pieces.push(Piece::Text(literal));
    }
    pieces
}

fn is_numeric(value: &Value) -> bool {
    !matches!(value, Value::Str(_) | Value::Null | Value::Char(_) | Value::Bool(_))
}

fn float_of(value: &Value) -> Option<f64> {
    Some(match value {
        Value::F32(v) => *v as f64,
        Value::F64(v) => *v,
        Value::U8(v) => *v as f64,
        Value::U16(v) => *v as f64,
        Value::I32(v) => *v as f64,
        Value::I64(v) => *v as f64,
        Value::U64(v) => *v as f64,
        _ => return None,
    })
}

fn render_value(spec: &Spec, value: &Value) -> String {
    if value.is_null() {
        return "None".to_string();
    }
    let hex_digits = |n: u64| match spec.conv {
        'X' => format!("{:X}", n),
        _ => format!("{:x}", n),
    };
    let mut body = match (spec.conv, value) {
        ('x' | 'X' | 'p', Value::Str(s)) => s.clone(),
        ('x' | 'X' | 'p', v) => match v {
            Value::I32(n) => hex_digits(*n as u32 as u64),
            Value::I64(n) => hex_digits(*n as u64),
            other => match other.as_u64() {
                Some(n) => hex_digits(n),
                None => other.to_string(),
            },
        },
        ('f' | 'F' | 'e' | 'E' | 'g' | 'G', v) => match float_of(v) {
            Some(f) => match (spec.conv, spec.precision) {
                ('e' | 'E', p) => {
                    let s = format!("{:.*e}", p.unwrap_or(6), f);
                    if spec.conv == 'E' {
                        s.to_uppercase()
                    } else {
                        s
                    }
                }
                ('g' | 'G', None) => float_text(f),
                (_, p) => format!("{:.*}", p.unwrap_or(6), f),
            },
            None => v.to_string(),
        },
        ('s', Value::Str(s)) => match spec.precision {
            Some(p) => s.chars().take(p).collect(),
            None => s.clone(),
        },
        (_, v) => v.to_string(),
    };

    let hex_conv = matches!(spec.conv, 'x' | 'X' | 'p');
    let numeric = is_numeric(value) || (hex_conv && value.as_u64().is_some());
    if numeric && !body.starts_with('-') {
        if spec.plus && !hex_conv {
            body.insert(0, '+');
        } else if spec.space && !hex_conv {
            body.insert(0, ' ');
        }
    }
    let prefix = if spec.conv == 'p' || (spec.alt && matches!(spec.conv, 'x' | 'X')) {
        if spec.conv == 'X' {
            "0X"
        } else {
            "0x"
        }
    } else {
        ""
    };
    let prefix = if numeric { prefix } else { "" };

    let len = prefix.len() + body.chars().count();
    let width = spec.width.unwrap_or(0);
    if len >= width {
        return format!("{}{}", prefix, body);
    }
    let fill = width - len;
    if spec.left {
        format!("{}{}{}", prefix, body, " ".repeat(fill))
    } else if spec.zero && numeric {
        let (sign, digits) = match body.chars().next() {
            Some(c @ ('-' | '+' | ' ')) => (c.to_string(), body[1..].to_string()),
            _ => (String::new(), body),
        };
        format!("{}{}{}{}", sign, prefix, "0".repeat(fill), digits)
    } else {
        format!("{}{}{}", " ".repeat(fill), prefix, body)
    }
}

/// Render a message from its descriptor and decoded values
///
/// When the number of placeholders does not match the number of values the
/// text is printed unexpanded followed by ` % (a, b)`.
pub fn render_message(desc: &Descriptor, values: &[Value], formatters: &Formatters) -> String {
    let pieces = parse_template(&desc.text);
    let holes = pieces
        .iter()
        .filter(|p| matches!(p, Piece::Hole(_)))
        .count();

    let plugin_text = |i: usize, value: &Value| -> Option<String> {
        let name = desc.format.slots().get(i)?.plugin.as_deref()?;
        if value.is_null() {
            return None;
        }
        formatters.render(name, value)
    };

    if holes != values.len() {
        let rendered: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, v)| plugin_text(i, v).unwrap_or_else(|| v.to_string()))
            .collect();
        return format!("{} % ({})", desc.text, rendered.join(", "));
    }

    let mut out = String::with_capacity(desc.text.len() + 16 * values.len());
    let mut next = 0;
    for piece in pieces {
        match piece {
            Piece::Text(text) => out.push_str(&text),
            Piece::Hole(spec) => {
                let value = &values[next];
                match plugin_text(next, value) {
                    Some(text) => {
                        let plain = Spec {
                            conv: 's',
                            ..spec.clone()
                        };
                        out.push_str(&render_value(&plain, &Value::Str(text)));
                    }
                    None => out.push_str(&render_value(&spec, value)),
                }
                next += 1;
            }
        }
    }
    out
}

/// A decoded record ready to print
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub tsc: u64,
    /// Index of the source file, in argument order
    pub source: usize,
    pub level: u8,
    pub pos: u64,
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl Entry {
    /// Global output order: time, then file argument order
    pub fn key(&self) -> (u64, usize, u8, u64) {
        (self.tsc, self.source, self.level, self.pos)
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Which optional columns are printed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Columns {
    pub tsc: bool,
    pub file_name: bool,
    pub location: bool,
}

/// Writes entries as text lines, tracking the time delta between lines
#[derive(Debug, Clone, Default)]
pub struct LinePrinter {
    columns: Columns,
    last_tsc: Option<u64>,
}

impl LinePrinter {
    pub fn new(columns: Columns) -> Self {
        Self {
            columns,
            last_tsc: None,
        }
    }

    /// Format one output line (without the newline)
    pub fn format_line(&mut self, entry: &Entry, origin: &ClockOrigin, name: &str) -> String {
        let mut line = String::with_capacity(96 + entry.message.len());
        let _ = write!(
            line,
            "{} {}",
            origin.to_local(entry.tsc).format("%Y-%m-%d %H:%M:%S%.6f"),
            entry.level
        );
        if self.columns.tsc {
            let _ = write!(line, " 0x{:016x}", entry.tsc);
        }
        if self.columns.file_name {
            let _ = write!(line, " {}", name);
        }
        let delta_us = self
            .last_tsc
            .map(|last| entry.tsc.saturating_sub(last) / 1000)
            .unwrap_or(0);
        self.last_tsc = Some(entry.tsc);
        let _ = write!(line, " +{}", delta_us);
        if self.columns.location {
            let _ = write!(line, " {}:{}", entry.file, entry.line);
        }
        let _ = write!(line, " \"{}\"", entry.message);
        line
    }

    pub fn write_line<W: Write>(
        &mut self,
        out: &mut W,
        entry: &Entry,
        origin: &ClockOrigin,
        name: &str,
    ) -> io::Result<()> {
        let line = self.format_line(entry, origin, name);
        writeln!(out, "{}", line)
    }
}

/// Details of one decode failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
    pub file: String,
    pub level: u8,
    pub msg_id: Option<u32>,
    pub message: Option<String>,
    pub format: Option<String>,
    pub reason: String,
}

impl CorruptionReport {
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "---------- corruption detected in {}", self.file)?;
        writeln!(out, "log level: {}", self.level)?;
        if let Some(id) = self.msg_id {
            writeln!(out, "message id: {}", id)?;
        }
        if let Some(message) = &self.message {
            writeln!(out, "message: {}", message)?;
        }
        if let Some(format) = &self.format {
            writeln!(out, "format: {}", format)?;
        }
        writeln!(out, "reason: {}", self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ArgFormat;

    fn desc(text: &str, format: &str) -> Descriptor {
        Descriptor {
            id: 0,
            file: "a.rs".to_string(),
            line: 1,
            text: text.to_string(),
            format: ArgFormat::parse(format).unwrap(),
            flags: 0,
        }
    }

    fn render(text: &str, format: &str, values: &[Value]) -> String {
        render_message(&desc(text, format), values, &Formatters::new())
    }

    #[test]
    fn test_plain_placeholders() {
        assert_eq!(
            render("n %s ok %s at %s", "q,b,d", &[Value::I64(42), Value::Bool(true), Value::F64(1.5)]),
            "n 42 ok True at 1.5"
        );
        assert_eq!(render("100%% %s", "p", &[Value::Null]), "100% None");
    }

    #[test]
    fn test_hex_and_width() {
        assert_eq!(render("%x", "Q", &[Value::U64(0xcafe)]), "cafe");
        assert_eq!(render("%08x", "i", &[Value::I32(0xbeef)]), "0000beef");
        assert_eq!(render("%p", "Q", &[Value::U64(0x10)]), "0x10");
        assert_eq!(render("[%-4s]", "p", &[Value::Str("ab".into())]), "[ab  ]");
        assert_eq!(render("[%4s]", "i", &[Value::I32(7)]), "[   7]");
        assert_eq!(render("%+d", "i", &[Value::I32(7)]), "+7");
        assert_eq!(render("%05d", "i", &[Value::I32(-42)]), "-0042");
        assert_eq!(render("%.2f", "d", &[Value::F64(3.14159)]), "3.14");
        assert_eq!(render("%x", "i", &[Value::I32(-1)]), "ffffffff");
    }

    #[test]
    fn test_float_and_char_text() {
        assert_eq!(render("%s", "d", &[Value::F64(2.0)]), "2.0");
        assert_eq!(render("%s", "d", &[Value::F64(0.1)]), "0.1");
        assert_eq!(render("%s", "c", &[Value::Char(b'\n')]), "\\n");
    }

    #[test]
    fn test_placeholder_mismatch_falls_back() {
        assert_eq!(
            render("only one %s", "q,q", &[Value::I64(1), Value::I64(2)]),
            "only one %s % (1, 2)"
        );
    }

    #[test]
    fn test_plugin_rendering() {
        let mut formatters = Formatters::new();
        formatters.insert(serde_json::from_str(r#"{"name":"addr","kind":"ipv4"}"#).unwrap());
        let d = desc("peer %s", "Q@addr");
        assert_eq!(
            render_message(&d, &[Value::U64(0xc0a8_0001)], &formatters),
            "peer 192.168.0.1"
        );
        // Unknown plugin falls back to the plain rendering
        let d = desc("peer %s", "Q@nope");
        assert_eq!(render_message(&d, &[Value::U64(5)], &formatters), "peer 5");
    }

    #[test]
    fn test_line_format() {
        let origin = ClockOrigin {
            mono_ns: 1_000,
            utc_ns: 1_700_000_000_000_000_000,
        };
        let entry = Entry {
            tsc: 2_000_000,
            source: 0,
            level: 9,
            pos: 0,
            file: "a.rs".to_string(),
            line: 3,
            message: "hello".to_string(),
        };
        let mut printer = LinePrinter::new(Columns {
            tsc: true,
            file_name: true,
            location: true,
        });
        let first = printer.format_line(&entry, &origin, "t.qt");
        assert!(first.ends_with(" 9 0x00000000001e8480 t.qt +0 a.rs:3 \"hello\""), "{}", first);

        let later = Entry {
            tsc: 2_500_000,
            ..entry
        };
        let second = printer.format_line(&later, &origin, "t.qt");
        assert!(second.contains(" +500 "), "{}", second);
    }

    #[test]
    fn test_corruption_report() {
        let report = CorruptionReport {
            file: "t.qt".to_string(),
            level: 4,
            msg_id: Some(7),
            message: Some("x %s".to_string()),
            format: Some("q".to_string()),
            reason: "payload length 3 does not match".to_string(),
        };
        let mut out = Vec::new();
        report.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("---------- corruption detected in t.qt\nlog level: 4\n"));
        assert!(text.contains("message id: 7\n"));
        assert!(text.ends_with("reason: payload length 3 does not match\n"));
    }
}
