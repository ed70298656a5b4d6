//! Call-site arguments
//!
//! A trace call is a list of [`TraceArg`]s: static text that becomes part
//! of the registered message, and dynamic values captured on every call.
//! The first call at a site turns the list into a message template; later
//! calls only contribute their dynamic values.

use std::borrow::Cow;

use crate::format::{ArgFormat, FormatSlot, Value, MAX_DYNAMIC_ARGS};

/// One argument of a trace call
#[derive(Debug, Clone, PartialEq)]
pub enum TraceArg {
    /// Literal text, registered once
    Static(Cow<'static, str>),
    /// A value captured on every call
    Dynamic {
        value: Value,
        /// Render with `%x` instead of `%s`
        hex: bool,
        /// Tailer formatter plugin for this slot
        plugin: Option<&'static str>,
    },
}

/// Trace `value` live on every call
pub fn var(value: impl Into<Value>) -> TraceArg {
    TraceArg::Dynamic {
        value: value.into(),
        hex: false,
        plugin: None,
    }
}

/// Trace `value` live, rendered in hexadecimal
pub fn hex(value: impl Into<Value>) -> TraceArg {
    TraceArg::Dynamic {
        value: value.into(),
        hex: true,
        plugin: None,
    }
}

/// Trace `value` live, rendered by the tailer formatter plugin `name`
pub fn plugin(value: impl Into<Value>, name: &'static str) -> TraceArg {
    TraceArg::Dynamic {
        value: value.into(),
        hex: false,
        plugin: Some(name),
    }
}

impl From<&'static str> for TraceArg {
    fn from(s: &'static str) -> Self {
        TraceArg::Static(Cow::Borrowed(s))
    }
}

impl From<String> for TraceArg {
    fn from(s: String) -> Self {
        TraceArg::Static(Cow::Owned(s))
    }
}

/// Dynamic values of a call, at most [`MAX_DYNAMIC_ARGS`] of them
pub(crate) fn dynamic_values(args: &[TraceArg]) -> Vec<&Value> {
    args.iter()
        .filter_map(|arg| match arg {
            TraceArg::Dynamic { value, .. } => Some(value),
            TraceArg::Static(_) => None,
        })
        .take(MAX_DYNAMIC_ARGS)
        .collect()
}

/// Compose the message text and argument format for a first call
///
/// Pieces are joined with single spaces. Static `%` is escaped; each kept
/// dynamic argument becomes `%s` (or `%x`). Dynamic arguments past the
/// limit are dropped from the template as well as from the record.
pub(crate) fn template(args: &[TraceArg]) -> (String, ArgFormat) {
    let mut pieces: Vec<Cow<'_, str>> = Vec::with_capacity(args.len());
    let mut slots = Vec::new();

    for arg in args {
        match arg {
            TraceArg::Static(text) => pieces.push(Cow::Owned(text.replace('%', "%%"))),
            TraceArg::Dynamic { .. } if slots.len() >= MAX_DYNAMIC_ARGS => {}
            TraceArg::Dynamic { value, hex, plugin } => {
                pieces.push(Cow::Borrowed(if *hex { "%x" } else { "%s" }));
                let code = value.registration_code();
                slots.push(match plugin {
                    Some(name) => FormatSlot::with_plugin(code, *name),
                    None => FormatSlot::new(code),
                });
            }
        }
    }

    (pieces.join(" "), ArgFormat(slots))
}
