//! Canonical JSON output for the control plane.
//!
//! Clients compare serialized bodies byte for byte, so the layout is fixed: objects break one
//! field per line with two spaces of indentation per nesting level and `" : "` between key and
//! value, arrays stay inline as `[ a, b ]`, and an empty top-level list is written as `[]`.

use crate::common::data::{Expectation, HttpRequest, PortBinding};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{ser::Formatter, Serializer, Value};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot serialize {0}: {1}")]
    SerializeError(&'static str, serde_json::Error),
    #[error("incorrect {0} json format for:\n\n{1}\n\n {2}")]
    DeserializeError(&'static str, String, serde_json::Error),
    #[error("serialized output is not valid UTF-8: {0}")]
    EncodingError(#[from] std::string::FromUtf8Error),
}

/// A `serde_json` formatter producing the canonical pretty-printed layout.
#[derive(Debug, Default)]
pub struct PrettyPrinter {
    current_indent: usize,
    has_value: bool,
}

impl PrettyPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    fn indent<W: ?Sized + io::Write>(&self, writer: &mut W) -> io::Result<()> {
        for _ in 0..self.current_indent {
            writer.write_all(b"  ")?;
        }
        Ok(())
    }
}

impl Formatter for PrettyPrinter {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.has_value = false;
        writer.write_all(b"[")
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b" ]")
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        writer.write_all(if first { b" " } else { b", " })
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.current_indent += 1;
        self.has_value = false;
        writer.write_all(b"{")
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.current_indent -= 1;
        if self.has_value {
            writer.write_all(b"\n")?;
            self.indent(writer)?;
        } else {
            writer.write_all(b" ")?;
        }
        writer.write_all(b"}")
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        writer.write_all(if first { b"\n" } else { b",\n" })?;
        self.indent(writer)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b" : ")
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }
}

/// Serializes any value in the canonical layout.
pub fn to_pretty_json<T: Serialize + ?Sized>(
    what: &'static str,
    value: &T,
) -> Result<String, Error> {
    let mut buffer = Vec::with_capacity(256);
    let mut serializer = Serializer::with_formatter(&mut buffer, PrettyPrinter::new());
    value
        .serialize(&mut serializer)
        .map_err(|err| Error::SerializeError(what, err))?;
    Ok(String::from_utf8(buffer)?)
}

/// Serializes a list, writing `[]` for an empty one.
pub fn serialize_list<T: Serialize>(what: &'static str, items: &[T]) -> Result<String, Error> {
    if items.is_empty() {
        return Ok("[]".to_string());
    }
    to_pretty_json(what, items)
}

/// Prefixes every line with two spaces, as used when embedding a payload in a log message.
pub fn indent_lines(text: &str) -> String {
    text.lines()
        .map(|line| format!("  {}", line))
        .collect::<Vec<String>>()
        .join("\n")
}

fn body_as_str(body: &[u8]) -> String {
    String::from_utf8_lossy(body).to_string()
}

fn deserialize<T: DeserializeOwned>(what: &'static str, body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body)
        .map_err(|err| Error::DeserializeError(what, body_as_str(body), err))
}

/// Reads an optional request filter. An empty body means "no filter".
pub fn deserialize_request_filter(body: &[u8]) -> Result<Option<HttpRequest>, Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    deserialize("request", body).map(Some)
}

/// Reads one expectation or an array of expectations.
pub fn deserialize_expectations(body: &[u8]) -> Result<Vec<Expectation>, Error> {
    let value: Value = deserialize("expectation", body)?;
    let result = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Expectation>, _>>(),
        other => serde_json::from_value(other).map(|e| vec![e]),
    };
    result.map_err(|err| Error::DeserializeError("expectation", body_as_str(body), err))
}

pub fn deserialize_port_binding(body: &[u8]) -> Result<PortBinding, Error> {
    deserialize("port binding", body)
}
