//! Text rendition of a collected graph.
//!
//! The XML output mirrors the opcode streams one element per opcode. It exists for
//! diffing and debugging; there is no XML reader, and the loader rejects XML input.

use std::fmt::Write as _;
use std::io::{Seek, Write};

use crate::error::{GraphPackError, Result};
use crate::format::CURRENT_VERSION;
use crate::graph::ObjectCollection;
use crate::io::SeqWriter;
use crate::object::ObjectPtr;
use crate::stream::Opcode;

/// Prefix every XML rendition starts with.
pub const XML_PREFIX: &[u8] = b"<?xml";

/// Writes `collection` as XML. Returns the number of bytes written.
pub fn write_xml<W: Write + Seek>(out: &mut SeqWriter<W>, collection: &ObjectCollection) -> Result<u64> {
    let start = out.relative_offset();
    let mut text = String::new();
    emit(
        &mut text,
        format_args!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<graphpack version=\"{CURRENT_VERSION}\" objects=\"{}\">\n",
            collection.len()
        ),
    )?;
    out.write_all(text.as_bytes())?;

    let index_of = |object: &ObjectPtr| collection.find(object).map_or(0, |id| id.as_u32() + 1);

    for (i, node) in collection.nodes().iter().enumerate() {
        text.clear();
        let parent = node.object.parent().map_or(0, |p| index_of(&p));
        emit(
            &mut text,
            format_args!(
                "  <object index=\"{}\" class=\"{}\" parent=\"{parent}\">\n",
                i + 1,
                escape(node.object.class().name().as_str())
            ),
        )?;

        let mut depth = 2;
        for op in node.stream.iter() {
            if matches!(op, Opcode::CompoundEnd | Opcode::ArrayEnd | Opcode::SkipEnd) {
                depth -= 1;
            }
            let pad = "  ".repeat(depth);
            let line = match op {
                Opcode::CompoundBegin(ty) => format!("<compound type=\"{}\">", escape(ty.name().as_str())),
                Opcode::CompoundEnd => "</compound>".to_string(),
                Opcode::ArrayBegin(count) => format!("<array count=\"{count}\">"),
                Opcode::ArrayEnd => "</array>".to_string(),
                Opcode::SkipBegin => "<skip>".to_string(),
                Opcode::SkipEnd => "</skip>".to_string(),
                Opcode::RawData(span) => {
                    format!("<raw len=\"{}\">{}</raw>", span.len(), hex(node.stream.raw(*span)))
                }
                Opcode::NameRef(name) => format!("<name value=\"{}\"/>", escape(name.as_str())),
                Opcode::TypeRef(ty) => format!("<type name=\"{}\"/>", escape(ty.name().as_str())),
                Opcode::PropertyRef(property) => format!(
                    "<property owner=\"{}\" name=\"{}\"/>",
                    escape(property.owner().as_str()),
                    escape(property.name().as_str())
                ),
                Opcode::ObjectPointerRef(target) => {
                    format!("<ptr ref=\"{}\"/>", target.as_ref().map_or(0, index_of))
                }
                Opcode::ResourceRef { resource, is_async } => match resource {
                    Some(r) => format!(
                        "<resource id=\"{}\" class=\"{}\" async=\"{is_async}\"/>",
                        r.id(),
                        escape(r.class().as_str())
                    ),
                    None => format!("<resource async=\"{is_async}\"/>"),
                },
                Opcode::InlineBuffer(buffer) => match buffer {
                    Some(b) => format!("<buffer hash=\"{:016x}\" size=\"{}\"/>", b.content_crc(), b.size()),
                    None => "<buffer/>".to_string(),
                },
            };
            emit(&mut text, format_args!("{pad}{line}\n"))?;
            if matches!(op, Opcode::CompoundBegin(_) | Opcode::ArrayBegin(_) | Opcode::SkipBegin) {
                depth += 1;
            }
        }

        text.push_str("  </object>\n");
        out.write_all(text.as_bytes())?;
    }

    out.write_all(b"</graphpack>\n")?;
    Ok(out.relative_offset() - start)
}

/// Returns true if `bytes` look like an XML rendition.
pub fn is_xml(bytes: &[u8]) -> bool {
    bytes.starts_with(XML_PREFIX)
}

fn emit(text: &mut String, args: std::fmt::Arguments<'_>) -> Result<()> {
    text.write_fmt(args)
        .map_err(|e| GraphPackError::Internal(format!("XML formatting failed: {e}")))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
