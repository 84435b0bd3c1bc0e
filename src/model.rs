//! Model template scanning and coefficient substitution.
//!
//! The template is scanned once with a streaming XML reader to record the
//! byte ranges of every addressable field. Instances are produced by
//! splicing new text into those ranges, so everything outside them stays
//! byte-identical to the template.

use crate::coefficients::CoefficientVector;
use crate::config::Redirect;
use crate::error::{CalibrationError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::BTreeSet;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

const MATERIAL_TAG: &[u8] = b"material";
const SURFACE_TAG: &[u8] = b"Surface";

/// A text-only child element of the material block.
#[derive(Clone, Debug)]
struct Field {
    name: String,
    /// Trimmed value text inside the element
    value: Range<usize>,
    default: Option<f64>,
}

/// Baseline model description, loaded once per session.
#[derive(Debug)]
pub struct ModelTemplate {
    path: PathBuf,
    text: String,
    material_id: String,
    fields: Vec<Field>,
}

impl ModelTemplate {
    pub fn load(path: &Path, material_id: &str) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| CalibrationError::TemplateParse {
            path: path.to_path_buf(),
            message: format!("cannot read template: {}", e),
        })?;
        Self::parse(path, text, material_id)
    }

    pub fn parse(path: &Path, text: String, material_id: &str) -> Result<Self> {
        let fields = scan_material(&text, material_id)
            .map_err(|message| template_error(path, message))?;
        Ok(Self {
            path: path.to_path_buf(),
            text,
            material_id: material_id.to_string(),
            fields,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn material_id(&self) -> &str {
        &self.material_id
    }

    /// Names of the addressable fields in the material block.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Value currently written in the template, if numeric.
    pub fn default_value(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(|f| f.default)
    }

    fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Node ids referenced by the elements of a named surface.
    pub fn surface_node_ids(&self, surface: &str) -> Result<Vec<u64>> {
        scan_surface(&self.text, surface).map_err(|message| template_error(&self.path, message))
    }
}

fn template_error(path: &Path, message: String) -> CalibrationError {
    CalibrationError::TemplateParse {
        path: path.to_path_buf(),
        message,
    }
}

/// Coefficient-substituted model content owned by one evaluation.
#[derive(Clone, Debug)]
pub struct ModelInstance {
    content: String,
}

impl ModelInstance {
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.content)?;
        Ok(())
    }
}

/// Produces model instances from a template. Output redirection is resolved
/// once at construction since it is identical for every evaluation.
#[derive(Debug, Default)]
pub struct ModelMutator {
    redirect_edits: Vec<(Range<usize>, String)>,
}

impl ModelMutator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the solver's log-data element at `file` inside the workspace.
    pub fn with_redirect(template: &ModelTemplate, redirect: &Redirect, file: &str) -> Result<Self> {
        let edits = scan_redirect(&template.text, redirect, file)
            .map_err(|message| template_error(&template.path, message))?;
        Ok(Self { redirect_edits: edits })
    }

    /// Substitute every coefficient into the template's material block.
    pub fn mutate(
        &self,
        template: &ModelTemplate,
        coefficients: &CoefficientVector,
    ) -> Result<ModelInstance> {
        let mut edits = self.redirect_edits.clone();
        for (name, value) in coefficients.iter() {
            let field = template
                .field(name)
                .ok_or_else(|| CalibrationError::UnknownParameter {
                    name: name.to_string(),
                    material_id: template.material_id.clone(),
                })?;
            edits.push((field.value.clone(), format_value(value)));
        }
        Ok(ModelInstance {
            content: splice(&template.text, edits),
        })
    }
}

/// Shortest round-trip text, switching to exponent form for tiny or huge
/// magnitudes.
pub fn format_value(v: f64) -> String {
    let a = v.abs();
    if a == 0.0 || (1e-4..1e6).contains(&a) {
        format!("{}", v)
    } else {
        format!("{:e}", v)
    }
}

fn splice(text: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by_key(|(r, _)| r.start);
    let mut out = String::with_capacity(text.len() + 64);
    let mut cursor = 0;
    for (range, replacement) in edits {
        out.push_str(&text[cursor..range.start]);
        out.push_str(&replacement);
        cursor = range.end;
    }
    out.push_str(&text[cursor..]);
    out
}

fn attribute_is(e: &BytesStart, key: &str, expected: &str) -> bool {
    matches!(e.try_get_attribute(key), Ok(Some(attr)) if attr.value.as_ref() == expected.as_bytes())
}

fn read_error(reader: &Reader<&[u8]>, err: quick_xml::Error) -> String {
    format!("XML error at byte {}: {}", reader.error_position(), err)
}

fn scan_material(text: &str, material_id: &str) -> std::result::Result<Vec<Field>, String> {
    struct Open {
        name: String,
        start: usize,
        end: usize,
        scalar: bool,
    }

    let mut reader = Reader::from_str(text);
    let mut depth = 0usize;
    let mut material_depth: Option<usize> = None;
    let mut found = false;
    let mut open: Option<Open> = None;
    let mut fields: Vec<Field> = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| read_error(&reader, e))?;
        let pos = reader.buffer_position() as usize;
        match event {
            Event::Start(e) => {
                depth += 1;
                match material_depth {
                    None if !found
                        && e.local_name().as_ref() == MATERIAL_TAG
                        && attribute_is(&e, "id", material_id) =>
                    {
                        material_depth = Some(depth);
                        found = true;
                    }
                    Some(md) if depth == md + 1 => {
                        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                        open = Some(Open { name, start: pos, end: pos, scalar: true });
                    }
                    Some(_) => {
                        if let Some(o) = open.as_mut() {
                            o.scalar = false;
                        }
                    }
                    None => {}
                }
            }
            Event::Text(_) => {
                if let Some(o) = open.as_mut() {
                    o.end = pos;
                }
            }
            Event::CData(_) | Event::Empty(_) | Event::Comment(_) | Event::PI(_) => {
                if let Some(o) = open.as_mut() {
                    o.scalar = false;
                }
            }
            Event::End(_) => {
                if let Some(md) = material_depth {
                    if depth == md + 1 {
                        if let Some(o) = open.take() {
                            if o.scalar && !fields.iter().any(|f| f.name == o.name) {
                                let value = trimmed(text, o.start..o.end);
                                let default = text[value.clone()].parse::<f64>().ok();
                                fields.push(Field { name: o.name, value, default });
                            }
                        }
                    } else if depth == md {
                        material_depth = None;
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !found {
        return Err(format!("no <material id=\"{}\"> block", material_id));
    }
    if fields.is_empty() {
        return Err(format!("material block '{}' has no scalar fields", material_id));
    }
    Ok(fields)
}

fn trimmed(text: &str, range: Range<usize>) -> Range<usize> {
    let slice = &text[range.clone()];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead == slice.len() {
        return range.start..range.start;
    }
    range.start + lead..range.end - trail
}

fn scan_surface(text: &str, surface: &str) -> std::result::Result<Vec<u64>, String> {
    let mut reader = Reader::from_str(text);
    let mut depth = 0usize;
    let mut surface_depth: Option<usize> = None;
    let mut found = false;
    let mut ids = BTreeSet::new();

    loop {
        let event = reader.read_event().map_err(|e| read_error(&reader, e))?;
        match event {
            Event::Start(e) => {
                depth += 1;
                if surface_depth.is_none()
                    && !found
                    && e.local_name().as_ref() == SURFACE_TAG
                    && attribute_is(&e, "name", surface)
                {
                    surface_depth = Some(depth);
                    found = true;
                }
            }
            Event::Text(t) if surface_depth.is_some() => {
                let raw = String::from_utf8_lossy(&t).into_owned();
                for token in raw.split(|c: char| c == ',' || c.is_whitespace()) {
                    if token.is_empty() {
                        continue;
                    }
                    let id = token
                        .parse::<u64>()
                        .map_err(|_| format!("surface '{}': bad node id '{}'", surface, token))?;
                    ids.insert(id);
                }
            }
            Event::End(_) => {
                if surface_depth == Some(depth) {
                    surface_depth = None;
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !found {
        return Err(format!("surface '{}' not found", surface));
    }
    if ids.is_empty() {
        return Err(format!("surface '{}' lists no nodes", surface));
    }
    Ok(ids.into_iter().collect())
}

fn scan_redirect(
    text: &str,
    redirect: &Redirect,
    file: &str,
) -> std::result::Result<Vec<(Range<usize>, String)>, String> {
    let escaped = quick_xml::escape::escape(file).into_owned();
    let mut reader = Reader::from_str(text);
    let mut depth = 0usize;
    let mut logfile_depth: Option<usize> = None;
    let mut edits = Vec::new();

    loop {
        let before = reader.buffer_position() as usize;
        let event = reader.read_event().map_err(|e| read_error(&reader, e))?;
        let (e, is_start) = match event {
            Event::Start(e) => (e, true),
            Event::Empty(e) => (e, false),
            Event::End(_) => {
                if logfile_depth == Some(depth) {
                    logfile_depth = None;
                }
                depth = depth.saturating_sub(1);
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };
        if is_start {
            depth += 1;
        }
        if e.local_name().as_ref().eq_ignore_ascii_case(b"logfile") {
            if is_start && logfile_depth.is_none() {
                logfile_depth = Some(depth);
            }
            continue;
        }
        if logfile_depth.is_none()
            || e.local_name().as_ref() != redirect.tag.as_bytes()
            || !attribute_is(&e, "data", &redirect.data)
        {
            continue;
        }

        let open = before
            + text[before..]
                .find('<')
                .ok_or_else(|| "unterminated element".to_string())?;
        let tag_start = open + 1;
        let tag = &text[tag_start..tag_start + e.len()];
        match attribute_value_range(tag, "file") {
            Some(r) => edits.push((tag_start + r.start..tag_start + r.end, escaped.clone())),
            None => {
                let at = tag_start + e.name().as_ref().len();
                edits.push((at..at, format!(" file=\"{}\"", escaped)));
            }
        }
    }

    if edits.is_empty() {
        return Err(format!(
            "no <{} data=\"{}\"> inside a logfile section",
            redirect.tag, redirect.data
        ));
    }
    Ok(edits)
}

/// Byte range of an attribute's value inside raw start-tag content
/// (`name a="1" b='2'`).
fn attribute_value_range(tag: &str, key: &str) -> Option<Range<usize>> {
    let bytes = tag.as_bytes();
    let skip_ws = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        i
    };

    let mut i = bytes
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    loop {
        i = skip_ws(i);
        if i >= bytes.len() {
            return None;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let name = &tag[key_start..i];
        i = skip_ws(i);
        if bytes.get(i) != Some(&b'=') {
            return None;
        }
        i = skip_ws(i + 1);
        let quote = *bytes.get(i)?;
        if quote != b'"' && quote != b'\'' {
            return None;
        }
        let value_start = i + 1;
        let len = bytes[value_start..].iter().position(|&b| b == quote)?;
        if name == key {
            return Some(value_start..value_start + len);
        }
        i = value_start + len + 1;
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_FEB: &str = r#"<?xml version="1.0" encoding="ISO-8859-1"?>
<febio_spec version="4.0">
	<Material>
		<material id="1" name="Tissue" type="Ogden unconstrained">
			<density>1</density>
			<c1> 1.0 </c1>
			<m1>2</m1>
			<cp>0</cp>
			<fiber type="vector">1,0,0</fiber>
		</material>
		<material id="2" name="Platen" type="rigid body">
			<c1>99</c1>
		</material>
	</Material>
	<Mesh>
		<Surface name="PrescribedDisplacement4">
			<quad4 id="1">5,35,522,108</quad4>
			<quad4 id="2">35,36,523,522</quad4>
		</Surface>
	</Mesh>
	<Output>
		<logfile>
			<node_data data="Rx" delim=" " file="old rx.txt">5,35,36</node_data>
			<element_data data="sx" file="sx.txt"/>
		</logfile>
	</Output>
</febio_spec>
"#;
