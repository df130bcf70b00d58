//! Pit document loading.
//!
//! A pit is an XML document whose `<DataModel>` elements become
//! [`ElementDef`]s. References are expanded as each model is read, so a model
//! can only `ref` models declared before it (or pulled in through an
//! `<Include>`). `<Defaults>` apply to the whole document regardless of where
//! they appear. Tags outside the data-model vocabulary (state models, agents,
//! tests) are skipped.

use crate::build::ModelBuilder;
use crate::def::{DefKind, ElementDef, OccursDef, RelationDef};
use crate::element::{
    BlobSpec, DoubleSpec, FlagSpec, FlagsSpec, NumberSpec, PaddingSpec, StreamSpec, StringSpec,
};
use crate::error::DocumentError;
use crate::field::FieldOverride;
use crate::fixup::FixupSpec;
use crate::relation::RelationKind;
use crate::resolve::apply_overrides;
use crate::tree::DataTree;
use crate::value::{Endian, LengthType, StringEncoding, ValueType};
use log::{debug, info, warn};
use roxmltree::Node;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// A named `<Data>` set of field overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSet {
    pub name: String,
    pub fields: Vec<FieldOverride>,
}

/// A loaded document: its models and data sets, included ones under
/// `ns:Name`.
#[derive(Debug, Clone, Default)]
pub struct Pit {
    models: Vec<ElementDef>,
    data_sets: Vec<DataSet>,
}

impl Pit {
    /// Loads a pit file. Includes resolve relative to its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        load_file(path.as_ref(), &mut Vec::new())
    }

    /// Parses pit text. Includes resolve relative to the working directory.
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        parse_document(text, None, &mut Vec::new())
    }

    pub fn models(&self) -> impl Iterator<Item = &ElementDef> {
        self.models.iter()
    }

    pub fn model(&self, name: &str) -> Result<&ElementDef, DocumentError> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| DocumentError::UnknownModel(name.to_string()))
    }

    /// The last model declared in the document itself, which is what a pit
    /// without an explicit model selection means.
    pub fn default_model(&self) -> Option<&ElementDef> {
        self.models.iter().rev().find(|m| !m.name.contains(':'))
    }

    pub fn data_sets(&self) -> impl Iterator<Item = &DataSet> {
        self.data_sets.iter()
    }

    pub fn data_set(&self, name: &str) -> Result<&DataSet, DocumentError> {
        self.data_sets
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| DocumentError::UnknownDataSet(name.to_string()))
    }

    /// Builds a fresh template tree for `model`.
    pub fn build(&self, builder: &ModelBuilder<'_>, model: &str) -> Result<DataTree, DocumentError> {
        builder.build(self.model(model)?)
    }
}

fn load_file(path: &Path, stack: &mut Vec<PathBuf>) -> Result<Pit, DocumentError> {
    let text = std::fs::read_to_string(path).map_err(|source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if stack.contains(&key) {
        return Err(DocumentError::InvalidAttribute {
            path: "Include".into(),
            attribute: "src".into(),
            value: path.display().to_string(),
            reason: "include cycle".into(),
        });
    }
    stack.push(key);
    let pit = parse_document(&text, path.parent(), stack);
    stack.pop();
    let pit = pit?;
    info!(
        "loaded {:?}: {} model(s), {} data set(s)",
        path,
        pit.models.len(),
        pit.data_sets.len()
    );
    Ok(pit)
}

fn parse_document(
    text: &str,
    base: Option<&Path>,
    stack: &mut Vec<PathBuf>,
) -> Result<Pit, DocumentError> {
    let doc = roxmltree::Document::parse(text).map_err(|e| DocumentError::Xml(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "Peach" {
        return Err(DocumentError::UnknownElement {
            path: String::new(),
            tag: root.tag_name().name().to_string(),
        });
    }
    let mut loader = Loader {
        base: base.map(Path::to_path_buf),
        stack,
        defaults: Defaults::default(),
        pit: Pit::default(),
    };
    for node in elements(root).filter(|n| n.tag_name().name() == "Defaults") {
        loader.defaults.read(node)?;
    }
    for node in elements(root) {
        match node.tag_name().name() {
            "Defaults" => {}
            "Include" => loader.include(node)?,
            "DataModel" => {
                let model = loader.model(node)?;
                if loader.pit.models.iter().any(|m| m.name == model.name) {
                    return Err(DocumentError::DuplicateName {
                        path: "Peach".into(),
                        name: model.name,
                    });
                }
                loader.pit.models.push(model);
            }
            "Data" => {
                let data = loader.data_set(node)?;
                if loader.pit.data_sets.iter().any(|d| d.name == data.name) {
                    return Err(DocumentError::DuplicateName {
                        path: "Peach".into(),
                        name: data.name,
                    });
                }
                loader.pit.data_sets.push(data);
            }
            other => debug!("skipping <{other}>"),
        }
    }
    Ok(loader.pit)
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(Node::is_element)
}

const DATA_TAGS: &[&str] = &[
    "Block", "Choice", "Number", "String", "Blob", "Double", "Flags", "Flag", "Padding", "Stream",
];

/// Attributes `<Defaults>` may set, per element kind.
const DEFAULTABLE: &[(&str, &[&str])] = &[
    ("Number", &["size", "endian", "signed", "valueType"]),
    (
        "String",
        &["type", "nullTerminated", "padCharacter", "lengthType", "valueType"],
    ),
    ("Blob", &["lengthType", "valueType"]),
    ("Flags", &["size", "endian"]),
    ("Flag", &["valueType"]),
    ("Double", &["endian", "valueType"]),
];

#[derive(Debug, Default)]
struct Defaults(HashMap<String, HashMap<String, String>>);

impl Defaults {
    fn read(&mut self, node: Node<'_, '_>) -> Result<(), DocumentError> {
        for child in elements(node) {
            let tag = child.tag_name().name();
            let path = format!("Defaults.{tag}");
            let allowed = DEFAULTABLE
                .iter()
                .find(|(kind, _)| *kind == tag)
                .map(|(_, attrs)| *attrs)
                .ok_or_else(|| DocumentError::UnknownElement {
                    path: "Defaults".into(),
                    tag: tag.to_string(),
                })?;
            let entry = self.0.entry(tag.to_string()).or_default();
            for attr in child.attributes() {
                if !allowed.contains(&attr.name()) {
                    return Err(DocumentError::InvalidAttribute {
                        path,
                        attribute: attr.name().to_string(),
                        value: attr.value().to_string(),
                        reason: format!("not a default for {tag}"),
                    });
                }
                entry.insert(attr.name().to_string(), attr.value().to_string());
            }
        }
        Ok(())
    }

    fn get(&self, tag: &str) -> Option<&HashMap<String, String>> {
        self.0.get(tag)
    }
}

/// Attribute access for one node, falling back to document defaults.
struct Attrs<'a, 'input> {
    node: Node<'a, 'input>,
    path: &'a str,
    defaults: Option<&'a HashMap<String, String>>,
}

impl<'a> Attrs<'a, '_> {
    fn own(&self, name: &str) -> Option<&'a str> {
        self.node.attribute(name)
    }

    fn get(&self, name: &str) -> Option<&'a str> {
        self.own(name)
            .or_else(|| self.defaults.and_then(|d| d.get(name)).map(String::as_str))
    }

    fn required(&self, name: &str) -> Result<&'a str, DocumentError> {
        self.own(name).ok_or_else(|| DocumentError::MissingAttribute {
            path: self.path.to_string(),
            attribute: name.to_string(),
        })
    }

    fn invalid(&self, name: &str, value: &str, reason: impl Into<String>) -> DocumentError {
        DocumentError::InvalidAttribute {
            path: self.path.to_string(),
            attribute: name.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn parse<T>(
        &self,
        name: &str,
        parse: impl Fn(&str) -> Option<T>,
        expected: &str,
    ) -> Result<Option<T>, DocumentError> {
        self.get(name)
            .map(|text| parse(text).ok_or_else(|| self.invalid(name, text, format!("expected {expected}"))))
            .transpose()
    }

    fn uint(&self, name: &str) -> Result<Option<u64>, DocumentError> {
        self.parse(name, |t| t.trim().parse().ok(), "a non-negative integer")
    }

    /// A count of `unit_bits`-wide units converted to bits.
    fn scaled(&self, name: &str, unit_bits: u64) -> Result<Option<u64>, DocumentError> {
        self.uint(name)?
            .map(|count| {
                count
                    .checked_mul(unit_bits)
                    .ok_or_else(|| self.invalid(name, &count.to_string(), "too large to address in bits"))
            })
            .transpose()
    }

    fn byte_bits(&self, name: &str) -> Result<Option<u64>, DocumentError> {
        self.scaled(name, 8)
    }

    fn bool(&self, name: &str) -> Result<Option<bool>, DocumentError> {
        self.parse(
            name,
            |t| match t {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            "true or false",
        )
    }

    fn endian(&self) -> Result<Endian, DocumentError> {
        Ok(self
            .parse("endian", Endian::parse, "little, big or network")?
            .unwrap_or(Endian::Little))
    }

    fn length_type(&self) -> Result<LengthType, DocumentError> {
        Ok(self
            .parse("lengthType", LengthType::parse, "bytes, bits or chars")?
            .unwrap_or(LengthType::Bytes))
    }

    fn bounded(&self, name: &str, range: std::ops::RangeInclusive<u64>) -> Result<Option<u32>, DocumentError> {
        match self.uint(name)? {
            Some(v) if range.contains(&v) => Ok(Some(v as u32)),
            Some(v) => Err(self.invalid(
                name,
                &v.to_string(),
                format!("must be between {} and {}", range.start(), range.end()),
            )),
            None => Ok(None),
        }
    }
}

struct Loader<'s> {
    base: Option<PathBuf>,
    stack: &'s mut Vec<PathBuf>,
    defaults: Defaults,
    pit: Pit,
}

impl Loader<'_> {
    fn include(&mut self, node: Node<'_, '_>) -> Result<(), DocumentError> {
        let attrs = Attrs {
            node,
            path: "Include",
            defaults: None,
        };
        let ns = attrs.required("ns")?;
        let src = attrs.required("src")?;
        let file = src.strip_prefix("file:").unwrap_or(src);
        let path = match &self.base {
            Some(dir) => dir.join(file),
            None => PathBuf::from(file),
        };
        let included = load_file(&path, self.stack)?;
        for mut model in included.models {
            model.name = format!("{ns}:{}", model.name);
            self.pit.models.push(model);
        }
        for mut data in included.data_sets {
            data.name = format!("{ns}:{}", data.name);
            self.pit.data_sets.push(data);
        }
        Ok(())
    }

    fn model(&self, node: Node<'_, '_>) -> Result<ElementDef, DocumentError> {
        let name = node
            .attribute("name")
            .ok_or_else(|| DocumentError::MissingAttribute {
                path: "DataModel".into(),
                attribute: "name".into(),
            })?;
        self.element(node, name.to_string(), "")
    }

    fn element(
        &self,
        node: Node<'_, '_>,
        name: String,
        parent_path: &str,
    ) -> Result<ElementDef, DocumentError> {
        let tag = node.tag_name().name();
        let path = if parent_path.is_empty() {
            name.clone()
        } else {
            format!("{parent_path}.{name}")
        };
        let attrs = Attrs {
            node,
            path: &path,
            defaults: self.defaults.get(tag),
        };

        let reference = attrs.own("ref");
        let mut def = match reference {
            Some(reference) => self.referenced(tag, reference, &attrs)?,
            None => ElementDef::new(name.clone(), kind(tag, &attrs)?),
        };
        def.name = name;
        common(&mut def, &attrs)?;
        self.children(&mut def, node, &path, reference.is_some())?;
        Ok(def)
    }

    fn referenced(
        &self,
        tag: &str,
        reference: &str,
        attrs: &Attrs<'_, '_>,
    ) -> Result<ElementDef, DocumentError> {
        if !matches!(tag, "DataModel" | "Block" | "Choice") {
            return Err(attrs.invalid("ref", reference, format!("<{tag}> cannot reference a model")));
        }
        let template = self
            .pit
            .models
            .iter()
            .find(|m| m.name == reference)
            .ok_or_else(|| DocumentError::UnresolvedRef {
                path: attrs.path.to_string(),
                reference: reference.to_string(),
            })?;
        let mut def = template.clone();
        if tag == "Choice" {
            def.kind = DefKind::Choice;
        }
        Ok(def)
    }

    fn children(
        &self,
        def: &mut ElementDef,
        node: Node<'_, '_>,
        path: &str,
        with_ref: bool,
    ) -> Result<(), DocumentError> {
        let mut unnamed = 0;
        for child in elements(node) {
            let tag = child.tag_name().name();
            match tag {
                "Relation" => def.relations.push(relation(child, path)?),
                "Fixup" => def.fixup = Some(fixup(child, path)?),
                "Hint" => {
                    let attrs = Attrs {
                        node: child,
                        path,
                        defaults: None,
                    };
                    def.hints
                        .insert(attrs.required("name")?.to_string(), attrs.required("value")?.to_string());
                }
                _ if DATA_TAGS.contains(&tag) => {
                    let in_flags = matches!(def.kind, DefKind::Flags(_));
                    if !def.kind.is_container() || in_flags != (tag == "Flag") {
                        return Err(DocumentError::UnknownElement {
                            path: path.to_string(),
                            tag: tag.to_string(),
                        });
                    }
                    let named = child.attribute("name");
                    let name = match named {
                        Some(name) => name.to_string(),
                        None => unique_name(def, &mut unnamed),
                    };
                    if !with_ref && name.contains('.') {
                        return Err(DocumentError::InvalidAttribute {
                            path: path.to_string(),
                            attribute: "name".into(),
                            value: name,
                            reason: "dotted names only override parts of a ref".into(),
                        });
                    }
                    let child_def = self.element(child, name, path)?;
                    if with_ref && named.is_some() {
                        *def = apply_overrides(def, std::slice::from_ref(&child_def))?;
                    } else {
                        def.children.push(child_def);
                    }
                }
                other => {
                    return Err(DocumentError::UnknownElement {
                        path: path.to_string(),
                        tag: other.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn data_set(&self, node: Node<'_, '_>) -> Result<DataSet, DocumentError> {
        let name = node
            .attribute("name")
            .map(str::to_string)
            .unwrap_or_else(|| format!("Data_{}", self.pit.data_sets.len()));
        if let Some(file) = node.attribute("fileName") {
            warn!("data set {name}: ignoring fileName {file:?}");
        }
        let path = format!("Data.{name}");
        let mut seen = HashSet::new();
        let mut fields = Vec::new();
        for child in elements(node) {
            if child.tag_name().name() != "Field" {
                return Err(DocumentError::UnknownElement {
                    path,
                    tag: child.tag_name().name().to_string(),
                });
            }
            let attrs = Attrs {
                node: child,
                path: &path,
                defaults: None,
            };
            let field = attrs.required("name")?;
            if !seen.insert(field) {
                return Err(DocumentError::DuplicateField {
                    data: name,
                    field: field.to_string(),
                });
            }
            let value_type = attrs
                .parse("valueType", ValueType::parse, "a value type")?
                .unwrap_or_default();
            fields.push(
                FieldOverride::new(field, unescape(attrs.own("value").unwrap_or_default()))
                    .with_value_type(value_type),
            );
        }
        Ok(DataSet { name, fields })
    }
}

/// `DataElement_<n>`, skipping names already taken in `def`.
fn unique_name(def: &ElementDef, counter: &mut usize) -> String {
    loop {
        let name = format!("DataElement_{counter}");
        *counter += 1;
        if def.child(&name).is_none() {
            return name;
        }
    }
}

fn kind(tag: &str, attrs: &Attrs<'_, '_>) -> Result<DefKind, DocumentError> {
    let missing = |attribute: &str| DocumentError::MissingAttribute {
        path: attrs.path.to_string(),
        attribute: attribute.to_string(),
    };
    Ok(match tag {
        "DataModel" | "Block" => DefKind::Block,
        "Choice" => DefKind::Choice,
        "Number" => DefKind::Number(NumberSpec {
            size: attrs.bounded("size", 1..=64)?.ok_or_else(|| missing("size"))?,
            signed: attrs.bool("signed")?.unwrap_or(false),
            endian: attrs.endian()?,
        }),
        "String" => {
            let length_type = attrs.length_type()?;
            // Character lengths are checked against the widest code unit.
            if length_type != LengthType::Bits {
                attrs.scaled("length", 32)?;
            }
            DefKind::String(StringSpec {
                encoding: attrs
                    .parse("type", StringEncoding::parse, "a string type")?
                    .unwrap_or(StringEncoding::Utf8),
                length: attrs.uint("length")?,
                length_type,
                null_terminated: attrs.bool("nullTerminated")?.unwrap_or(false),
                pad_character: attrs
                    .parse(
                        "padCharacter",
                        |t| {
                            let text = unescape(t);
                            let mut chars = text.chars();
                            match (chars.next(), chars.next()) {
                                (Some(c), None) => Some(c),
                                _ => None,
                            }
                        },
                        "a single character",
                    )?
                    .unwrap_or('\0'),
            })
        }
        "Blob" => {
            let length_bits = match attrs.length_type()? {
                LengthType::Bits => attrs.uint("length")?,
                LengthType::Bytes => attrs.byte_bits("length")?,
                LengthType::Chars => {
                    return Err(attrs.invalid("lengthType", "chars", "a blob has no characters"));
                }
            };
            DefKind::Blob(BlobSpec { length_bits })
        }
        "Double" => {
            let size = match attrs.uint("size")? {
                None => 64,
                Some(size @ (32 | 64)) => size as u32,
                Some(other) => return Err(attrs.invalid("size", &other.to_string(), "must be 32 or 64")),
            };
            DefKind::Double(DoubleSpec {
                size,
                endian: attrs.endian()?,
            })
        }
        "Flags" => DefKind::Flags(FlagsSpec {
            size: attrs.bounded("size", 1..=64)?.ok_or_else(|| missing("size"))?,
            endian: attrs.endian()?,
        }),
        "Flag" => DefKind::Flag(FlagSpec {
            position: attrs.bounded("position", 0..=63)?.ok_or_else(|| missing("position"))?,
            size: attrs.bounded("size", 1..=64)?.ok_or_else(|| missing("size"))?,
        }),
        "Padding" => DefKind::Padding(PaddingSpec {
            alignment: attrs.uint("alignment")?.unwrap_or(8),
            min_size: attrs.uint("minSize")?.unwrap_or(0),
            aligned_to: attrs.own("alignedTo").map(str::to_string),
        }),
        "Stream" => DefKind::Stream(StreamSpec {
            stream_name: attrs.required("streamName")?.to_string(),
            attribute: attrs.bounded("streamAttribute", 0..=u32::MAX as u64)?.unwrap_or(0),
            length_bits: attrs.byte_bits("length")?,
            offset_bits: attrs.byte_bits("offset")?,
        }),
        other => {
            return Err(DocumentError::UnknownElement {
                path: attrs.path.to_string(),
                tag: other.to_string(),
            });
        }
    })
}

/// Attributes every data element understands.
fn common(def: &mut ElementDef, attrs: &Attrs<'_, '_>) -> Result<(), DocumentError> {
    if let Some(field_id) = attrs.own("fieldId") {
        def.field_id = Some(field_id.to_string());
    }
    if let Some(token) = attrs.bool("token")? {
        def.token = token;
    }
    if let Some(mutable) = attrs.bool("mutable")? {
        def.mutable = mutable;
    }
    if let Some(constraint) = attrs.own("constraint") {
        def.constraint = Some(constraint.to_string());
    }
    if let Some(value_type) = attrs.parse("valueType", ValueType::parse, "a value type")? {
        def.value_type = value_type;
    }
    if let Some(value) = attrs.own("value") {
        def.value = Some(unescape(value));
    }
    if let Some(occurs) = occurs(attrs)? {
        def.occurs = Some(occurs);
    }
    Ok(())
}

/// `minOccurs` alone leaves the maximum open, `occurs` alone means exactly
/// that many.
fn occurs(attrs: &Attrs<'_, '_>) -> Result<Option<OccursDef>, DocumentError> {
    let min = attrs.bounded("minOccurs", 0..=u32::MAX as u64)?;
    let max = attrs.bounded("maxOccurs", 0..=u32::MAX as u64)?;
    let count = attrs.bounded("occurs", 0..=u32::MAX as u64)?;
    if min.is_none() && max.is_none() && count.is_none() {
        return Ok(None);
    }
    let mut occurs = OccursDef::exactly(1);
    if let Some(min) = min {
        occurs.min = min;
        occurs.max = None;
        occurs.occurs = min;
    }
    if let Some(max) = max {
        occurs.max = Some(max);
    }
    if let Some(count) = count {
        occurs.occurs = count;
        if min.is_none() && max.is_none() {
            occurs.min = count;
            occurs.max = Some(count);
        }
    }
    if let Some(max) = occurs.max {
        if max < occurs.min || occurs.occurs > max {
            return Err(attrs.invalid(
                "maxOccurs",
                &max.to_string(),
                format!("below minOccurs {} or occurs {}", occurs.min, occurs.occurs),
            ));
        }
    }
    if occurs.occurs < occurs.min {
        occurs.occurs = occurs.min;
    }
    Ok(Some(occurs))
}

fn relation(node: Node<'_, '_>, path: &str) -> Result<RelationDef, DocumentError> {
    let attrs = Attrs {
        node,
        path,
        defaults: None,
    };
    let kind_text = attrs.required("type")?;
    let kind = RelationKind::parse(kind_text)
        .ok_or_else(|| attrs.invalid("type", kind_text, "expected size, count or offset"))?;
    let mut relation = RelationDef::new(kind, attrs.required("of")?);
    relation.length_type = attrs.length_type()?;
    relation.expression_get = attrs.own("expressionGet").map(str::to_string);
    relation.expression_set = attrs.own("expressionSet").map(str::to_string);
    relation.relative = attrs.bool("relative")?.unwrap_or(false);
    relation.relative_to = attrs.own("relativeTo").map(str::to_string);
    Ok(relation)
}

fn fixup(node: Node<'_, '_>, path: &str) -> Result<FixupSpec, DocumentError> {
    let attrs = Attrs {
        node,
        path,
        defaults: None,
    };
    let mut spec = FixupSpec::new(attrs.required("class")?);
    for param in elements(node) {
        if param.tag_name().name() != "Param" {
            return Err(DocumentError::UnknownElement {
                path: path.to_string(),
                tag: param.tag_name().name().to_string(),
            });
        }
        let attrs = Attrs {
            node: param,
            path,
            defaults: None,
        };
        spec = spec.with_param(attrs.required("name")?, attrs.required("value")?);
    }
    Ok(spec)
}

/// Expands `\\`, `\n`, `\r` and `\t` in attribute values.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        let escaped = match (c, chars.peek()) {
            ('\\', Some('\\')) => '\\',
            ('\\', Some('n')) => '\n',
            ('\\', Some('r')) => '\r',
            ('\\', Some('t')) => '\t',
            _ => {
                out.push(c);
                continue;
            }
        };
        chars.next();
        out.push(escaped);
    }
    out
}
