use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning a pit document into a template tree.
///
/// Every variant carries the dotted path of the offending element so a broken
/// document can be fixed without guessing.
#[derive(Error, Debug)]
pub enum DocumentError {
    /// The XML itself could not be parsed.
    #[error("Malformed document: {0}")]
    Xml(String),

    /// A document or one of its includes could not be read.
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An element tag that has no meaning inside a data model.
    #[error("{path}: unknown element <{tag}>")]
    UnknownElement { path: String, tag: String },

    /// A required attribute was not given.
    #[error("{path}: missing required attribute '{attribute}'")]
    MissingAttribute { path: String, attribute: String },

    /// An attribute value could not be interpreted.
    #[error("{path}: invalid value '{value}' for attribute '{attribute}': {reason}")]
    InvalidAttribute {
        path: String,
        attribute: String,
        value: String,
        reason: String,
    },

    /// A `ref` attribute names a template that does not exist.
    #[error("{path}: unresolved reference '{reference}'")]
    UnresolvedRef { path: String, reference: String },

    /// An override path walked into a container that has no child with that name.
    #[error("{path}: no such child '{child}'")]
    NoSuchChild { path: String, child: String },

    /// An override path continues below an element that cannot hold children.
    #[error("{path}: '{segment}' is not a container")]
    NotContainer { path: String, segment: String },

    /// An indexed path segment addresses an element that does not repeat.
    #[error("{path}: '{segment}' is not an array")]
    NotAnArray { path: String, segment: String },

    /// An array index that the array's occurrence policy cannot satisfy.
    #[error("{path}: index {index} is not valid for '{segment}': {reason}")]
    InvalidIndex {
        path: String,
        segment: String,
        index: i64,
        reason: String,
    },

    /// Two siblings ended up with the same name.
    #[error("{path}: duplicate element name '{name}'")]
    DuplicateName { path: String, name: String },

    /// Two flag sub-ranges claim the same bits.
    #[error("{path}: flag '{first}' overlaps flag '{second}'")]
    FlagOverlap {
        path: String,
        first: String,
        second: String,
    },

    /// A flag sub-range reaches past the end of its container.
    #[error("{path}: flag '{flag}' at position {position} with size {size} exceeds {container} bits")]
    FlagOutOfRange {
        path: String,
        flag: String,
        position: u32,
        size: u32,
        container: u32,
    },

    /// A padding `alignedTo` anchor that names nothing in the tree.
    #[error("{path}: unresolved padding anchor '{anchor}'")]
    UnresolvedAnchor { path: String, anchor: String },

    /// A relation `of` (or `relativeTo`) that names nothing in the tree.
    #[error("{path}: unresolved relation target '{of}'")]
    UnresolvedRelation { path: String, of: String },

    /// A literal value that does not fit the element it belongs to.
    #[error("{path}: invalid value: {reason}")]
    InvalidValue { path: String, reason: String },

    /// A fixup class that no registered fixup answers to.
    #[error("{path}: unknown fixup class '{class}'")]
    UnknownFixup { path: String, class: String },

    /// A data set lists the same field twice.
    #[error("Data set '{data}' sets field '{field}' more than once")]
    DuplicateField { data: String, field: String },

    /// No data model with the requested name.
    #[error("Unknown data model '{0}'")]
    UnknownModel(String),

    /// No data set with the requested name.
    #[error("Unknown data set '{0}'")]
    UnknownDataSet(String),

    /// A literal expression failed to evaluate.
    #[error("{path}: expression failed: {source}")]
    Script {
        path: String,
        #[source]
        source: ScriptError,
    },
}

/// Per-run failures while producing bytes from a tree.
#[derive(Error, Debug)]
pub enum RenderError {
    /// A choice is rendered before any alternative was selected.
    #[error("{path}: choice has no selected alternative")]
    NoSelection { path: String },

    /// A value could not be encoded into its element.
    #[error("{path}: {source}")]
    Value {
        path: String,
        #[source]
        source: ValueError,
    },

    /// A relation cannot be computed for its target.
    #[error("{path}: relation cannot be computed: {reason}")]
    Relation { path: String, reason: String },

    /// Relation values kept changing the layout after the second pass.
    #[error("{path}: relation value length did not settle")]
    UnstableLength { path: String },

    /// A padding anchor is missing or lies after the padding.
    #[error("{path}: padding anchor '{anchor}' has not been rendered before the padding")]
    Anchor { path: String, anchor: String },

    /// A stream's content does not fit its declared length or offset.
    #[error("{path}: stream layout: {reason}")]
    Stream { path: String, reason: String },

    /// A fixup failed or changed its element's length.
    #[error("{path}: fixup failed: {source}")]
    Fixup {
        path: String,
        #[source]
        source: FixupError,
    },

    /// A relation expression failed.
    #[error("{path}: expression failed: {source}")]
    Script {
        path: String,
        #[source]
        source: ScriptError,
    },
}

/// Why a crack attempt failed at a given element.
#[derive(Error, Debug)]
pub enum CrackFailure {
    /// Fewer bits remain than the element needs.
    #[error("needed {needed} bits but only {available} remain")]
    OutOfData { needed: u64, available: u64 },

    /// An unsized element whose length could not be inferred from what follows it.
    #[error("unable to determine element size")]
    Unsized,

    /// A token element did not match its declared value.
    #[error("token mismatch: expected {expected}, found {found}")]
    TokenMismatch { expected: String, found: String },

    /// A constraint expression evaluated to false.
    #[error("constraint '{expression}' not satisfied")]
    ConstraintFailed { expression: String },

    /// None of a choice's alternatives parsed.
    #[error("no alternative of {tried} matched")]
    NoMatchingAlternative {
        tried: usize,
        #[source]
        deepest: Option<Box<CrackError>>,
    },

    /// An array produced fewer instances than its minimum.
    #[error("only cracked {found} of {min} array entries")]
    ArrayTooShort { min: u32, found: u32 },

    /// A count relation gave a value outside the array's bounds.
    #[error("count {count} is outside the allowed range {min}..={max}")]
    CountOutOfRange { count: u64, min: u32, max: u32 },

    /// An offset relation places an element before the current position.
    #[error("offset places element at bit {target}, behind the current position")]
    OffsetBehind { target: u64 },

    /// A cracked relation value cannot be turned into a length, count or offset.
    #[error("invalid relation value: {0}")]
    InvalidRelationValue(String),

    /// Bits were left over after the model was fully cracked.
    #[error("{remaining} trailing bits after the model")]
    TrailingData { remaining: u64 },

    /// A padding anchor that has not been cracked yet.
    #[error("padding anchor '{0}' has not been cracked")]
    Anchor(String),

    /// Raw bits could not be decoded as the element's value.
    #[error(transparent)]
    Value(#[from] ValueError),

    /// A constraint or relation expression failed to evaluate.
    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// A structural mismatch found while cracking.
///
/// `path` is the deepest element that failed, `bit_offset` the absolute input
/// position at which it failed.
#[derive(Error, Debug)]
#[error("{path} at byte {byte_offset} (bit {bit_offset}): {kind}", byte_offset = .bit_offset / 8)]
pub struct CrackError {
    pub path: String,
    pub bit_offset: u64,
    #[source]
    pub kind: CrackFailure,
}

impl CrackError {
    pub fn new(path: impl Into<String>, bit_offset: u64, kind: CrackFailure) -> Self {
        Self {
            path: path.into(),
            bit_offset,
            kind,
        }
    }
}

/// Problems converting between text, typed values and bits.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    /// A number does not fit the declared width and signedness.
    #[error("{value} does not fit in {size} {signedness} bits")]
    OutOfRange {
        value: i128,
        size: u32,
        signedness: &'static str,
    },

    /// Text that cannot be read as the requested value type.
    #[error("cannot parse '{text}' as {expected}")]
    Parse { text: String, expected: &'static str },

    /// A value of the wrong shape for the element.
    #[error("expected {expected}, found {found}")]
    Mismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Bytes that are not valid in the string's encoding.
    #[error("invalid {encoding} data")]
    Encoding { encoding: &'static str },

    /// A literal longer than the declared length.
    #[error("value of {actual} bits is longer than the declared {declared} bits")]
    TooLong { actual: u64, declared: u64 },
}

/// Failures from the expression evaluator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    /// The expression text is not well formed.
    #[error("syntax error in '{expression}' at {position}: {reason}")]
    Syntax {
        expression: String,
        position: usize,
        reason: String,
    },

    /// A name that is not bound in the current scope.
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    /// A function name the evaluator does not provide.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// An operator applied to values it does not support.
    #[error("cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: String,
        left: &'static str,
        right: &'static str,
    },

    /// Integer division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Arithmetic left the supported integer range.
    #[error("integer overflow")]
    Overflow,
}

/// Failures from a fixup.
#[derive(Error, Debug)]
pub enum FixupError {
    /// No fixup is registered under the class name.
    #[error("unknown fixup class '{0}'")]
    UnknownClass(String),

    /// A required parameter was not given.
    #[error("missing parameter '{0}'")]
    MissingParam(String),

    /// A parameter value could not be used.
    #[error("invalid parameter '{name}' = '{value}'")]
    InvalidParam { name: String, value: String },

    /// A `ref` parameter names nothing that was rendered.
    #[error("unresolved reference '{0}'")]
    UnresolvedRef(String),

    /// The fixup produced a value of a different length than its element.
    #[error("fixup changed length from {before} to {after} bits")]
    LengthChanged { before: u64, after: u64 },
}

/// Umbrella error for callers that drive the whole engine.
#[derive(Error, Debug)]
pub enum PitError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
    #[error("Crack error: {0}")]
    Crack(#[from] CrackError),
    #[error("Expression error: {0}")]
    Script(#[from] ScriptError),
    #[error("Fixup error: {0}")]
    Fixup(#[from] FixupError),
}
