pub mod array;
pub mod bits;
pub mod build;
pub mod choice;
pub mod config;
pub mod crack;
pub mod def;
pub mod element;
pub mod error;
pub mod field;
pub mod fixup;
pub mod flags;
pub mod mutability;
pub mod padding;
pub mod pit;
pub mod relation;
pub mod render;
pub mod resolve;
pub mod script;
pub mod snapshot;
pub mod tree;
pub mod value;

pub use bits::{BitBuffer, BitReader};
pub use build::{ModelBuilder, build_model};
pub use config::PitforgeConfig;
pub use crack::{CrackOutcome, CrackSettings, Cracker, crack};
pub use def::{DefKind, ElementDef, OccursDef, RelationDef};
pub use element::{Element, ElementId, ElementKind};
pub use error::{CrackError, CrackFailure, DocumentError, FixupError, PitError, RenderError, ScriptError, ValueError};
pub use field::{FieldOverride, apply_data_set, apply_field};
pub use fixup::{Fixup, FixupRegistry, FixupSpec};
pub use mutability::{MutabilityAction, MutabilityRule, Weight, apply_rules};
pub use pit::{DataSet, Pit};
pub use relation::{Relation, RelationKind};
pub use render::{NamedStream, Rendered, Renderer, render};
pub use script::{Evaluator, ExprEvaluator, Scope};
pub use snapshot::TreeSnapshot;
pub use tree::DataTree;
pub use value::Value;
